use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 作业生命周期状态
///
/// NONE → WAITING → RUNNING → {NONE | ABORTING → NONE}
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    #[default]
    None,
    Waiting,
    Running,
    Aborting,
}

impl JobState {
    /// 任何状态都可以回到 NONE（完成、取消或清理强制复位）
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (None, Waiting) | (Waiting, Running) | (Waiting, Aborting) | (Running, Aborting) | (_, None)
        )
    }

    pub fn is_active(self) -> bool {
        !matches!(self, JobState::None)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::None => "NONE",
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Aborting => "ABORTING",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Error,
    Cancel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResult {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

impl JobResult {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            severity,
            message: message.into(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(Severity::Ok, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Severity::Cancel, message)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.severity, Severity::Ok | Severity::Info)
    }

    /// 按字符截断消息
    pub fn capped(mut self, max_len: usize) -> Self {
        if self.message.chars().count() > max_len {
            self.message = self.message.chars().take(max_len).collect();
        }
        self
    }
}

/// 协调存储中持久化的作业记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRecord {
    pub id: String,
    pub type_id: String,
    pub context_path: String,
    pub state: JobState,
    /// ACTIVE 标记：作业已被交给某个Worker
    pub active: bool,
    pub last_start: Option<DateTime<Utc>>,
    pub last_queued: Option<DateTime<Utc>>,
    pub last_queued_trigger: Option<String>,
    pub last_cancelled: Option<DateTime<Utc>>,
    pub last_cancelled_trigger: Option<String>,
    pub last_result: Option<JobResult>,
    pub parameters: BTreeMap<String, String>,
}

impl JobRecord {
    pub fn new(
        id: impl Into<String>,
        type_id: impl Into<String>,
        context_path: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            type_id: type_id.into(),
            context_path: context_path.into(),
            state: JobState::None,
            active: false,
            last_start: None,
            last_queued: None,
            last_queued_trigger: None,
            last_cancelled: None,
            last_cancelled_trigger: None,
            last_result: None,
            parameters: BTreeMap::new(),
        }
    }

    /// 最近一次活动时间：max(结果时间, 入队时间, 启动时间)
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        [
            self.last_result.as_ref().map(|r| r.timestamp),
            self.last_queued,
            self.last_start,
        ]
        .into_iter()
        .flatten()
        .max()
    }

    /// 启发式卡死检测。
    ///
    /// WAITING 从入队时间计，RUNNING 从启动时间计，超过阈值即视为卡死。
    /// 一个只是很慢（长时间GC、慢IO）而非已死的Worker也会被判定为卡死，
    /// 复位后作业可能被重复执行；这是已知的竞争，不是保证。
    pub fn is_stuck(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let since = match self.state {
            JobState::Waiting => self.last_queued,
            JobState::Running => self.last_start.or(self.last_queued),
            _ => return false,
        };
        match since {
            Some(t) => now - t > threshold,
            // 没有时间戳的活动状态无法判断，按卡死处理
            None => true,
        }
    }
}

/// 单条作业历史
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub result: JobResult,
    pub queued_trigger: Option<String>,
    pub cancelled_trigger: Option<String>,
    /// 插入序号，时间戳相同时用于排序
    #[serde(default)]
    pub sequence: u64,
}

impl JobHistoryEntry {
    pub fn new(result: JobResult) -> Self {
        Self {
            timestamp: result.timestamp,
            result,
            queued_trigger: None,
            cancelled_trigger: None,
            sequence: 0,
        }
    }

    fn sort_key(&self) -> (DateTime<Utc>, u64) {
        (self.timestamp, self.sequence)
    }
}

/// 有容量上限、按时间排序的历史集合
#[derive(Debug, Clone)]
pub struct JobHistory {
    entries: Vec<JobHistoryEntry>,
    max_entries: usize,
    max_message_length: usize,
    next_sequence: u64,
}

impl JobHistory {
    pub const DEFAULT_MAX_ENTRIES: usize = 120;
    pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 2000;

    pub fn new(max_entries: usize, max_message_length: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries: max_entries.max(1),
            max_message_length,
            next_sequence: 0,
        }
    }

    /// 从已有条目恢复（顺序无关）。超出上限的最旧条目作为第二个返回值。
    pub fn from_entries(
        entries: Vec<JobHistoryEntry>,
        max_entries: usize,
        max_message_length: usize,
    ) -> (Self, Vec<JobHistoryEntry>) {
        let mut history = Self::new(max_entries, max_message_length);
        history.entries = entries;
        history.entries.sort_by_key(|e| e.sort_key());
        history.next_sequence = history
            .entries
            .iter()
            .map(|e| e.sequence + 1)
            .max()
            .unwrap_or(0);
        let evicted = history.evict();
        (history, evicted)
    }

    /// 插入新条目，返回被淘汰的最旧条目
    pub fn insert(&mut self, mut entry: JobHistoryEntry) -> Vec<JobHistoryEntry> {
        entry.result = entry.result.capped(self.max_message_length);
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;
        let key = entry.sort_key();
        let pos = self.entries.partition_point(|e| e.sort_key() <= key);
        self.entries.insert(pos, entry);
        self.evict()
    }

    fn evict(&mut self) -> Vec<JobHistoryEntry> {
        if self.entries.len() <= self.max_entries {
            return Vec::new();
        }
        let overflow = self.entries.len() - self.max_entries;
        self.entries.drain(..overflow).collect()
    }

    pub fn entries(&self) -> &[JobHistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&JobHistoryEntry> {
        self.entries.last()
    }
}

impl Default for JobHistory {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ENTRIES, Self::DEFAULT_MAX_MESSAGE_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_at(secs: i64, msg: &str) -> JobHistoryEntry {
        let mut result = JobResult::ok(msg);
        result.timestamp = DateTime::from_timestamp(secs, 0).unwrap();
        JobHistoryEntry::new(result)
    }

    #[test]
    fn test_state_machine() {
        use JobState::*;
        assert!(None.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Running));
        assert!(Running.can_transition_to(None));
        assert!(Running.can_transition_to(Aborting));
        assert!(Aborting.can_transition_to(None));
        assert!(!None.can_transition_to(Running));
        assert!(!Aborting.can_transition_to(Running));
        assert!(!None.can_transition_to(Aborting));
    }

    #[test]
    fn test_state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&JobState::Aborting).unwrap(), "\"ABORTING\"");
    }

    #[test]
    fn test_last_activity_is_max() {
        let mut record = JobRecord::new("j", "t", "/");
        assert!(record.last_activity().is_none());
        let t1 = DateTime::from_timestamp(100, 0).unwrap();
        let t2 = DateTime::from_timestamp(200, 0).unwrap();
        let t3 = DateTime::from_timestamp(150, 0).unwrap();
        record.last_queued = Some(t1);
        record.last_start = Some(t3);
        let mut result = JobResult::ok("done");
        result.timestamp = t2;
        record.last_result = Some(result);
        assert_eq!(record.last_activity(), Some(t2));
    }

    #[test]
    fn test_stuck_detection_only_for_waiting_and_running() {
        let now = Utc::now();
        let threshold = Duration::hours(2);
        let mut record = JobRecord::new("j", "t", "/");
        record.last_queued = Some(now - Duration::hours(3));
        assert!(!record.is_stuck(now, threshold));

        record.state = JobState::Waiting;
        assert!(record.is_stuck(now, threshold));

        record.state = JobState::Running;
        record.last_start = Some(now - Duration::minutes(5));
        assert!(!record.is_stuck(now, threshold));

        // 慢而未死的Worker同样会被判定为卡死
        record.last_start = Some(now - Duration::hours(2) - Duration::seconds(1));
        assert!(record.is_stuck(now, threshold));

        record.state = JobState::Aborting;
        assert!(!record.is_stuck(now, threshold));
    }

    #[test]
    fn test_history_never_exceeds_cap_and_evicts_oldest() {
        let mut history = JobHistory::new(3, 100);
        assert!(history.insert(entry_at(10, "a")).is_empty());
        assert!(history.insert(entry_at(30, "c")).is_empty());
        assert!(history.insert(entry_at(20, "b")).is_empty());
        let evicted = history.insert(entry_at(40, "d"));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].result.message, "a");
        assert_eq!(history.len(), 3);

        // an entry older than everything is evicted immediately
        let evicted = history.insert(entry_at(5, "old"));
        assert_eq!(evicted[0].result.message, "old");
        let messages: Vec<_> = history.entries().iter().map(|e| e.result.message.as_str()).collect();
        assert_eq!(messages, vec!["b", "c", "d"]);
    }

    #[test]
    fn test_history_ties_broken_by_insertion() {
        let mut history = JobHistory::new(2, 100);
        history.insert(entry_at(10, "first"));
        history.insert(entry_at(10, "second"));
        let evicted = history.insert(entry_at(10, "third"));
        assert_eq!(evicted[0].result.message, "first");
        assert_eq!(history.latest().unwrap().result.message, "third");
    }

    #[test]
    fn test_history_caps_message_length() {
        let mut history = JobHistory::new(5, 4);
        history.insert(entry_at(1, "abcdefgh"));
        assert_eq!(history.entries()[0].result.message, "abcd");
    }

    #[test]
    fn test_from_entries_evicts_overflow() {
        let entries = (0..5).map(|i| entry_at(i, &i.to_string())).collect();
        let (history, evicted) = JobHistory::from_entries(entries, 3, 100);
        assert_eq!(history.len(), 3);
        assert_eq!(evicted.len(), 2);
        assert_eq!(evicted[0].result.message, "0");
        assert_eq!(evicted[1].result.message, "1");
    }
}
