//! 作业记录与作业历史的持久化
//!
//! 作业记录：`/gyrex/jobs/contexts/{ctx}/jobs/{job}`，JSON。
//! 历史条目：`/gyrex/jobs/contexts/{ctx}/history/{job}/entry-{seq}`，JSON，顺序节点。
//!
//! 普通的Worker状态更新不做版本校验：Worker假定自己是所执行作业的
//! RUNNING/NONE 转换的唯一写入者（协作式约定，没有强制）。

use std::sync::Arc;

use scheduler_core::ids::{decode_node_name, encode_node_name};
use scheduler_core::models::{JobHistory, JobHistoryEntry, JobRecord, JobState};
use scheduler_core::paths;
use scheduler_core::traits::{optional, CoordinationStore, CreateMode};
use scheduler_core::{SchedulerError, SchedulerResult};
use tracing::{debug, warn};

const HISTORY_ENTRY_PREFIX: &str = "entry-";

/// 带存储版本的作业记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub record: JobRecord,
    pub version: i32,
}

#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn CoordinationStore>,
    max_history_entries: usize,
    max_message_length: usize,
}

impl JobStore {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_history_limits(
            store,
            JobHistory::DEFAULT_MAX_ENTRIES,
            JobHistory::DEFAULT_MAX_MESSAGE_LENGTH,
        )
    }

    pub fn with_history_limits(
        store: Arc<dyn CoordinationStore>,
        max_history_entries: usize,
        max_message_length: usize,
    ) -> Self {
        Self {
            store,
            max_history_entries: max_history_entries.max(1),
            max_message_length,
        }
    }

    pub fn coordination_store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// 清理时使用的单作业锁名称
    pub fn job_lock_name(context_path: &str, job_id: &str) -> String {
        format!(
            "gyrex.jobs.job/{}/{}",
            encode_node_name(context_path),
            encode_node_name(job_id)
        )
    }

    pub async fn get(&self, context_path: &str, job_id: &str) -> SchedulerResult<Option<VersionedRecord>> {
        let path = paths::job_path(context_path, job_id);
        let Some((bytes, stat)) = optional(self.store.read_record(&path).await)? else {
            return Ok(None);
        };
        let record: JobRecord = serde_json::from_slice(&bytes)?;
        Ok(Some(VersionedRecord {
            record,
            version: stat.version,
        }))
    }

    /// 记录不存在时创建；已存在返回 false
    pub async fn create_if_missing(&self, record: &JobRecord) -> SchedulerResult<bool> {
        let path = paths::job_path(&record.context_path, &record.id);
        let data = serde_json::to_vec(record)?;
        match self.store.create_path(&path, CreateMode::Persistent, data).await {
            Ok(_) => {
                debug!("创建作业记录: {}", record.id);
                Ok(true)
            }
            Err(SchedulerError::Store(e)) if e.is_node_exists() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 写入记录。`expected_version` 为 None 时是普通覆盖写入，节点缺失时创建。
    pub async fn put(&self, record: &JobRecord, expected_version: Option<i32>) -> SchedulerResult<i32> {
        let path = paths::job_path(&record.context_path, &record.id);
        let data = serde_json::to_vec(record)?;
        match self.store.write_record(&path, data.clone(), expected_version).await {
            Ok(stat) => Ok(stat.version),
            Err(e) if e.is_no_node() && expected_version.is_none() => {
                match self.store.create_path(&path, CreateMode::Persistent, data).await {
                    Ok(_) => Ok(0),
                    // 并发创建，回到普通覆盖写入
                    Err(SchedulerError::Store(e)) if e.is_node_exists() => {
                        let data = serde_json::to_vec(record)?;
                        Ok(self.store.write_record(&path, data, None).await?.version)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// 读取-修改-写入。记录不存在时返回 None。
    pub async fn update<F>(&self, context_path: &str, job_id: &str, f: F) -> SchedulerResult<Option<JobRecord>>
    where
        F: FnOnce(&mut JobRecord),
    {
        let Some(VersionedRecord { mut record, .. }) = self.get(context_path, job_id).await? else {
            return Ok(None);
        };
        f(&mut record);
        self.put(&record, None).await?;
        Ok(Some(record))
    }

    pub async fn set_state(
        &self,
        context_path: &str,
        job_id: &str,
        state: JobState,
    ) -> SchedulerResult<Option<JobRecord>> {
        self.update(context_path, job_id, |record| {
            if !record.state.can_transition_to(state) && record.state != state {
                warn!(
                    "作业 {} 非常规状态转换: {} -> {}",
                    record.id, record.state, state
                );
            }
            record.state = state;
            if state == JobState::None {
                record.active = false;
            }
        })
        .await
    }

    /// 存在作业记录的上下文路径
    pub async fn list_contexts(&self) -> SchedulerResult<Vec<String>> {
        let names = optional(self.store.read_children_names(paths::CONTEXTS_ROOT).await)?
            .unwrap_or_default();
        names.iter().map(|n| decode_node_name(n)).collect()
    }

    pub async fn list_job_ids(&self, context_path: &str) -> SchedulerResult<Vec<String>> {
        let names = optional(
            self.store
                .read_children_names(&paths::jobs_path(context_path))
                .await,
        )?
        .unwrap_or_default();
        names.iter().map(|n| decode_node_name(n)).collect()
    }

    pub async fn list_records(&self, context_path: &str) -> SchedulerResult<Vec<JobRecord>> {
        let mut records = Vec::new();
        for job_id in self.list_job_ids(context_path).await? {
            if let Some(v) = self.get(context_path, &job_id).await? {
                records.push(v.record);
            }
        }
        Ok(records)
    }

    /// 追加历史条目并淘汰超出上限的最旧条目（内存与存储两侧）
    pub async fn add_history(
        &self,
        context_path: &str,
        job_id: &str,
        entry: JobHistoryEntry,
    ) -> SchedulerResult<JobHistory> {
        let dir = paths::history_path(context_path, job_id);
        let mut entry = entry;
        entry.result = entry.result.capped(self.max_message_length);
        let data = serde_json::to_vec(&entry)?;
        self.store
            .create_path(
                &paths::join(&dir, HISTORY_ENTRY_PREFIX),
                CreateMode::PersistentSequential,
                data,
            )
            .await?;

        let (history, evicted) = JobHistory::from_entries(
            self.read_history_entries(&dir).await?,
            self.max_history_entries,
            self.max_message_length,
        );
        for old in evicted {
            let path = paths::join(&dir, &history_node_name(old.sequence));
            match self.store.delete_path(&path, None).await {
                Ok(()) => {}
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(history)
    }

    pub async fn get_history(&self, context_path: &str, job_id: &str) -> SchedulerResult<JobHistory> {
        let dir = paths::history_path(context_path, job_id);
        let (history, _) = JobHistory::from_entries(
            self.read_history_entries(&dir).await?,
            self.max_history_entries,
            self.max_message_length,
        );
        Ok(history)
    }

    async fn read_history_entries(&self, dir: &str) -> SchedulerResult<Vec<JobHistoryEntry>> {
        let names = optional(self.store.read_children_names(dir).await)?.unwrap_or_default();
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let Some(sequence) = parse_history_sequence(&name) else {
                warn!("忽略无法识别的历史节点: {}/{}", dir, name);
                continue;
            };
            let Some((bytes, _)) = optional(self.store.read_record(&paths::join(dir, &name)).await)? else {
                continue;
            };
            let mut entry: JobHistoryEntry = serde_json::from_slice(&bytes)?;
            // 顺序号以节点名为准，时间戳相同时按插入顺序排序
            entry.sequence = sequence;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// 删除作业记录及其历史子树，每次删除后刷新
    pub async fn remove(&self, context_path: &str, job_id: &str) -> SchedulerResult<()> {
        let job = paths::job_path(context_path, job_id);
        match self.store.delete_path(&job, None).await {
            Ok(()) => {}
            Err(e) if e.is_no_node() => {}
            Err(e) => return Err(e),
        }
        self.store.sync(&job).await?;

        let history = paths::history_path(context_path, job_id);
        match self.store.delete_path(&history, None).await {
            Ok(()) => {}
            Err(e) if e.is_no_node() => {}
            Err(e) => return Err(e),
        }
        self.store.sync(&history).await?;
        debug!("删除作业及其历史: {}", job_id);
        Ok(())
    }

    pub async fn sync_jobs(&self) -> SchedulerResult<()> {
        self.store.sync(paths::CONTEXTS_ROOT).await
    }
}

fn history_node_name(sequence: u64) -> String {
    format!("{HISTORY_ENTRY_PREFIX}{sequence:010}")
}

fn parse_history_sequence(name: &str) -> Option<u64> {
    name.strip_prefix(HISTORY_ENTRY_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;
    use chrono::{DateTime, Utc};
    use scheduler_core::models::JobResult;

    fn store() -> JobStore {
        JobStore::with_history_limits(Arc::new(InMemoryCoordinationStore::new()), 3, 10)
    }

    fn entry_at(secs: i64, msg: &str) -> JobHistoryEntry {
        let mut result = JobResult::ok(msg);
        result.timestamp = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
        JobHistoryEntry::new(result)
    }

    #[tokio::test]
    async fn test_create_get_put() {
        let jobs = store();
        let record = JobRecord::new("job.1", "report", "/tenant");
        assert!(jobs.create_if_missing(&record).await.unwrap());
        assert!(!jobs.create_if_missing(&record).await.unwrap());

        let loaded = jobs.get("/tenant", "job.1").await.unwrap().unwrap();
        assert_eq!(loaded.record, record);
        assert_eq!(loaded.version, 0);

        let mut changed = loaded.record.clone();
        changed.state = JobState::Waiting;
        assert_eq!(jobs.put(&changed, Some(0)).await.unwrap(), 1);
        assert!(jobs.put(&changed, Some(0)).await.unwrap_err().is_contention());

        assert_eq!(jobs.list_contexts().await.unwrap(), vec!["/tenant"]);
        assert_eq!(jobs.list_job_ids("/tenant").await.unwrap(), vec!["job.1"]);
        assert!(jobs.get("/tenant", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_plain_put_creates_missing() {
        let jobs = store();
        let record = JobRecord::new("j", "t", "/");
        jobs.put(&record, None).await.unwrap();
        assert!(jobs.get("/", "j").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_set_state_none_clears_active() {
        let jobs = store();
        let mut record = JobRecord::new("j", "t", "/");
        record.state = JobState::Running;
        record.active = true;
        jobs.put(&record, None).await.unwrap();

        let updated = jobs.set_state("/", "j", JobState::None).await.unwrap().unwrap();
        assert_eq!(updated.state, JobState::None);
        assert!(!updated.active);
        assert!(jobs.set_state("/", "missing", JobState::None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_cap_applies_to_store() {
        let jobs = store();
        for (secs, msg) in [(10, "a"), (30, "c"), (20, "b"), (40, "d")] {
            jobs.add_history("/", "j", entry_at(secs, msg)).await.unwrap();
        }
        let history = jobs.get_history("/", "j").await.unwrap();
        let messages: Vec<_> = history.entries().iter().map(|e| e.result.message.clone()).collect();
        assert_eq!(messages, vec!["b", "c", "d"]);

        let dir = paths::history_path("/", "j");
        let names = jobs.coordination_store().read_children_names(&dir).await.unwrap();
        assert_eq!(names.len(), 3);
    }

    #[tokio::test]
    async fn test_history_message_capped() {
        let jobs = store();
        let history = jobs
            .add_history("/", "j", entry_at(1, "0123456789abcdef"))
            .await
            .unwrap();
        assert_eq!(history.latest().unwrap().result.message, "0123456789");
    }

    #[tokio::test]
    async fn test_remove_deletes_job_and_history() {
        let jobs = store();
        let record = JobRecord::new("j", "t", "/");
        jobs.create_if_missing(&record).await.unwrap();
        jobs.add_history("/", "j", entry_at(1, "x")).await.unwrap();

        jobs.remove("/", "j").await.unwrap();
        assert!(jobs.get("/", "j").await.unwrap().is_none());
        assert!(jobs.get_history("/", "j").await.unwrap().is_empty());
        // 重复删除是幂等的
        jobs.remove("/", "j").await.unwrap();
    }
}
