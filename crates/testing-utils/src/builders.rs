//! 带合理默认值的测试数据构建器

use chrono::{DateTime, Duration, Utc};
use scheduler_core::models::{JobRecord, JobResult, JobState, ScheduleDefinition, ScheduleEntry};

/// 作业记录构建器
pub struct JobRecordBuilder {
    record: JobRecord,
}

impl JobRecordBuilder {
    pub fn new(job_id: &str) -> Self {
        Self {
            record: JobRecord::new(job_id, "test.job", "/"),
        }
    }

    pub fn with_type(mut self, type_id: &str) -> Self {
        self.record.type_id = type_id.to_string();
        self
    }

    pub fn in_context(mut self, context_path: &str) -> Self {
        self.record.context_path = context_path.to_string();
        self
    }

    /// 活动状态同时设置 ACTIVE 标记
    pub fn with_state(mut self, state: JobState) -> Self {
        self.record.state = state;
        self.record.active = state.is_active();
        self
    }

    pub fn queued_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.last_queued = Some(at);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.last_start = Some(at);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        let mut result = JobResult::ok("完成");
        result.timestamp = at;
        self.record.last_result = Some(result);
        self
    }

    /// 最近一次活动发生在 `age` 之前
    pub fn idle_for(self, age: Duration) -> Self {
        let at = Utc::now() - age;
        self.queued_at(at).started_at(at).finished_at(at)
    }

    pub fn with_parameter(mut self, key: &str, value: &str) -> Self {
        self.record.parameters.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> JobRecord {
        self.record
    }
}

/// 调度定义构建器
pub struct ScheduleBuilder {
    schedule: ScheduleDefinition,
}

impl ScheduleBuilder {
    /// `id` 必须是合法标识符
    pub fn new(id: &str) -> Self {
        let schedule = ScheduleDefinition::new(id).unwrap_or_else(|e| panic!("测试调度ID无效: {e}"));
        Self { schedule }
    }

    pub fn timezone(mut self, timezone: &str) -> Self {
        self.schedule.timezone = timezone.to_string();
        self
    }

    pub fn queue(mut self, queue_id: &str) -> Self {
        self.schedule.queue_id = Some(queue_id.to_string());
        self
    }

    pub fn enabled(mut self) -> Self {
        self.schedule.enabled = true;
        self
    }

    pub fn entry(mut self, entry_id: &str, cron: &str, job_type: &str) -> Self {
        let entry = ScheduleEntry::new(entry_id, cron, job_type)
            .unwrap_or_else(|e| panic!("测试条目无效: {e}"));
        self.schedule.entries.insert(entry.id.clone(), entry);
        self
    }

    pub fn build(self) -> ScheduleDefinition {
        self.schedule
    }
}
