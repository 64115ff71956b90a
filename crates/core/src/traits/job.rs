use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::models::{JobInfo, JobResult};
use crate::SchedulerResult;

/// 作业运行时可见的上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobExecutionContext {
    pub job_id: String,
    pub job_type_id: String,
    pub context_path: String,
    pub parameters: BTreeMap<String, String>,
    pub trigger: Option<String>,
    pub queued_at: DateTime<Utc>,
}

impl JobExecutionContext {
    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

impl From<&JobInfo> for JobExecutionContext {
    fn from(info: &JobInfo) -> Self {
        Self {
            job_id: info.job_id.clone(),
            job_type_id: info.job_type_id.clone(),
            context_path: info.context_path.clone(),
            parameters: info.parameters.clone(),
            trigger: info.queue_trigger.clone(),
            queued_at: info.queue_timestamp,
        }
    }
}

/// 可执行的作业。
///
/// 取消是协作式的：作业需要自己观察 `cancel`，核心无法强制终止失控的作业。
/// 作业实现必须是幂等的，同一作业可能被重复投递。
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: &JobExecutionContext, cancel: CancellationToken) -> JobResult;
}

/// 作业提供者：按作业类型创建作业实例
pub trait JobProvider: Send + Sync {
    fn provided_types(&self) -> Vec<String>;

    fn create_job(
        &self,
        type_id: &str,
        ctx: &JobExecutionContext,
    ) -> SchedulerResult<Box<dyn Job>>;

    fn provides(&self, type_id: &str) -> bool {
        self.provided_types().iter().any(|t| t == type_id)
    }
}

/// 按作业类型查找提供者
pub trait JobProviderLookup: Send + Sync {
    fn find_provider(&self, type_id: &str) -> Option<std::sync::Arc<dyn JobProvider>>;

    fn has_provider(&self, type_id: &str) -> bool {
        self.find_provider(type_id).is_some()
    }
}
