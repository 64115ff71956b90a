use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use scheduler_core::ids::{validate_context_path, validate_id};
use scheduler_core::models::{JobHistory, JobInfo, JobRecord, JobState};
use scheduler_core::traits::QueueService;
use scheduler_core::{SchedulerError, SchedulerResult};
use tracing::{info, warn};

use crate::job_store::{JobStore, VersionedRecord};

/// 入队请求
#[derive(Debug, Clone)]
pub struct QueueJobRequest {
    pub job_id: String,
    pub job_type_id: String,
    pub context_path: String,
    pub parameters: BTreeMap<String, String>,
    /// None 表示默认队列
    pub queue_id: Option<String>,
    pub trigger: Option<String>,
    /// 入队时间，None 时取当前时间
    pub queued_at: Option<DateTime<Utc>>,
}

impl QueueJobRequest {
    pub fn new(
        job_id: impl Into<String>,
        job_type_id: impl Into<String>,
        context_path: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_type_id: job_type_id.into(),
            context_path: context_path.into(),
            parameters: BTreeMap::new(),
            queue_id: None,
            trigger: None,
            queued_at: None,
        }
    }

    pub fn with_parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_queue(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn queued_at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.queued_at = Some(timestamp);
        self
    }
}

/// 作业管理：入队、取消和查询
#[derive(Clone)]
pub struct JobManager {
    jobs: JobStore,
    queues: Arc<dyn QueueService>,
    default_queue_id: String,
}

impl JobManager {
    pub fn new(jobs: JobStore, queues: Arc<dyn QueueService>, default_queue_id: impl Into<String>) -> Self {
        Self {
            jobs,
            queues,
            default_queue_id: default_queue_id.into(),
        }
    }

    pub fn job_store(&self) -> &JobStore {
        &self.jobs
    }

    pub fn default_queue_id(&self) -> &str {
        &self.default_queue_id
    }

    /// 把作业置为 WAITING 并投递到队列。
    ///
    /// 记录不存在时先创建；已处于 WAITING/RUNNING/ABORTING 的作业拒绝重复入队。
    /// 记录写入使用版本校验，并发入队时只有一方成功。
    pub async fn queue_job(&self, request: QueueJobRequest) -> SchedulerResult<JobRecord> {
        validate_id(&request.job_id, "作业ID")?;
        validate_id(&request.job_type_id, "作业类型")?;
        validate_context_path(&request.context_path)?;
        let queue_id = request
            .queue_id
            .clone()
            .unwrap_or_else(|| self.default_queue_id.clone());

        let info = JobInfo::new(
            request.job_id.clone(),
            request.job_type_id.clone(),
            request.context_path.clone(),
            request.parameters.clone(),
        )?;
        let info = match &request.trigger {
            Some(trigger) => info.with_trigger(trigger.clone()),
            None => info,
        };
        let info = match request.queued_at {
            Some(timestamp) => info.with_queue_timestamp(timestamp),
            None => info,
        };

        let queue = self
            .queues
            .get_queue(&queue_id)
            .await?
            .ok_or_else(|| SchedulerError::QueueNotFound(queue_id.clone()))?;

        let fresh = JobRecord::new(&request.job_id, &request.job_type_id, &request.context_path);
        self.jobs.create_if_missing(&fresh).await?;
        let VersionedRecord { mut record, version } = self
            .jobs
            .get(&request.context_path, &request.job_id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound(request.job_id.clone()))?;

        if record.state.is_active() {
            return Err(SchedulerError::JobStateConflict(format!(
                "作业 {} 当前状态为 {}，不能重复入队",
                record.id, record.state
            )));
        }

        let previous = record.clone();
        record.type_id = request.job_type_id.clone();
        record.parameters = request.parameters.clone();
        record.state = JobState::Waiting;
        record.active = true;
        record.last_queued = Some(info.queue_timestamp);
        record.last_queued_trigger = request.trigger.clone();
        let version = self.jobs.put(&record, Some(version)).await?;

        if let Err(e) = queue.send_message(info.as_message()).await {
            warn!("作业 {} 投递到队列 {} 失败，回滚状态: {}", record.id, queue_id, e);
            if let Err(rollback) = self.jobs.put(&previous, Some(version)).await {
                warn!("作业 {} 状态回滚失败: {}", record.id, rollback);
            }
            return Err(e);
        }

        counter!("scheduler_jobs_queued_total").increment(1);
        info!("作业 {} 已投递到队列 {}", record.id, queue_id);
        Ok(record)
    }

    /// 请求取消。WAITING/RUNNING 转为 ABORTING，返回是否发出了取消请求。
    pub async fn cancel_job(
        &self,
        context_path: &str,
        job_id: &str,
        trigger: Option<&str>,
    ) -> SchedulerResult<bool> {
        let VersionedRecord { mut record, version } = self
            .jobs
            .get(context_path, job_id)
            .await?
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;

        if !matches!(record.state, JobState::Waiting | JobState::Running) {
            return Ok(false);
        }
        record.state = JobState::Aborting;
        record.last_cancelled = Some(Utc::now());
        record.last_cancelled_trigger = trigger.map(str::to_string);
        self.jobs.put(&record, Some(version)).await?;
        info!("已请求取消作业 {}", job_id);
        Ok(true)
    }

    pub async fn get_job(&self, context_path: &str, job_id: &str) -> SchedulerResult<Option<JobRecord>> {
        Ok(self.jobs.get(context_path, job_id).await?.map(|v| v.record))
    }

    pub async fn get_jobs_by_state(
        &self,
        context_path: &str,
        state: JobState,
    ) -> SchedulerResult<Vec<JobRecord>> {
        Ok(self
            .jobs
            .list_records(context_path)
            .await?
            .into_iter()
            .filter(|r| r.state == state)
            .collect())
    }

    pub async fn get_history(&self, context_path: &str, job_id: &str) -> SchedulerResult<JobHistory> {
        self.jobs.get_history(context_path, job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;
    use crate::queue::StoreQueueService;
    use scheduler_core::traits::ReceiveOptions;
    use std::time::Duration;

    async fn manager() -> (JobManager, StoreQueueService) {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let queues = StoreQueueService::new(store.clone());
        queues.create_queue("default").await.unwrap();
        let manager = JobManager::new(JobStore::new(store), Arc::new(queues.clone()), "default");
        (manager, queues)
    }

    #[tokio::test]
    async fn test_queue_job_sets_waiting_and_sends() {
        let (manager, queues) = manager().await;
        let mut params = BTreeMap::new();
        params.insert("k".to_string(), "v".to_string());
        let record = manager
            .queue_job(
                QueueJobRequest::new("j1", "report.daily", "/")
                    .with_parameters(params.clone())
                    .with_trigger("manual"),
            )
            .await
            .unwrap();
        assert_eq!(record.state, JobState::Waiting);
        assert!(record.active);
        assert_eq!(record.last_queued_trigger.as_deref(), Some("manual"));

        let queue = queues.get_queue("default").await.unwrap().unwrap();
        let messages = queue
            .receive_messages(1, ReceiveOptions::immediate(Duration::from_secs(60)))
            .await
            .unwrap();
        let info = JobInfo::parse(&messages[0].body).unwrap();
        assert_eq!(info.job_id, "j1");
        assert_eq!(info.parameters, params);
        assert_eq!(info.queue_trigger.as_deref(), Some("manual"));
    }

    #[tokio::test]
    async fn test_requeue_active_job_rejected() {
        let (manager, _) = manager().await;
        manager.queue_job(QueueJobRequest::new("j1", "t", "/")).await.unwrap();
        let err = manager
            .queue_job(QueueJobRequest::new("j1", "t", "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::JobStateConflict(_)));
    }

    #[tokio::test]
    async fn test_missing_queue_rejected_without_touching_record() {
        let (manager, _) = manager().await;
        let err = manager
            .queue_job(QueueJobRequest::new("j1", "t", "/").with_queue("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::QueueNotFound(_)));
        assert!(manager.get_job("/", "j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_and_query_by_state() {
        let (manager, _) = manager().await;
        manager.queue_job(QueueJobRequest::new("a", "t", "/")).await.unwrap();
        manager.queue_job(QueueJobRequest::new("b", "t", "/")).await.unwrap();

        assert!(manager.cancel_job("/", "a", Some("operator")).await.unwrap());
        let aborting = manager.get_jobs_by_state("/", JobState::Aborting).await.unwrap();
        assert_eq!(aborting.len(), 1);
        assert_eq!(aborting[0].id, "a");
        assert_eq!(aborting[0].last_cancelled_trigger.as_deref(), Some("operator"));

        let waiting = manager.get_jobs_by_state("/", JobState::Waiting).await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, "b");

        assert!(!manager.cancel_job("/", "a", None).await.unwrap());
        assert!(matches!(
            manager.cancel_job("/", "missing", None).await.unwrap_err(),
            SchedulerError::JobNotFound(_)
        ));
    }
}
