//! 作业执行与共享作业记录之间的状态同步
//!
//! ```text
//! about_to_run: 记录必须是 WAITING，否则本地执行不启动
//! running:      WAITING -> RUNNING，写入启动时间
//! done:         任意状态 -> NONE，写入结果并追加历史
//! ```
//!
//! Worker 假定自己是所执行作业 RUNNING/NONE 转换的唯一写入者，写入不做版本校验。

use chrono::Utc;
use scheduler_core::models::{JobHistoryEntry, JobRecord, JobResult, JobState, Severity};
use scheduler_core::paths;
use scheduler_core::traits::{JobExecutionContext, NodeEvent};
use scheduler_core::SchedulerResult;
use scheduler_infrastructure::JobStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// `about_to_run` 的判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDecision {
    Run,
    /// 作业在等待期间被取消
    Aborted,
    /// 记录处于其他状态（重复投递或已被处理）
    Skip(JobState),
}

#[derive(Clone)]
pub struct JobStateSynchronizer {
    jobs: JobStore,
}

impl JobStateSynchronizer {
    pub fn new(jobs: JobStore) -> Self {
        Self { jobs }
    }

    pub fn job_store(&self) -> &JobStore {
        &self.jobs
    }

    /// 启动前重新检查共享记录。
    ///
    /// 没有记录的消息（绕过作业管理直接发送到队列）补建一条 WAITING 记录后执行。
    pub async fn about_to_run(&self, ctx: &JobExecutionContext) -> SchedulerResult<RunDecision> {
        let record = match self.jobs.get(&ctx.context_path, &ctx.job_id).await? {
            Some(versioned) => versioned.record,
            None => {
                let mut record = JobRecord::new(&ctx.job_id, &ctx.job_type_id, &ctx.context_path);
                record.state = JobState::Waiting;
                record.active = true;
                record.last_queued = Some(ctx.queued_at);
                record.last_queued_trigger = ctx.trigger.clone();
                record.parameters = ctx.parameters.clone();
                if self.jobs.create_if_missing(&record).await? {
                    debug!("为作业 {} 补建记录", ctx.job_id);
                    return Ok(RunDecision::Run);
                }
                match self.jobs.get(&ctx.context_path, &ctx.job_id).await? {
                    Some(versioned) => versioned.record,
                    None => return Ok(RunDecision::Skip(JobState::None)),
                }
            }
        };

        Ok(match record.state {
            JobState::Waiting => RunDecision::Run,
            JobState::Aborting => RunDecision::Aborted,
            other => RunDecision::Skip(other),
        })
    }

    pub async fn running(&self, ctx: &JobExecutionContext) -> SchedulerResult<()> {
        let now = Utc::now();
        let updated = self
            .jobs
            .update(&ctx.context_path, &ctx.job_id, |record| {
                // 运行前已被请求取消时保留 ABORTING
                if record.state != JobState::Aborting {
                    record.state = JobState::Running;
                }
                record.active = true;
                record.last_start = Some(now);
            })
            .await?;
        if updated.is_none() {
            warn!("作业 {} 的记录已不存在", ctx.job_id);
        }
        Ok(())
    }

    /// 作业结束：状态回到 NONE，记录结果与历史
    pub async fn done(&self, ctx: &JobExecutionContext, result: JobResult) -> SchedulerResult<()> {
        let mut previous = None;
        let record_result = result.clone();
        let updated = self
            .jobs
            .update(&ctx.context_path, &ctx.job_id, |record| {
                previous = Some(record.state);
                record.state = JobState::None;
                record.active = false;
                record.last_result = Some(record_result);
            })
            .await?;
        let record = match updated {
            Some(record) => record,
            None => {
                // 记录缺失（被清理或从未创建）时重建，保证结果可查
                warn!("作业 {} 的记录已不存在，重新创建", ctx.job_id);
                let mut record = JobRecord::new(&ctx.job_id, &ctx.job_type_id, &ctx.context_path);
                record.last_queued = Some(ctx.queued_at);
                record.last_queued_trigger = ctx.trigger.clone();
                record.parameters = ctx.parameters.clone();
                record.last_result = Some(result.clone());
                self.jobs.put(&record, None).await?;
                record
            }
        };
        if previous == Some(JobState::Aborting) {
            info!("作业 {} 已取消", ctx.job_id);
        }

        let mut entry = JobHistoryEntry::new(result);
        entry.queued_trigger = record.last_queued_trigger.clone();
        if entry.result.severity == Severity::Cancel {
            entry.cancelled_trigger = record.last_cancelled_trigger.clone();
        }
        self.jobs.add_history(&ctx.context_path, &ctx.job_id, entry).await?;
        Ok(())
    }

    /// 监视共享记录，转为 ABORTING 时触发本地取消
    pub fn watch_abort(&self, ctx: &JobExecutionContext, cancel: CancellationToken) -> JoinHandle<()> {
        let jobs = self.jobs.clone();
        let path = paths::job_path(&ctx.context_path, &ctx.job_id);
        let context_path = ctx.context_path.clone();
        let job_id = ctx.job_id.clone();
        // 先订阅再检查，检查与订阅之间的变更不会丢失
        let mut events = jobs.coordination_store().subscribe();

        tokio::spawn(async move {
            let mut check = true;
            loop {
                if check && is_aborting(&jobs, &context_path, &job_id).await {
                    info!("作业 {} 收到取消请求", job_id);
                    cancel.cancel();
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => {
                        check = match event {
                            Ok(NodeEvent::DataChanged(p)) => p == path,
                            Ok(_) => false,
                            Err(broadcast::error::RecvError::Lagged(_)) => true,
                            Err(broadcast::error::RecvError::Closed) => return,
                        };
                    }
                }
            }
        })
    }
}

async fn is_aborting(jobs: &JobStore, context_path: &str, job_id: &str) -> bool {
    match jobs.get(context_path, job_id).await {
        Ok(Some(versioned)) => versioned.record.state == JobState::Aborting,
        Ok(None) => false,
        Err(e) => {
            warn!("读取作业 {} 状态失败: {}", job_id, e);
            false
        }
    }
}
