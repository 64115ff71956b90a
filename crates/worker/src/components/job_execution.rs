use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::counter;
use scheduler_core::logging::job_span;
use scheduler_core::models::JobResult;
use scheduler_core::traits::{Job, JobExecutionContext};
use scheduler_core::{SchedulerError, SchedulerResult};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

use super::job_synchronizer::JobStateSynchronizer;

type RunningJobs = HashMap<String, Vec<(u64, CancellationToken)>>;

/// 本进程内正在运行的作业，容量由信号量限制
///
/// 同一个作业被重复投递时每次执行各自登记取消令牌，结束时只移除自己的那一个。
pub struct JobExecutionManager {
    max_concurrent_jobs: usize,
    slots: Arc<Semaphore>,
    running: Arc<Mutex<RunningJobs>>,
    next_execution: AtomicU64,
    synchronizer: JobStateSynchronizer,
}

fn running_key(context_path: &str, job_id: &str) -> String {
    format!("{context_path}#{job_id}")
}

impl JobExecutionManager {
    pub fn new(max_concurrent_jobs: usize, synchronizer: JobStateSynchronizer) -> Self {
        let max_concurrent_jobs = max_concurrent_jobs.max(1);
        Self {
            max_concurrent_jobs,
            slots: Arc::new(Semaphore::new(max_concurrent_jobs)),
            running: Arc::new(Mutex::new(HashMap::new())),
            next_execution: AtomicU64::new(0),
            synchronizer,
        }
    }

    pub fn synchronizer(&self) -> &JobStateSynchronizer {
        &self.synchronizer
    }

    pub fn running_count(&self) -> usize {
        self.max_concurrent_jobs - self.slots.available_permits()
    }

    pub fn at_capacity(&self) -> bool {
        self.slots.available_permits() == 0
    }

    pub fn is_running(&self, context_path: &str, job_id: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.contains_key(&running_key(context_path, job_id)))
            .unwrap_or(false)
    }

    /// 等待出现空闲的执行槽
    pub async fn wait_for_slot(&self) {
        if let Ok(permit) = self.slots.acquire().await {
            drop(permit);
        }
    }

    /// 等待所有运行中的作业结束
    pub async fn wait_idle(&self) {
        if let Ok(permits) = self.slots.acquire_many(self.max_concurrent_jobs as u32).await {
            drop(permits);
        }
    }

    /// 请求取消本地执行，作业是否响应取决于作业自身
    pub fn cancel(&self, context_path: &str, job_id: &str) -> bool {
        let Ok(running) = self.running.lock() else {
            return false;
        };
        match running.get(&running_key(context_path, job_id)) {
            Some(executions) if !executions.is_empty() => {
                for (_, token) in executions {
                    token.cancel();
                }
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&self) {
        if let Ok(running) = self.running.lock() {
            for (_, token) in running.values().flatten() {
                token.cancel();
            }
        }
    }

    /// 在后台任务中运行作业。没有空闲槽时返回错误，调用方应先检查容量。
    pub fn spawn(
        &self,
        ctx: JobExecutionContext,
        job: Box<dyn Job>,
        parent: &CancellationToken,
    ) -> SchedulerResult<()> {
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| SchedulerError::Internal("没有空闲的作业执行槽".to_string()))?;
        let token = parent.child_token();
        let key = running_key(&ctx.context_path, &ctx.job_id);
        let execution_id = self.next_execution.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut running) = self.running.lock() {
            running.entry(key.clone()).or_default().push((execution_id, token.clone()));
        }

        let span = job_span(&ctx.job_id, &ctx.context_path);
        let execution = Execution {
            ctx,
            job,
            token,
            synchronizer: self.synchronizer.clone(),
        };
        let running = self.running.clone();
        tokio::spawn(
            async move {
                execution.run().await;
                if let Ok(mut running) = running.lock() {
                    if let Some(executions) = running.get_mut(&key) {
                        executions.retain(|(id, _)| *id != execution_id);
                        if executions.is_empty() {
                            running.remove(&key);
                        }
                    }
                }
                drop::<OwnedSemaphorePermit>(permit);
            }
            .instrument(span),
        );
        Ok(())
    }
}

struct Execution {
    ctx: JobExecutionContext,
    job: Box<dyn Job>,
    token: CancellationToken,
    synchronizer: JobStateSynchronizer,
}

impl Execution {
    async fn run(self) {
        let Execution {
            ctx,
            job,
            token,
            synchronizer,
        } = self;

        if let Err(e) = synchronizer.running(&ctx).await {
            error!("更新作业 {} 的运行状态失败: {}", ctx.job_id, e);
        }
        let watcher = synchronizer.watch_abort(&ctx, token.clone());

        counter!("scheduler_jobs_started_total").increment(1);
        info!("开始执行作业 {} ({})", ctx.job_id, ctx.job_type_id);
        let started = std::time::Instant::now();
        let result = job.run(&ctx, token.clone()).await;
        watcher.abort();

        // 忽略了取消请求而正常结束的作业，保留它自己的结果
        info!(
            "作业 {} 执行结束: {:?} {} (耗时 {:?})",
            ctx.job_id,
            result.severity,
            result.message,
            started.elapsed()
        );
        counter!("scheduler_jobs_finished_total").increment(1);

        if let Err(e) = synchronizer.done(&ctx, result).await {
            error!("保存作业 {} 的结果失败: {}", ctx.job_id, e);
        }
    }
}

/// 无法创建作业时直接记录失败结果
pub async fn record_failure(synchronizer: &JobStateSynchronizer, ctx: &JobExecutionContext, message: String) {
    if let Err(e) = synchronizer.done(ctx, JobResult::error(message)).await {
        error!("保存作业 {} 的失败结果出错: {}", ctx.job_id, e);
    }
}
