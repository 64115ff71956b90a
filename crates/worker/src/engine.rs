//! Worker 引擎
//!
//! 单消费者轮询循环：从队列接收消息，解析作业描述，删除消息后再执行作业。
//! 先删除后执行避免执行失败时重复派发，代价是删除与执行之间进程崩溃会丢失这条消息。
//!
//! 无法解析的消息不会原地重试，而是从工作队列删除并原样转发到失败队列。
//!
//! 停止信号只打断接收阶段。消息一旦被接收，删除、状态同步和派发会完整执行，
//! 不会因为关闭而在删除之后丢弃作业。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metrics::counter;
use scheduler_core::backoff::ExponentialBackoff;
use scheduler_core::config::{QueueConfig, WorkerConfig};
use scheduler_core::models::{JobInfo, QueueMessage};
use scheduler_core::traits::{JobExecutionContext, JobProviderLookup, Queue, QueueService, ReceiveOptions};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::JobStore;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::components::job_execution::record_failure;
use crate::components::{JobExecutionManager, JobStateSynchronizer, RunDecision};

/// 一次轮询的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// 队列中没有可用消息
    Idle,
    /// 作业已交给执行槽
    Dispatched(String),
    /// 消息已处理但没有执行（格式错误、缺少提供者、作业不在等待状态）
    Dropped,
    AtCapacity,
}

/// 接收阶段的结果
enum Receipt {
    AtCapacity,
    Empty,
    Message(Arc<dyn Queue>, QueueMessage),
}

pub struct WorkerEngine {
    config: WorkerConfig,
    queue_config: QueueConfig,
    queues: Arc<dyn QueueService>,
    providers: Arc<dyn JobProviderLookup>,
    executions: JobExecutionManager,
    suspended: AtomicBool,
    resumed: Notify,
    jobs_cancel: CancellationToken,
}

impl WorkerEngine {
    pub fn new(
        config: WorkerConfig,
        queue_config: QueueConfig,
        queues: Arc<dyn QueueService>,
        providers: Arc<dyn JobProviderLookup>,
        jobs: JobStore,
    ) -> Self {
        let executions =
            JobExecutionManager::new(config.max_concurrent_jobs, JobStateSynchronizer::new(jobs));
        Self {
            config,
            queue_config,
            queues,
            providers,
            executions,
            suspended: AtomicBool::new(false),
            resumed: Notify::new(),
            jobs_cancel: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn running_jobs(&self) -> usize {
        self.executions.running_count()
    }

    /// 暂停轮询，正在运行的作业不受影响
    pub fn suspend(&self) {
        if !self.suspended.swap(true, Ordering::SeqCst) {
            info!("Worker {} 已暂停", self.config.worker_id);
        }
    }

    pub fn resume(&self) {
        if self.suspended.swap(false, Ordering::SeqCst) {
            info!("Worker {} 已恢复", self.config.worker_id);
            self.resumed.notify_waiters();
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// 请求取消本进程内运行的某个作业
    pub fn cancel_local(&self, context_path: &str, job_id: &str) -> bool {
        self.executions.cancel(context_path, job_id)
    }

    /// 轮询直到 `cancel` 触发；退出前取消并等待所有运行中的作业
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = ExponentialBackoff::new(self.config.backoff_initial(), self.config.backoff_max());
        info!(
            "Worker {} 启动，队列 {}，并发上限 {}",
            self.config.worker_id, self.queue_config.default_queue_id, self.config.max_concurrent_jobs
        );

        while !cancel.is_cancelled() {
            if self.is_suspended() {
                let resumed = self.resumed.notified();
                if !self.is_suspended() {
                    continue;
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = resumed => continue,
                }
            }

            // 接收中途被取消时消息只是被隐藏，可见性超时后会重新投递
            let receipt = tokio::select! {
                _ = cancel.cancelled() => break,
                receipt = self.receive() => receipt,
            };
            let outcome = match receipt {
                Ok(receipt) => self.handle(receipt).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(PollOutcome::Dispatched(_)) | Ok(PollOutcome::Dropped) => backoff.reset(),
                Ok(PollOutcome::Idle) => {
                    backoff.reset();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.idle_sleep()) => {}
                    }
                }
                Ok(PollOutcome::AtCapacity) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.executions.wait_for_slot() => {}
                    }
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("Worker 轮询失败: {}，{:?} 后重试", e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Worker {} 停止，等待 {} 个作业结束", self.config.worker_id, self.running_jobs());
        self.jobs_cancel.cancel();
        self.executions.wait_idle().await;
        info!("Worker {} 已停止", self.config.worker_id);
    }

    /// 接收并处理最多一条消息
    pub async fn poll_once(&self) -> SchedulerResult<PollOutcome> {
        let receipt = self.receive().await?;
        self.handle(receipt).await
    }

    async fn receive(&self) -> SchedulerResult<Receipt> {
        if self.executions.at_capacity() {
            return Ok(Receipt::AtCapacity);
        }
        let queue_id = &self.queue_config.default_queue_id;
        let queue = self
            .queues
            .get_queue(queue_id)
            .await?
            .ok_or_else(|| SchedulerError::QueueNotFound(queue_id.clone()))?;

        let options = ReceiveOptions::new(
            self.queue_config.visibility_timeout(),
            self.queue_config.receive_timeout(),
        );
        Ok(match queue.receive_messages(1, options).await?.into_iter().next() {
            Some(message) => Receipt::Message(queue, message),
            None => Receipt::Empty,
        })
    }

    async fn handle(&self, receipt: Receipt) -> SchedulerResult<PollOutcome> {
        let (queue, message) = match receipt {
            Receipt::AtCapacity => return Ok(PollOutcome::AtCapacity),
            Receipt::Empty => return Ok(PollOutcome::Idle),
            Receipt::Message(queue, message) => (queue, message),
        };

        let info = match JobInfo::parse(&message.body) {
            Ok(info) => info,
            Err(e) => {
                self.dead_letter(queue.as_ref(), &message, &e).await?;
                return Ok(PollOutcome::Dropped);
            }
        };

        if !queue.delete_message(&message).await? {
            warn!("消息 {} 已被其他消费者处理，跳过", message.message_id);
            return Ok(PollOutcome::Dropped);
        }
        self.dispatch(info).await
    }

    async fn dispatch(&self, info: JobInfo) -> SchedulerResult<PollOutcome> {
        let ctx = JobExecutionContext::from(&info);
        let synchronizer = self.executions.synchronizer();

        let job = match self.providers.find_provider(&ctx.job_type_id) {
            Some(provider) => provider.create_job(&ctx.job_type_id, &ctx),
            None => Err(SchedulerError::JobProviderNotFound(ctx.job_type_id.clone())),
        };
        let job = match job {
            Ok(job) => job,
            Err(e) => {
                error!("无法创建作业 {} ({}): {}", ctx.job_id, ctx.job_type_id, e);
                record_failure(synchronizer, &ctx, e.to_string()).await;
                return Ok(PollOutcome::Dropped);
            }
        };

        match synchronizer.about_to_run(&ctx).await? {
            RunDecision::Run => {}
            RunDecision::Aborted => {
                info!("作业 {} 在等待期间被取消", ctx.job_id);
                synchronizer
                    .done(&ctx, scheduler_core::models::JobResult::cancelled("作业在启动前被取消"))
                    .await?;
                return Ok(PollOutcome::Dropped);
            }
            RunDecision::Skip(state) => {
                warn!("作业 {} 当前状态为 {}，不执行本次投递", ctx.job_id, state);
                return Ok(PollOutcome::Dropped);
            }
        }

        let job_id = ctx.job_id.clone();
        self.executions.spawn(ctx, job, &self.jobs_cancel)?;
        debug!("作业 {} 已派发", job_id);
        Ok(PollOutcome::Dispatched(job_id))
    }

    /// 从工作队列删除并原样转发到失败队列；转发失败只记录错误
    async fn dead_letter(
        &self,
        queue: &dyn Queue,
        message: &QueueMessage,
        cause: &SchedulerError,
    ) -> SchedulerResult<()> {
        warn!("队列 {} 中的消息 {} 格式错误: {}", queue.id(), message.message_id, cause);
        counter!("scheduler_worker_messages_dead_lettered_total").increment(1);
        if !queue.delete_message(message).await? {
            return Ok(());
        }

        let failed_id = &self.queue_config.failed_queue_id;
        let forwarded = match self.queues.get_queue(failed_id).await {
            Ok(Some(failed)) => failed.send_message(message.body.clone()).await,
            Ok(None) => Err(SchedulerError::QueueNotFound(failed_id.clone())),
            Err(e) => Err(e),
        };
        if let Err(e) = forwarded {
            error!(
                "无法把消息 {} 转发到失败队列 {}，消息已丢失: {}",
                message.message_id, failed_id, e
            );
        }
        Ok(())
    }
}
