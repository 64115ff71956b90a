//! 测试用的作业提供者与故障注入包装

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::models::{JobResult, QueueMessage};
use scheduler_core::traits::{
    CoordinationStore, CreateMode, Job, JobExecutionContext, JobProvider, JobProviderLookup, NodeEvent,
    NodeStat, Queue, QueueService, ReceiveOptions,
};
use scheduler_core::{SchedulerError, SchedulerResult, StoreError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// 记录每次执行上下文的提供者，作业立即返回预设结果
#[derive(Clone)]
pub struct RecordingJobProvider {
    types: Vec<String>,
    result: Arc<Mutex<JobResult>>,
    executions: Arc<Mutex<Vec<JobExecutionContext>>>,
}

impl RecordingJobProvider {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            result: Arc::new(Mutex::new(JobResult::ok("完成"))),
            executions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_result(self, result: JobResult) -> Self {
        *self.result.lock().unwrap() = result;
        self
    }

    pub fn executions(&self) -> Vec<JobExecutionContext> {
        self.executions.lock().unwrap().clone()
    }

    pub fn execution_count(&self) -> usize {
        self.executions.lock().unwrap().len()
    }
}

struct RecordingJob {
    result: JobResult,
    executions: Arc<Mutex<Vec<JobExecutionContext>>>,
}

#[async_trait]
impl Job for RecordingJob {
    async fn run(&self, ctx: &JobExecutionContext, _cancel: CancellationToken) -> JobResult {
        self.executions.lock().unwrap().push(ctx.clone());
        JobResult::new(self.result.severity, self.result.message.clone())
    }
}

impl JobProvider for RecordingJobProvider {
    fn provided_types(&self) -> Vec<String> {
        self.types.clone()
    }

    fn create_job(&self, type_id: &str, _ctx: &JobExecutionContext) -> SchedulerResult<Box<dyn Job>> {
        if !self.provides(type_id) {
            return Err(SchedulerError::JobProviderNotFound(type_id.to_string()));
        }
        Ok(Box::new(RecordingJob {
            result: self.result.lock().unwrap().clone(),
            executions: self.executions.clone(),
        }))
    }
}

/// 作业启动后一直阻塞，直到 `release()` 或收到取消
#[derive(Clone)]
pub struct BlockingJobProvider {
    types: Vec<String>,
    release: CancellationToken,
    started: Arc<AtomicUsize>,
    honor_cancel: bool,
}

impl BlockingJobProvider {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            release: CancellationToken::new(),
            started: Arc::new(AtomicUsize::new(0)),
            honor_cancel: true,
        }
    }

    /// 作业忽略取消请求，模拟失控的作业
    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    pub fn release(&self) {
        self.release.cancel();
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

struct BlockingJob {
    release: CancellationToken,
    started: Arc<AtomicUsize>,
    honor_cancel: bool,
}

#[async_trait]
impl Job for BlockingJob {
    async fn run(&self, _ctx: &JobExecutionContext, cancel: CancellationToken) -> JobResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        if !self.honor_cancel {
            self.release.cancelled().await;
            return JobResult::ok("已放行");
        }
        tokio::select! {
            _ = self.release.cancelled() => JobResult::ok("已放行"),
            _ = cancel.cancelled() => JobResult::cancelled("已取消"),
        }
    }
}

impl JobProvider for BlockingJobProvider {
    fn provided_types(&self) -> Vec<String> {
        self.types.clone()
    }

    fn create_job(&self, _type_id: &str, _ctx: &JobExecutionContext) -> SchedulerResult<Box<dyn Job>> {
        Ok(Box::new(BlockingJob {
            release: self.release.clone(),
            started: self.started.clone(),
            honor_cancel: self.honor_cancel,
        }))
    }
}

/// 固定作业类型集合的查找表，用于调度管理的校验
pub struct StaticProviderLookup {
    providers: HashMap<String, Arc<dyn JobProvider>>,
}

impl StaticProviderLookup {
    pub fn new<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: Vec<String> = types.into_iter().map(Into::into).collect();
        let provider: Arc<dyn JobProvider> = Arc::new(RecordingJobProvider::new(types.clone()));
        Self {
            providers: types.into_iter().map(|t| (t, provider.clone())).collect(),
        }
    }
}

impl JobProviderLookup for StaticProviderLookup {
    fn find_provider(&self, type_id: &str) -> Option<Arc<dyn JobProvider>> {
        self.providers.get(type_id).cloned()
    }
}

/// 故障注入的协调存储包装
///
/// - `fail_reads` / `fail_writes`：所有读或写返回 `Unavailable`
/// - `fail_reads_under`：只让某个子树下的读取失败
/// - `slow_reads_under`：某个子树下的读取先等待一段时间
/// - `write_after_read`：第一次读取某节点之后直接写入给定内容，模拟另一个节点的并发写入
pub struct FailingStore {
    inner: Arc<dyn CoordinationStore>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    failing_prefix: Mutex<Option<String>>,
    slow_prefix: Mutex<Option<(String, Duration)>>,
    pending_write: Mutex<Option<(String, Vec<u8>)>>,
    injected: AtomicUsize,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn CoordinationStore>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            failing_prefix: Mutex::new(None),
            slow_prefix: Mutex::new(None),
            pending_write: Mutex::new(None),
            injected: AtomicUsize::new(0),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads_under(&self, prefix: Option<&str>) {
        *self.failing_prefix.lock().unwrap() = prefix.map(str::to_string);
    }

    pub fn slow_reads_under(&self, prefix: Option<&str>, delay: Duration) {
        *self.slow_prefix.lock().unwrap() = prefix.map(|p| (p.to_string(), delay));
    }

    pub fn write_after_read(&self, path: &str, data: Vec<u8>) {
        *self.pending_write.lock().unwrap() = Some((path.to_string(), data));
    }

    /// 已注入的故障次数
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, flag: &AtomicBool, operation: &str) -> SchedulerResult<()> {
        if flag.load(Ordering::SeqCst) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable(format!("注入的故障: {operation}")).into())
        } else {
            Ok(())
        }
    }

    async fn before_read(&self, path: &str, operation: &str) -> SchedulerResult<()> {
        self.check(&self.fail_reads, operation)?;
        let failing = self
            .failing_prefix
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|prefix| path.starts_with(prefix.as_str()));
        if failing {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable(format!("注入的故障: {operation} {path}")).into());
        }
        let delay = self
            .slow_prefix
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn after_read(&self, path: &str) -> SchedulerResult<()> {
        let pending = {
            let mut pending = self.pending_write.lock().unwrap();
            match pending.as_ref() {
                Some((target, _)) if target == path => pending.take(),
                _ => None,
            }
        };
        if let Some((target, data)) = pending {
            self.inner.write_record(&target, data, None).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for FailingStore {
    async fn exists(&self, path: &str) -> SchedulerResult<bool> {
        self.before_read(path, "exists").await?;
        self.inner.exists(path).await
    }

    async fn create_path(&self, path: &str, mode: CreateMode, data: Vec<u8>) -> SchedulerResult<String> {
        self.check(&self.fail_writes, "create_path")?;
        self.inner.create_path(path, mode, data).await
    }

    async fn read_record(&self, path: &str) -> SchedulerResult<(Vec<u8>, NodeStat)> {
        self.before_read(path, "read_record").await?;
        let record = self.inner.read_record(path).await?;
        self.after_read(path).await?;
        Ok(record)
    }

    async fn write_record(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<i32>,
    ) -> SchedulerResult<NodeStat> {
        self.check(&self.fail_writes, "write_record")?;
        self.inner.write_record(path, data, expected_version).await
    }

    async fn delete_path(&self, path: &str, expected_version: Option<i32>) -> SchedulerResult<()> {
        self.check(&self.fail_writes, "delete_path")?;
        self.inner.delete_path(path, expected_version).await
    }

    async fn read_children_names(&self, path: &str) -> SchedulerResult<Vec<String>> {
        self.before_read(path, "read_children_names").await?;
        self.inner.read_children_names(path).await
    }

    async fn sync(&self, path: &str) -> SchedulerResult<()> {
        self.before_read(path, "sync").await?;
        self.inner.sync(path).await
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.subscribe()
    }
}

/// 队列服务包装，可以让指定队列的发送失败
pub struct FailingQueueService {
    inner: Arc<dyn QueueService>,
    failing_sends: Arc<Mutex<BTreeMap<String, bool>>>,
}

impl FailingQueueService {
    pub fn new(inner: Arc<dyn QueueService>) -> Self {
        Self {
            inner,
            failing_sends: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn fail_sends(&self, queue_id: &str, fail: bool) {
        self.failing_sends.lock().unwrap().insert(queue_id.to_string(), fail);
    }
}

#[async_trait]
impl QueueService for FailingQueueService {
    async fn create_queue(&self, queue_id: &str) -> SchedulerResult<Arc<dyn Queue>> {
        self.inner.create_queue(queue_id).await
    }

    async fn get_queue(&self, queue_id: &str) -> SchedulerResult<Option<Arc<dyn Queue>>> {
        Ok(self.inner.get_queue(queue_id).await?.map(|inner| {
            Arc::new(FailingQueue {
                inner,
                failing_sends: self.failing_sends.clone(),
            }) as Arc<dyn Queue>
        }))
    }

    async fn delete_queue(&self, queue_id: &str) -> SchedulerResult<()> {
        self.inner.delete_queue(queue_id).await
    }

    async fn list_queues(&self) -> SchedulerResult<Vec<String>> {
        self.inner.list_queues().await
    }
}

struct FailingQueue {
    inner: Arc<dyn Queue>,
    failing_sends: Arc<Mutex<BTreeMap<String, bool>>>,
}

#[async_trait]
impl Queue for FailingQueue {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn send_message(&self, body: Vec<u8>) -> SchedulerResult<()> {
        let failing = self
            .failing_sends
            .lock()
            .unwrap()
            .get(self.inner.id())
            .copied()
            .unwrap_or(false);
        if failing {
            return Err(SchedulerError::queue_operation(self.inner.id(), "send_message", "注入的故障"));
        }
        self.inner.send_message(body).await
    }

    async fn receive_messages(&self, max: usize, options: ReceiveOptions) -> SchedulerResult<Vec<QueueMessage>> {
        self.inner.receive_messages(max, options).await
    }

    async fn consume_message(&self, timeout: Duration) -> SchedulerResult<Option<Vec<u8>>> {
        self.inner.consume_message(timeout).await
    }

    async fn delete_message(&self, message: &QueueMessage) -> SchedulerResult<bool> {
        self.inner.delete_message(message).await
    }

    async fn delete_message_checked(&self, message: &QueueMessage, fail_if_deleted: bool) -> SchedulerResult<bool> {
        self.inner.delete_message_checked(message, fail_if_deleted).await
    }

    async fn message_count(&self) -> SchedulerResult<usize> {
        self.inner.message_count().await
    }

    async fn purge(&self) -> SchedulerResult<()> {
        self.inner.purge().await
    }
}
