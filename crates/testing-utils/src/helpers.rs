//! 测试环境辅助

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::traits::{CoordinationStore, QueueService};
use scheduler_infrastructure::{
    InMemoryCoordinationStore, InMemoryLockService, JobManager, JobStore, StoreQueueService,
};
use tokio::time::sleep;

pub const TEST_DEFAULT_QUEUE: &str = "gyrex.jobs.queue.default";
pub const TEST_FAILED_QUEUE: &str = "gyrex.jobs.queue.failed";

/// 进程内的完整协作者栈，默认队列与失败队列已创建
#[derive(Clone)]
pub struct TestStack {
    pub store: Arc<dyn CoordinationStore>,
    pub queues: StoreQueueService,
    pub locks: InMemoryLockService,
    pub jobs: JobStore,
    pub manager: JobManager,
}

impl TestStack {
    pub async fn new() -> Self {
        Self::with_store(Arc::new(InMemoryCoordinationStore::new())).await
    }

    /// 在给定存储（例如故障注入包装）之上构建
    pub async fn with_store(store: Arc<dyn CoordinationStore>) -> Self {
        let queues = StoreQueueService::with_min_poll_interval(store.clone(), Duration::from_millis(10));
        for queue_id in [TEST_DEFAULT_QUEUE, TEST_FAILED_QUEUE] {
            queues
                .get_or_create_queue(queue_id)
                .await
                .unwrap_or_else(|e| panic!("创建测试队列失败: {e}"));
        }
        let jobs = JobStore::new(store.clone());
        let manager = JobManager::new(jobs.clone(), Arc::new(queues.clone()), TEST_DEFAULT_QUEUE);
        Self {
            store,
            queues,
            locks: InMemoryLockService::new(),
            jobs,
            manager,
        }
    }

    pub fn queue_service(&self) -> Arc<dyn QueueService> {
        Arc::new(self.queues.clone())
    }
}

/// 在超时之前轮询条件，条件成立返回 true
pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition().await
}
