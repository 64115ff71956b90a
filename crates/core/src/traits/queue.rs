use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::QueueMessage;
use crate::SchedulerResult;

/// 接收参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// 接收后消息对其他消费者隐藏的时长
    pub visibility_timeout: Duration,
    /// 没有可用消息时最多等待多久；零表示立即返回
    pub receive_timeout: Duration,
}

impl ReceiveOptions {
    pub fn new(visibility_timeout: Duration, receive_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            receive_timeout,
        }
    }

    pub fn immediate(visibility_timeout: Duration) -> Self {
        Self::new(visibility_timeout, Duration::ZERO)
    }
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(60), Duration::ZERO)
    }
}

/// 持久化队列
#[async_trait]
pub trait Queue: Send + Sync {
    fn id(&self) -> &str;

    async fn send_message(&self, body: Vec<u8>) -> SchedulerResult<()>;

    /// 最多接收 `max` 条消息并把它们隐藏 `visibility_timeout`
    async fn receive_messages(
        &self,
        max: usize,
        options: ReceiveOptions,
    ) -> SchedulerResult<Vec<QueueMessage>>;

    /// 接收并立即删除一条消息
    async fn consume_message(&self, timeout: Duration) -> SchedulerResult<Option<Vec<u8>>>;

    /// 版本校验删除；消息已不存在或已被他人重新接收时返回 false
    async fn delete_message(&self, message: &QueueMessage) -> SchedulerResult<bool>;

    /// `fail_if_deleted` 为 true 时，消息已不存在返回 `NoSuchElement`，否则视为成功
    async fn delete_message_checked(
        &self,
        message: &QueueMessage,
        fail_if_deleted: bool,
    ) -> SchedulerResult<bool>;

    /// 可见和隐藏的消息总数
    async fn message_count(&self) -> SchedulerResult<usize>;

    async fn purge(&self) -> SchedulerResult<()>;
}

#[async_trait]
pub trait QueueService: Send + Sync {
    async fn create_queue(&self, queue_id: &str) -> SchedulerResult<Arc<dyn Queue>>;

    /// 队列不存在时返回 None
    async fn get_queue(&self, queue_id: &str) -> SchedulerResult<Option<Arc<dyn Queue>>>;

    async fn delete_queue(&self, queue_id: &str) -> SchedulerResult<()>;

    async fn list_queues(&self) -> SchedulerResult<Vec<String>>;
}
