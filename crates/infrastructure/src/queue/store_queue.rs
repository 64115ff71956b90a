use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use scheduler_core::ids::validate_id;
use scheduler_core::models::{MessageFrame, QueueMessage};
use scheduler_core::paths;
use scheduler_core::traits::{CoordinationStore, CreateMode, Queue, QueueService, ReceiveOptions};
use scheduler_core::{SchedulerError, SchedulerResult};
use tokio::time::Instant;
use tracing::{debug, error, warn};

const MESSAGE_PREFIX: &str = "msg-";

/// 队列服务：每个队列是 `/gyrex/cloud/queues/{id}` 下的一个持久节点
#[derive(Clone)]
pub struct StoreQueueService {
    store: Arc<dyn CoordinationStore>,
    min_poll_interval: Duration,
}

impl StoreQueueService {
    pub const DEFAULT_MIN_POLL_INTERVAL: Duration = Duration::from_millis(250);

    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_min_poll_interval(store, Self::DEFAULT_MIN_POLL_INTERVAL)
    }

    pub fn with_min_poll_interval(
        store: Arc<dyn CoordinationStore>,
        min_poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            min_poll_interval,
        }
    }

    fn open(&self, queue_id: &str) -> Arc<dyn Queue> {
        Arc::new(StoreQueue {
            id: queue_id.to_string(),
            path: paths::queue_path(queue_id),
            store: self.store.clone(),
            min_poll_interval: self.min_poll_interval,
        })
    }

    /// 队列不存在时创建，已存在时直接返回
    pub async fn get_or_create_queue(&self, queue_id: &str) -> SchedulerResult<Arc<dyn Queue>> {
        match self.create_queue(queue_id).await {
            Ok(queue) => Ok(queue),
            Err(SchedulerError::DuplicateQueue(_)) => Ok(self.open(queue_id)),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl QueueService for StoreQueueService {
    async fn create_queue(&self, queue_id: &str) -> SchedulerResult<Arc<dyn Queue>> {
        validate_id(queue_id, "队列ID")?;
        match self
            .store
            .create_path(&paths::queue_path(queue_id), CreateMode::Persistent, Vec::new())
            .await
        {
            Ok(_) => {
                debug!("创建队列: {}", queue_id);
                Ok(self.open(queue_id))
            }
            Err(SchedulerError::Store(e)) if e.is_node_exists() => {
                Err(SchedulerError::DuplicateQueue(queue_id.to_string()))
            }
            Err(e) => Err(SchedulerError::queue_operation(queue_id, "createQueue", e)),
        }
    }

    async fn get_queue(&self, queue_id: &str) -> SchedulerResult<Option<Arc<dyn Queue>>> {
        validate_id(queue_id, "队列ID")?;
        let exists = self
            .store
            .exists(&paths::queue_path(queue_id))
            .await
            .map_err(|e| SchedulerError::queue_operation(queue_id, "getQueue", e))?;
        Ok(exists.then(|| self.open(queue_id)))
    }

    async fn delete_queue(&self, queue_id: &str) -> SchedulerResult<()> {
        validate_id(queue_id, "队列ID")?;
        match self.store.delete_path(&paths::queue_path(queue_id), None).await {
            Ok(()) => {
                debug!("删除队列: {}", queue_id);
                Ok(())
            }
            Err(e) if e.is_no_node() => Err(SchedulerError::QueueNotFound(queue_id.to_string())),
            Err(e) => Err(SchedulerError::queue_operation(queue_id, "deleteQueue", e)),
        }
    }

    async fn list_queues(&self) -> SchedulerResult<Vec<String>> {
        match self.store.read_children_names(paths::QUEUES_ROOT).await {
            Ok(names) => Ok(names),
            Err(e) if e.is_no_node() => Ok(Vec::new()),
            Err(e) => Err(SchedulerError::queue_operation("*", "listQueues", e)),
        }
    }
}

/// 单个队列。
///
/// 消息按存储分配的顺序号排序；接收时用版本校验写入把消息标记为隐藏，
/// 遇到版本冲突直接跳到下一条候选消息，不在同一节点上重试。
/// 因此在多个消费者并发时不保证严格的FIFO。
pub struct StoreQueue {
    id: String,
    path: String,
    store: Arc<dyn CoordinationStore>,
    min_poll_interval: Duration,
}

impl StoreQueue {
    /// 节点缺失和版本冲突原样返回，其余存储错误包装为带队列ID和操作名的错误
    fn wrap(&self, operation: &str, err: SchedulerError) -> SchedulerError {
        if err.is_no_node() || err.is_contention() {
            err
        } else {
            SchedulerError::queue_operation(&self.id, operation, err)
        }
    }

    fn message_path(&self, message_id: &str) -> String {
        paths::join(&self.path, message_id)
    }

    async fn children(&self, operation: &str) -> SchedulerResult<Vec<String>> {
        match self.store.read_children_names(&self.path).await {
            Ok(names) => Ok(names),
            Err(e) if e.is_no_node() => Err(SchedulerError::QueueNotFound(self.id.clone())),
            Err(e) => Err(self.wrap(operation, e)),
        }
    }

    /// 单轮扫描，不等待
    async fn try_receive(
        &self,
        max: usize,
        visibility_timeout: Duration,
    ) -> SchedulerResult<Vec<QueueMessage>> {
        let mut received = Vec::new();
        for name in self.children("receiveMessages").await? {
            if received.len() >= max {
                break;
            }
            let path = self.message_path(&name);
            let (bytes, stat) = match self.store.read_record(&path).await {
                Ok(record) => record,
                Err(e) if e.is_no_node() => continue,
                Err(e) => return Err(self.wrap("receiveMessages", e)),
            };

            let frame = match MessageFrame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    // 无法解析的帧不可能被投递，跳过但保留供人工处理
                    error!("队列 {} 中的消息 {} 无法解析: {}", self.id, name, e);
                    counter!("scheduler_queue_frames_malformed_total").increment(1);
                    continue;
                }
            };

            let now = Utc::now().timestamp_millis();
            if frame.is_hidden_at(now) {
                continue;
            }

            let invisible_until = now + visibility_timeout.as_millis() as i64;
            let hidden = MessageFrame::new(invisible_until, frame.body);
            match self
                .store
                .write_record(&path, hidden.encode(), Some(stat.version))
                .await
            {
                Ok(new_stat) => {
                    received.push(QueueMessage {
                        queue_id: self.id.clone(),
                        message_id: name,
                        body: hidden.body,
                        version: new_stat.version,
                        invisible_until,
                    });
                }
                Err(e) if e.is_contention() || e.is_no_node() => {
                    debug!("消息 {} 已被其他消费者取走，尝试下一条", name);
                    continue;
                }
                Err(e) => return Err(self.wrap("receiveMessages", e)),
            }
        }
        if !received.is_empty() {
            counter!("scheduler_queue_messages_received_total").increment(received.len() as u64);
        }
        Ok(received)
    }
}

#[async_trait]
impl Queue for StoreQueue {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send_message(&self, body: Vec<u8>) -> SchedulerResult<()> {
        let exists = self
            .store
            .exists(&self.path)
            .await
            .map_err(|e| self.wrap("sendMessage", e))?;
        if !exists {
            return Err(SchedulerError::QueueNotFound(self.id.clone()));
        }
        let frame = MessageFrame::new(0, body);
        let created = self
            .store
            .create_path(
                &self.message_path(MESSAGE_PREFIX),
                CreateMode::PersistentSequential,
                frame.encode(),
            )
            .await
            .map_err(|e| self.wrap("sendMessage", e))?;
        debug!("发送消息: {}", created);
        counter!("scheduler_queue_messages_sent_total").increment(1);
        Ok(())
    }

    async fn receive_messages(
        &self,
        max: usize,
        options: ReceiveOptions,
    ) -> SchedulerResult<Vec<QueueMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + options.receive_timeout;
        loop {
            let messages = self.try_receive(max, options.visibility_timeout).await?;
            let now = Instant::now();
            if !messages.is_empty() || now >= deadline {
                return Ok(messages);
            }
            // 剩余时间的一半，不低于最小轮询间隔，也不超过剩余时间
            let remaining = deadline - now;
            let pause = (remaining / 2).max(self.min_poll_interval).min(remaining);
            tokio::time::sleep(pause).await;
        }
    }

    async fn consume_message(&self, timeout: Duration) -> SchedulerResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let options = ReceiveOptions::new(ReceiveOptions::default().visibility_timeout, remaining);
            let Some(message) = self.receive_messages(1, options).await?.into_iter().next() else {
                return Ok(None);
            };
            if self.delete_message(&message).await? {
                return Ok(Some(message.body));
            }
            warn!("消息 {} 在删除前被他人取走", message.message_id);
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    async fn delete_message(&self, message: &QueueMessage) -> SchedulerResult<bool> {
        let path = self.message_path(&message.message_id);
        match self.store.delete_path(&path, Some(message.version)).await {
            Ok(()) => {
                counter!("scheduler_queue_messages_deleted_total").increment(1);
                Ok(true)
            }
            Err(e) if e.is_no_node() || e.is_contention() => Ok(false),
            Err(e) => Err(self.wrap("deleteMessage", e)),
        }
    }

    async fn delete_message_checked(
        &self,
        message: &QueueMessage,
        fail_if_deleted: bool,
    ) -> SchedulerResult<bool> {
        let path = self.message_path(&message.message_id);
        match self.store.delete_path(&path, Some(message.version)).await {
            Ok(()) => {
                counter!("scheduler_queue_messages_deleted_total").increment(1);
                Ok(true)
            }
            Err(e) if e.is_no_node() => {
                if fail_if_deleted {
                    Err(SchedulerError::NoSuchElement(format!(
                        "{}/{}",
                        self.id, message.message_id
                    )))
                } else {
                    Ok(true)
                }
            }
            // 可见期已过且被重新接收，当前调用方不再拥有该消息
            Err(e) if e.is_contention() => Ok(false),
            Err(e) => Err(self.wrap("deleteMessage", e)),
        }
    }

    async fn message_count(&self) -> SchedulerResult<usize> {
        Ok(self.children("messageCount").await?.len())
    }

    async fn purge(&self) -> SchedulerResult<()> {
        for name in self.children("purge").await? {
            match self.store.delete_path(&self.message_path(&name), None).await {
                Ok(()) => {}
                Err(e) if e.is_no_node() => {}
                Err(e) => return Err(self.wrap("purge", e)),
            }
        }
        Ok(())
    }
}
