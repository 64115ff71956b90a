//! 基于协调存储顺序节点的持久化队列

mod store_queue;

pub use store_queue::{StoreQueue, StoreQueueService};
