//! 协作者的进程内实现与基于协调存储的服务
//!
//! - [`InMemoryCoordinationStore`]：层级化、带版本的节点存储
//! - [`InMemoryLockService`]：排他锁
//! - [`StoreQueueService`]：基于顺序节点的持久化队列
//! - [`JobStore`] / [`JobManager`]：作业记录、历史与入队
//! - [`CleanupService`]：周期性的作业清理

pub mod cleanup_service;
pub mod coordination;
pub mod job_manager;
pub mod job_store;
pub mod lock;
pub mod queue;

pub use cleanup_service::{CleanupService, CleanupStats};
pub use coordination::InMemoryCoordinationStore;
pub use job_manager::{JobManager, QueueJobRequest};
pub use job_store::{JobStore, VersionedRecord};
pub use lock::InMemoryLockService;
pub use queue::{StoreQueue, StoreQueueService};
