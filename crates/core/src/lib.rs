//! 作业调度核心库
//!
//! 定义调度引擎、Worker引擎和清理服务共享的模型与协作者接口：
//! - 协调存储（层级化、带版本的键值节点）
//! - 分布式排他锁
//! - 持久化队列
//! - 作业提供者

pub mod backoff;
pub mod config;
pub mod ids;
pub mod logging;
pub mod models;
pub mod paths;
pub mod traits;

pub use backoff::ExponentialBackoff;
pub use config::AppConfig;
pub use models::{
    JobHistory, JobHistoryEntry, JobInfo, JobRecord, JobResult, JobState, QueueMessage,
    ScheduleDefinition, ScheduleEntry, Severity,
};
pub use traits::{
    CoordinationStore, CreateMode, ExclusiveLock, Job, JobExecutionContext, JobProvider,
    JobProviderLookup, LockService, NodeEvent, NodeStat, Queue, QueueService, ReceiveOptions,
};

pub use scheduler_errors::{SchedulerError, SchedulerResult, StoreError};

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;
