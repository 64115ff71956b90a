//! Worker 端
//!
//! 从队列取出作业并在本进程内执行，同时把执行状态同步回共享的作业记录。

pub mod components;
pub mod engine;
pub mod provider_registry;

pub use components::{JobExecutionManager, JobStateSynchronizer, RunDecision};
pub use engine::{PollOutcome, WorkerEngine};
pub use provider_registry::JobProviderRegistry;
