pub mod job_execution;
pub mod job_synchronizer;

pub use job_execution::JobExecutionManager;
pub use job_synchronizer::{JobStateSynchronizer, RunDecision};
