//! 调度端
//!
//! 管理调度定义，并在持有集群调度锁的节点上按CRON表达式把作业投递到队列。

pub mod cron_utils;
pub mod schedule_manager;
pub mod schedule_runner;
pub mod scheduler;
pub mod time_provider;

pub use cron_utils::CronScheduler;
pub use schedule_manager::ScheduleManager;
pub use schedule_runner::{ScheduleRunner, ScheduleState};
pub use scheduler::Scheduler;
pub use time_provider::{SystemTimeProvider, TimeProvider, TokioTimeProvider};
