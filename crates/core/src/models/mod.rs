//! # 数据模型
//!
//! 调度系统在协调存储和队列中流转的数据结构。
//!
//! ## 核心模型
//!
//! ### JobInfo - 队列消息中的作业描述
//! 调度端写入、Worker端解析的 key=value 格式消息体。
//!
//! ### JobRecord - 持久化的作业记录
//! 记录作业当前状态、最近一次入队/启动/取消时间以及最近结果。
//!
//! ### JobHistory - 作业历史
//! 按时间排序、有容量上限的结果列表，超出上限时淘汰最旧的条目。
//!
//! ### ScheduleDefinition - 调度定义
//! 一组CRON条目，条目触发时把作业投递到调度所属的队列。
//!
//! ## 状态流转
//!
//! ```text
//! NONE → WAITING → RUNNING → NONE
//!           ↓         ↓
//!        ABORTING → NONE
//! ```

pub mod job;
pub mod job_info;
pub mod message;
pub mod schedule;

pub use job::*;
pub use job_info::JobInfo;
pub use message::*;
pub use schedule::*;
