//! # Scheduler Testing Utils
//!
//! 工作区各 crate 共用的测试工具：
//!
//! - **作业提供者**：记录执行过程的、可阻塞的、固定类型集合的提供者
//! - **故障注入**：按开关返回后端错误的协调存储与队列包装
//! - **构建器**：带合理默认值的作业记录与调度定义
//! - **辅助函数**：进程内完整协作者栈、条件等待
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
