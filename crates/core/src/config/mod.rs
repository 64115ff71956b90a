//! 配置加载
//!
//! 加载顺序：结构体默认值 → TOML配置文件 → `SCHEDULER__*` 环境变量。

mod app_config;
mod sections;


pub use app_config::AppConfig;
pub use sections::{CleanupConfig, HistoryConfig, QueueConfig, SchedulerConfig, WorkerConfig};
