//! 协作者接口
//!
//! 引擎只通过这些接口访问外部世界，具体实现由调用方注入。

pub mod coordination;
pub mod job;
pub mod lock;
pub mod queue;

pub use coordination::*;
pub use job::*;
pub use lock::*;
pub use queue::*;
