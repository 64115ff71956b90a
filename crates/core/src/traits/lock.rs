use std::time::Duration;

use async_trait::async_trait;

use crate::SchedulerResult;

/// 已持有的排他锁
#[async_trait]
pub trait ExclusiveLock: Send + Sync {
    fn name(&self) -> &str;

    fn owner(&self) -> &str;

    /// 锁可能在持有期间丢失（会话过期、被撤销）
    fn is_valid(&self) -> bool;

    async fn release(&self) -> SchedulerResult<()>;
}

/// 集群范围的排他锁服务
#[async_trait]
pub trait LockService: Send + Sync {
    /// 获取排他锁。
    ///
    /// `timeout` 为 None 时无限等待，`Some(Duration::ZERO)` 只尝试一次；
    /// 超时返回 `SchedulerError::LockTimeout`。
    async fn acquire_exclusive_lock(
        &self,
        name: &str,
        owner: &str,
        timeout: Option<Duration>,
    ) -> SchedulerResult<Box<dyn ExclusiveLock>>;
}
