use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::traits::{ExclusiveLock, LockService};
use scheduler_core::{SchedulerError, SchedulerResult};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Holder {
    owner: String,
    token: u64,
    valid: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashMap<String, Holder>>,
    released: Notify,
    next_token: AtomicU64,
}

impl LockTable {
    fn try_acquire(&self, name: &str, owner: &str) -> SchedulerResult<Option<(u64, Arc<AtomicBool>)>> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| SchedulerError::Internal("锁表互斥量已中毒".to_string()))?;
        if held.contains_key(name) {
            return Ok(None);
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let valid = Arc::new(AtomicBool::new(true));
        held.insert(
            name.to_string(),
            Holder {
                owner: owner.to_string(),
                token,
                valid: valid.clone(),
            },
        );
        Ok(Some((token, valid)))
    }

    /// 只有令牌匹配时才移除，避免释放别人后来获得的同名锁
    fn remove(&self, name: &str, token: Option<u64>) -> bool {
        let removed = match self.held.lock() {
            Ok(mut held) => match held.get(name) {
                Some(h) if token.map_or(true, |t| t == h.token) => held.remove(name),
                _ => None,
            },
            Err(_) => None,
        };
        match removed {
            Some(holder) => {
                holder.valid.store(false, Ordering::SeqCst);
                self.released.notify_waiters();
                true
            }
            None => false,
        }
    }
}

/// 进程内的排他锁服务
///
/// 等待者通过 `Notify` 在锁释放时被唤醒。`revoke` 用于模拟会话过期导致的锁丢失。
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockService {
    table: Arc<LockTable>,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 强制撤销锁，持有者的 `is_valid()` 随即变为 false
    pub fn revoke(&self, name: &str) -> bool {
        let revoked = self.table.remove(name, None);
        if revoked {
            warn!("锁已被撤销: {}", name);
        }
        revoked
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.table
            .held
            .lock()
            .map(|held| held.contains_key(name))
            .unwrap_or(false)
    }

    pub fn holder(&self, name: &str) -> Option<String> {
        self.table
            .held
            .lock()
            .ok()
            .and_then(|held| held.get(name).map(|h| h.owner.clone()))
    }
}

#[async_trait]
impl LockService for InMemoryLockService {
    async fn acquire_exclusive_lock(
        &self,
        name: &str,
        owner: &str,
        timeout: Option<Duration>,
    ) -> SchedulerResult<Box<dyn ExclusiveLock>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            // 先注册唤醒，再检查，避免错过检查与等待之间的释放
            let notified = self.table.released.notified();

            if let Some((token, valid)) = self.table.try_acquire(name, owner)? {
                debug!("获得锁: {} (持有者: {})", name, owner);
                return Ok(Box::new(InMemoryLock {
                    name: name.to_string(),
                    owner: owner.to_string(),
                    token,
                    valid,
                    table: self.table.clone(),
                }));
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(SchedulerError::LockTimeout(name.to_string()));
                    }
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(SchedulerError::LockTimeout(name.to_string()));
                    }
                }
            }
        }
    }
}

struct InMemoryLock {
    name: String,
    owner: String,
    token: u64,
    valid: Arc<AtomicBool>,
    table: Arc<LockTable>,
}

#[async_trait]
impl ExclusiveLock for InMemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    async fn release(&self) -> SchedulerResult<()> {
        if self.table.remove(&self.name, Some(self.token)) {
            info!("释放锁: {} (持有者: {})", self.name, self.owner);
        }
        Ok(())
    }
}

impl Drop for InMemoryLock {
    fn drop(&mut self) {
        self.table.remove(&self.name, Some(self.token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let locks = InMemoryLockService::new();
        let lock = locks
            .acquire_exclusive_lock("a", "node-1", Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(lock.is_valid());
        assert_eq!(locks.holder("a").as_deref(), Some("node-1"));

        let err = locks
            .acquire_exclusive_lock("a", "node-2", Some(Duration::ZERO))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::LockTimeout(_)));

        lock.release().await.unwrap();
        assert!(!lock.is_valid());
        assert!(locks
            .acquire_exclusive_lock("a", "node-2", Some(Duration::ZERO))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let locks = InMemoryLockService::new();
        let lock = locks.acquire_exclusive_lock("a", "first", None).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .acquire_exclusive_lock("a", "second", None)
                    .await
                    .map(|l| l.owner().to_string())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        lock.release().await.unwrap();

        let owner = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(owner, "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_wait_times_out() {
        let locks = InMemoryLockService::new();
        let _held = locks.acquire_exclusive_lock("a", "first", None).await.unwrap();
        let err = locks
            .acquire_exclusive_lock("a", "second", Some(Duration::from_secs(5)))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::LockTimeout(_)));
    }

    #[tokio::test]
    async fn test_revoke_invalidates_holder() {
        let locks = InMemoryLockService::new();
        let lock = locks.acquire_exclusive_lock("a", "first", None).await.unwrap();
        assert!(locks.revoke("a"));
        assert!(!lock.is_valid());

        // 新持有者不受旧句柄释放的影响
        let second = locks.acquire_exclusive_lock("a", "second", None).await.unwrap();
        lock.release().await.unwrap();
        assert!(second.is_valid());
        assert!(locks.is_locked("a"));
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let locks = InMemoryLockService::new();
        {
            let _lock = locks.acquire_exclusive_lock("a", "first", None).await.unwrap();
            assert!(locks.is_locked("a"));
        }
        assert!(!locks.is_locked("a"));
    }
}
