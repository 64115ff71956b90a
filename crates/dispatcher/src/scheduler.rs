//! 集群单例的调度引擎
//!
//! 集群中只有持有调度锁的节点运行CRON引擎。引擎获得锁之后订阅协调存储的
//! 变更事件，为每个启用的调度启动一个 [`ScheduleRunner`]，并定期检查锁是否仍然有效。
//! 失去锁或运行出错时停止所有调度、释放锁，按指数退避稍后重新竞争。

use std::collections::HashMap;
use std::sync::Arc;

use scheduler_core::backoff::ExponentialBackoff;
use scheduler_core::config::SchedulerConfig;
use scheduler_core::paths;
use scheduler_core::traits::{ensure_path, CoordinationStore, ExclusiveLock, LockService, NodeEvent};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::JobManager;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::schedule_manager::ScheduleManager;
use crate::schedule_runner::{ScheduleRunner, ScheduleState};
use crate::time_provider::TimeProvider;

pub struct Scheduler {
    config: SchedulerConfig,
    owner: String,
    store: Arc<dyn CoordinationStore>,
    locks: Arc<dyn LockService>,
    schedules: ScheduleManager,
    jobs: JobManager,
    clock: Arc<dyn TimeProvider>,
    runners: RwLock<HashMap<String, ScheduleRunner>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        owner: impl Into<String>,
        store: Arc<dyn CoordinationStore>,
        locks: Arc<dyn LockService>,
        schedules: ScheduleManager,
        jobs: JobManager,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            config,
            owner: owner.into(),
            store,
            locks,
            schedules,
            jobs,
            clock,
            runners: RwLock::new(HashMap::new()),
        }
    }

    /// 当前处于激活状态的调度
    pub async fn active_schedules(&self) -> Vec<String> {
        let runners = self.runners.read().await;
        let mut ids: Vec<String> = runners
            .values()
            .filter(|r| r.state() == ScheduleState::Active)
            .map(|r| r.schedule_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// 运行直到 `cancel` 被触发。单次运行失败不会让循环退出。
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff =
            ExponentialBackoff::new(self.config.backoff_initial(), self.config.backoff_max());
        info!("调度引擎启动，锁: {}", self.config.lock_name);

        while !cancel.is_cancelled() {
            match self.run_once(&cancel).await {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!("调度引擎运行中断: {}，{:?} 后重试", e, delay);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!("调度引擎已停止");
    }

    /// 获取锁并驱动所有调度，直到取消、失去锁或出错
    pub async fn run_once(&self, cancel: &CancellationToken) -> SchedulerResult<()> {
        let lock = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            lock = self.locks.acquire_exclusive_lock(&self.config.lock_name, &self.owner, None) => lock?,
        };
        info!("获得调度锁 {} (持有者 {})", lock.name(), lock.owner());

        // 先订阅再加载，加载期间的变更不会丢失
        let events = self.store.subscribe();
        let runs = cancel.child_token();
        let result = self.drive(lock.as_ref(), events, &runs).await;

        runs.cancel();
        self.stop_all().await;
        if let Err(e) = lock.release().await {
            warn!("释放调度锁失败: {}", e);
        }
        if let Err(e) = &result {
            error!("调度引擎运行失败: {}", e);
        }
        result
    }

    async fn drive(
        &self,
        lock: &dyn ExclusiveLock,
        mut events: broadcast::Receiver<NodeEvent>,
        cancel: &CancellationToken,
    ) -> SchedulerResult<()> {
        ensure_path(self.store.as_ref(), paths::SCHEDULES_ROOT).await?;
        self.reload_all(cancel).await?;

        let mut ticker = tokio::time::interval(self.config.lock_check_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if !lock.is_valid() {
                        return Err(SchedulerError::LockLost(lock.name().to_string()));
                    }
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        if let Some(schedule_id) = schedule_id_of(event.path()) {
                            self.reload(schedule_id, cancel).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("调度引擎错过了 {} 个存储事件，重新加载全部调度", missed);
                        self.reload_all(cancel).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SchedulerError::Internal("协调存储事件通道已关闭".to_string()));
                    }
                },
            }
        }
    }

    async fn reload_all(&self, cancel: &CancellationToken) -> SchedulerResult<()> {
        let mut ids = self.schedules.list_schedules().await?;
        for known in self.runners.read().await.keys() {
            if !ids.contains(known) {
                ids.push(known.clone());
            }
        }
        for id in ids {
            self.reload(&id, cancel).await?;
        }
        Ok(())
    }

    /// 按存储中的最新状态激活或停止调度
    async fn reload(&self, schedule_id: &str, cancel: &CancellationToken) -> SchedulerResult<()> {
        let schedule = match self.schedules.get_schedule(schedule_id).await {
            Ok(schedule) => schedule,
            Err(e) if e.is_configuration() || matches!(e, SchedulerError::Serialization(_)) => {
                error!("调度 {} 无法加载: {}", schedule_id, e);
                None
            }
            Err(e) => return Err(e),
        };

        let mut runners = self.runners.write().await;
        match schedule {
            Some(schedule) if schedule.enabled => {
                if let Some(runner) = runners.get(schedule_id) {
                    if runner.version() == schedule.version && runner.state() == ScheduleState::Active {
                        return Ok(());
                    }
                }
                if let Some(previous) = runners.remove(schedule_id) {
                    previous.stop().await;
                }
                let runner = ScheduleRunner::start(schedule, self.jobs.clone(), self.clock.clone(), cancel);
                runners.insert(schedule_id.to_string(), runner);
            }
            _ => {
                if let Some(runner) = runners.remove(schedule_id) {
                    debug!("调度 {} 已禁用或删除", schedule_id);
                    runner.stop().await;
                }
            }
        }
        Ok(())
    }

    async fn stop_all(&self) {
        let mut runners = self.runners.write().await;
        for (_, runner) in runners.drain() {
            runner.stop().await;
        }
    }
}

/// `/gyrex/jobs/schedules/{id}/...` 中的调度ID
fn schedule_id_of(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(paths::SCHEDULES_ROOT)?.strip_prefix('/')?;
    rest.split('/').next().filter(|id| !id.is_empty())
}
