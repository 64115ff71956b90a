use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use scheduler_core::config::CleanupConfig;
use scheduler_core::models::JobState;
use scheduler_core::traits::LockService;
use scheduler_core::{SchedulerError, SchedulerResult};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::job_store::{JobStore, VersionedRecord};

/// 作业清理服务
///
/// 周期性扫描作业记录：复位卡死的作业，删除超过保留时长且已处于 NONE 的作业及其历史。
/// 每个作业在单独的排他锁内处理，拿不到锁的作业本轮直接跳过。
pub struct CleanupService {
    jobs: JobStore,
    locks: Arc<dyn LockService>,
    config: CleanupConfig,
    owner: String,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    cleanup_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CleanupService {
    pub fn new(
        jobs: JobStore,
        locks: Arc<dyn LockService>,
        config: CleanupConfig,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            locks,
            config,
            owner: owner.into(),
            shutdown_tx: None,
            cleanup_handle: None,
        }
    }

    /// 启动后台清理任务
    pub async fn start(&mut self) -> SchedulerResult<()> {
        if !self.config.enabled {
            info!("清理服务已禁用");
            return Ok(());
        }
        if self.cleanup_handle.is_some() {
            return Ok(());
        }

        info!("启动清理服务: {:?}", self.config);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let jobs = self.jobs.clone();
        let locks = self.locks.clone();
        let config = self.config.clone();
        let owner = self.owner.clone();

        let handle = tokio::spawn(async move {
            let mut cleanup_interval = interval(config.interval());
            loop {
                tokio::select! {
                    _ = cleanup_interval.tick() => {
                        // 失败的一轮下次直接重跑即可
                        if let Err(e) = Self::perform_cleanup(&jobs, locks.as_ref(), &config, &owner).await {
                            error!("作业清理失败: {}", e);
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("收到清理服务关闭请求");
                        break;
                    }
                }
            }
        });

        self.cleanup_handle = Some(handle);
        Ok(())
    }

    pub async fn stop(&mut self) -> SchedulerResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.cleanup_handle.take() {
            if let Err(e) = handle.await {
                warn!("等待清理服务停止时出错: {}", e);
            }
        }
        info!("清理服务已停止");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.cleanup_handle.is_some()
    }

    /// 立即执行一轮清理
    pub async fn cleanup_once(&self) -> SchedulerResult<CleanupStats> {
        Self::perform_cleanup(&self.jobs, self.locks.as_ref(), &self.config, &self.owner).await
    }

    /// 任何错误都会中止整轮清理；清理是幂等的，可以稍后重跑
    async fn perform_cleanup(
        jobs: &JobStore,
        locks: &dyn LockService,
        config: &CleanupConfig,
        owner: &str,
    ) -> SchedulerResult<CleanupStats> {
        let start_time = std::time::Instant::now();
        let mut stats = CleanupStats::default();
        let now = Utc::now();

        // 强制重新同步作业子树，以正确性优先
        jobs.sync_jobs().await?;

        for context_path in jobs.list_contexts().await? {
            for job_id in jobs.list_job_ids(&context_path).await? {
                stats.scanned += 1;
                Self::cleanup_job(jobs, locks, config, owner, &context_path, &job_id, now, &mut stats)
                    .await?;
            }
        }

        stats.duration = start_time.elapsed();
        info!(
            "作业清理完成: 扫描 {} 个, 删除 {} 个, 复位 {} 个, 锁被占用跳过 {} 个, 耗时 {:?}",
            stats.scanned, stats.removed, stats.reset, stats.skipped_locked, stats.duration
        );
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    async fn cleanup_job(
        jobs: &JobStore,
        locks: &dyn LockService,
        config: &CleanupConfig,
        owner: &str,
        context_path: &str,
        job_id: &str,
        now: DateTime<Utc>,
        stats: &mut CleanupStats,
    ) -> SchedulerResult<()> {
        let lock_name = JobStore::job_lock_name(context_path, job_id);
        let lock = match locks
            .acquire_exclusive_lock(&lock_name, owner, Some(config.lock_timeout()))
            .await
        {
            Ok(lock) => lock,
            Err(SchedulerError::LockTimeout(_)) => {
                debug!("作业 {} 的锁被占用，本轮跳过", job_id);
                stats.skipped_locked += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let result = Self::cleanup_locked(jobs, config, context_path, job_id, now, stats).await;
        let released = lock.release().await;
        result?;
        released
    }

    async fn cleanup_locked(
        jobs: &JobStore,
        config: &CleanupConfig,
        context_path: &str,
        job_id: &str,
        now: DateTime<Utc>,
        stats: &mut CleanupStats,
    ) -> SchedulerResult<()> {
        // 锁内重新读取
        let Some(VersionedRecord { mut record, .. }) = jobs.get(context_path, job_id).await? else {
            return Ok(());
        };

        // 启发式复位：只是很慢而没有死掉的Worker也会被复位，作业可能被重复执行
        let threshold = config.hung_job_threshold();
        if record.is_stuck(now, threshold) {
            let since = match record.state {
                JobState::Waiting => record.last_queued,
                _ => record.last_start.or(record.last_queued),
            };
            let elapsed = since.map(|t| (now - t).num_seconds());
            info!(
                "作业 {} 处于 {} 超过阈值 {}s (已持续 {:?}s)，强制复位为 NONE",
                job_id,
                record.state,
                threshold.num_seconds(),
                elapsed
            );
            record.state = JobState::None;
            record.active = false;
            jobs.put(&record, None).await?;
            stats.reset += 1;
            counter!("scheduler_cleanup_jobs_reset_total").increment(1);
        }

        if record.state != JobState::None {
            stats.skipped_active += 1;
            return Ok(());
        }

        let Some(max_age) = config.max_age() else {
            return Ok(());
        };
        if let Some(last_activity) = record.last_activity() {
            if now - last_activity < max_age {
                stats.skipped_young += 1;
                return Ok(());
            }
        }

        jobs.remove(context_path, job_id).await?;
        stats.removed += 1;
        counter!("scheduler_cleanup_jobs_removed_total").increment(1);
        debug!("已删除过期作业 {}{}", context_path, job_id);
        Ok(())
    }
}

/// 清理统计信息
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupStats {
    pub scanned: usize,
    pub removed: usize,
    /// 卡死后被复位的作业数
    pub reset: usize,
    pub skipped_active: usize,
    pub skipped_young: usize,
    pub skipped_locked: usize,
    pub duration: std::time::Duration,
}

impl CleanupStats {
    pub fn has_cleanup(&self) -> bool {
        self.removed > 0 || self.reset > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationStore;
    use crate::lock::InMemoryLockService;
    use chrono::Duration;
    use scheduler_core::models::{JobRecord, JobResult};

    struct Fixture {
        jobs: JobStore,
        locks: InMemoryLockService,
    }

    fn fixture() -> Fixture {
        Fixture {
            jobs: JobStore::new(Arc::new(InMemoryCoordinationStore::new())),
            locks: InMemoryLockService::new(),
        }
    }

    fn service(f: &Fixture, config: CleanupConfig) -> CleanupService {
        CleanupService::new(f.jobs.clone(), Arc::new(f.locks.clone()), config, "cleanup-test")
    }

    fn record(id: &str, state: JobState, age: Duration) -> JobRecord {
        let mut record = JobRecord::new(id, "t", "/");
        record.state = state;
        let at = Utc::now() - age;
        record.last_queued = Some(at);
        record.last_start = Some(at);
        let mut result = JobResult::ok("done");
        result.timestamp = at;
        record.last_result = Some(result);
        record
    }

    #[tokio::test]
    async fn test_removes_only_old_none_jobs() {
        let f = fixture();
        f.jobs.put(&record("old", JobState::None, Duration::days(30)), None).await.unwrap();
        f.jobs.put(&record("young", JobState::None, Duration::days(1)), None).await.unwrap();
        f.jobs
            .put(&record("waiting", JobState::Waiting, Duration::minutes(5)), None)
            .await
            .unwrap();

        let stats = service(&f, CleanupConfig::default()).cleanup_once().await.unwrap();
        assert_eq!(stats.scanned, 3);
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.skipped_young, 1);
        assert_eq!(stats.skipped_active, 1);
        assert!(f.jobs.get("/", "old").await.unwrap().is_none());
        assert!(f.jobs.get("/", "young").await.unwrap().is_some());
        assert!(f.jobs.get("/", "waiting").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_non_positive_max_age_disables_removal() {
        let f = fixture();
        f.jobs.put(&record("ancient", JobState::None, Duration::days(3650)), None).await.unwrap();
        for max_age_days in [0, -1] {
            let config = CleanupConfig {
                max_age_days,
                ..CleanupConfig::default()
            };
            let stats = service(&f, config).cleanup_once().await.unwrap();
            assert_eq!(stats.removed, 0);
        }
        assert!(f.jobs.get("/", "ancient").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stuck_job_is_reset_but_not_removed_until_old() {
        let f = fixture();
        let mut stuck = record("stuck", JobState::Running, Duration::hours(3));
        stuck.active = true;
        f.jobs.put(&stuck, None).await.unwrap();

        let stats = service(&f, CleanupConfig::default()).cleanup_once().await.unwrap();
        assert_eq!(stats.reset, 1);
        assert_eq!(stats.removed, 0);

        let after = f.jobs.get("/", "stuck").await.unwrap().unwrap().record;
        assert_eq!(after.state, JobState::None);
        assert!(!after.active);
    }

    /// 复位是启发式的：一个仍在运行但超过阈值的慢作业同样会被复位，
    /// 之后它可能被再次入队，与仍在运行的原实例重复执行。
    #[tokio::test]
    async fn test_slow_but_alive_job_is_also_reset() {
        let f = fixture();
        let slow = record("slow", JobState::Running, Duration::hours(2) + Duration::minutes(1));
        f.jobs.put(&slow, None).await.unwrap();

        service(&f, CleanupConfig::default()).cleanup_once().await.unwrap();
        let after = f.jobs.get("/", "slow").await.unwrap().unwrap().record;
        assert_eq!(after.state, JobState::None);
    }

    #[tokio::test]
    async fn test_locked_job_is_skipped() {
        let f = fixture();
        f.jobs.put(&record("old", JobState::None, Duration::days(30)), None).await.unwrap();
        let _held = f
            .locks
            .acquire_exclusive_lock(&JobStore::job_lock_name("/", "old"), "worker", None)
            .await
            .unwrap();

        let stats = service(&f, CleanupConfig::default()).cleanup_once().await.unwrap();
        assert_eq!(stats.skipped_locked, 1);
        assert_eq!(stats.removed, 0);
        assert!(f.jobs.get("/", "old").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let f = fixture();
        f.jobs.put(&record("old", JobState::None, Duration::days(30)), None).await.unwrap();
        let service = service(&f, CleanupConfig::default());
        assert_eq!(service.cleanup_once().await.unwrap().removed, 1);
        let again = service.cleanup_once().await.unwrap();
        assert_eq!(again.removed, 0);
        assert_eq!(again.scanned, 0);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let f = fixture();
        let mut service = service(&f, CleanupConfig::default());
        service.start().await.unwrap();
        assert!(service.is_running());
        service.stop().await.unwrap();
        assert!(!service.is_running());

        let mut disabled = CleanupService::new(
            f.jobs.clone(),
            Arc::new(f.locks.clone()),
            CleanupConfig {
                enabled: false,
                ..CleanupConfig::default()
            },
            "x",
        );
        disabled.start().await.unwrap();
        assert!(!disabled.is_running());
    }
}
