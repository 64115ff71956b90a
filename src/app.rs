use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use scheduler_core::traits::{CoordinationStore, LockService, QueueService};
use scheduler_core::AppConfig;
use scheduler_dispatcher::{ScheduleManager, Scheduler, SystemTimeProvider};
use scheduler_infrastructure::{
    CleanupService, InMemoryCoordinationStore, InMemoryLockService, JobManager, JobStore,
    StoreQueueService,
};
use scheduler_worker::{JobProviderRegistry, WorkerEngine};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行调度引擎
    Scheduler,
    /// 仅运行Worker
    Worker,
    All,
}

impl AppMode {
    pub fn runs_scheduler(self) -> bool {
        matches!(self, AppMode::Scheduler | AppMode::All)
    }

    pub fn runs_worker(self) -> bool {
        matches!(self, AppMode::Worker | AppMode::All)
    }
}

impl std::str::FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduler" => Ok(AppMode::Scheduler),
            "worker" => Ok(AppMode::Worker),
            "all" => Ok(AppMode::All),
            other => Err(anyhow::anyhow!("不支持的运行模式: {other}")),
        }
    }
}

/// 主应用程序：装配协作者并运行调度引擎、Worker 和清理服务
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    store: Arc<dyn CoordinationStore>,
    locks: Arc<dyn LockService>,
    queues: StoreQueueService,
    jobs: JobStore,
    job_manager: JobManager,
    providers: Arc<JobProviderRegistry>,
    schedules: ScheduleManager,
}

impl Application {
    /// 使用进程内的协调存储和锁服务
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        Self::with_collaborators(
            config,
            mode,
            Arc::new(InMemoryCoordinationStore::new()),
            Arc::new(InMemoryLockService::new()),
        )
        .await
    }

    pub async fn with_collaborators(
        config: AppConfig,
        mode: AppMode,
        store: Arc<dyn CoordinationStore>,
        locks: Arc<dyn LockService>,
    ) -> Result<Self> {
        config.validate()?;
        info!("初始化应用程序，模式: {:?}", mode);

        let queues = StoreQueueService::with_min_poll_interval(
            store.clone(),
            config.queue.min_poll_interval(),
        );
        for queue_id in [&config.queue.default_queue_id, &config.queue.failed_queue_id] {
            queues
                .get_or_create_queue(queue_id)
                .await
                .with_context(|| format!("创建队列失败: {queue_id}"))?;
        }

        let jobs = JobStore::with_history_limits(
            store.clone(),
            config.history.max_entries,
            config.history.max_message_length,
        );
        let job_manager = JobManager::new(
            jobs.clone(),
            Arc::new(queues.clone()) as Arc<dyn QueueService>,
            config.queue.default_queue_id.clone(),
        );
        let providers = Arc::new(JobProviderRegistry::new());
        let schedules = ScheduleManager::new(store.clone(), providers.clone());

        Ok(Self {
            config,
            mode,
            store,
            locks,
            queues,
            jobs,
            job_manager,
            providers,
            schedules,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn providers(&self) -> &Arc<JobProviderRegistry> {
        &self.providers
    }

    pub fn schedules(&self) -> &ScheduleManager {
        &self.schedules
    }

    pub fn job_manager(&self) -> &JobManager {
        &self.job_manager
    }

    pub fn queues(&self) -> &StoreQueueService {
        &self.queues
    }

    /// 运行直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        if self.mode.runs_scheduler() && self.config.scheduler.enabled {
            let scheduler = Scheduler::new(
                self.config.scheduler.clone(),
                self.config.worker.worker_id.clone(),
                self.store.clone(),
                self.locks.clone(),
                self.schedules.clone(),
                self.job_manager.clone(),
                Arc::new(SystemTimeProvider),
            );
            let token = cancel.clone();
            handles.push(("scheduler", tokio::spawn(async move { scheduler.run(token).await })));
        } else if self.mode.runs_scheduler() {
            warn!("调度引擎已在配置中禁用");
        }

        if self.mode.runs_worker() && self.config.worker.enabled {
            let worker = WorkerEngine::new(
                self.config.worker.clone(),
                self.config.queue.clone(),
                Arc::new(self.queues.clone()),
                self.providers.clone(),
                self.jobs.clone(),
            );
            let token = cancel.clone();
            handles.push(("worker", tokio::spawn(async move { worker.run(token).await })));
        } else if self.mode.runs_worker() {
            warn!("Worker 已在配置中禁用");
        }

        let mut cleanup = CleanupService::new(
            self.jobs.clone(),
            self.locks.clone(),
            self.config.cleanup.clone(),
            self.config.worker.worker_id.clone(),
        );
        cleanup.start().await.context("启动清理服务失败")?;

        info!("应用程序已启动");
        let _ = shutdown_rx.recv().await;
        info!("应用程序开始关闭");

        cancel.cancel();
        let (names, tasks): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (name, joined) in names.into_iter().zip(join_all(tasks).await) {
            if let Err(e) = joined {
                error!("{} 任务异常退出: {}", name, e);
            }
        }
        if let Err(e) = cleanup.stop().await {
            warn!("停止清理服务失败: {}", e);
        }
        info!("应用程序已关闭");
        Ok(())
    }
}
