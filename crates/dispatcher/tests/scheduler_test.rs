use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, TimeZone, Utc, Weekday};
use scheduler_core::config::SchedulerConfig;
use scheduler_core::models::{JobInfo, JobState, ScheduleEntry};
use scheduler_core::traits::{CoordinationStore, QueueService, ReceiveOptions};
use scheduler_core::SchedulerError;
use scheduler_dispatcher::{ScheduleManager, Scheduler, TokioTimeProvider};
use scheduler_infrastructure::{
    InMemoryCoordinationStore, InMemoryLockService, JobManager, JobStore, StoreQueueService,
};
use scheduler_testing_utils::StaticProviderLookup;
use tokio_util::sync::CancellationToken;

struct Cluster {
    store: Arc<dyn CoordinationStore>,
    queues: StoreQueueService,
    jobs: JobManager,
    schedules: ScheduleManager,
    locks: InMemoryLockService,
}

async fn cluster() -> Cluster {
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
    let queues = StoreQueueService::new(store.clone());
    queues.create_queue("default").await.unwrap();
    let jobs = JobManager::new(JobStore::new(store.clone()), Arc::new(queues.clone()), "default");
    let schedules = ScheduleManager::new(
        store.clone(),
        Arc::new(StaticProviderLookup::new(["report.daily", "backup"])),
    );
    Cluster {
        store,
        queues,
        jobs,
        schedules,
        locks: InMemoryLockService::new(),
    }
}

fn node(cluster: &Cluster, owner: &str, start: chrono::DateTime<Utc>) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(
        SchedulerConfig {
            lock_check_interval_ms: 100,
            backoff_initial_ms: 500,
            backoff_max_ms: 2_000,
            ..SchedulerConfig::default()
        },
        owner,
        cluster.store.clone(),
        Arc::new(cluster.locks.clone()),
        cluster.schedules.clone(),
        cluster.jobs.clone(),
        Arc::new(TokioTimeProvider::starting_at(start)),
    ))
}

fn spawn(scheduler: &Arc<Scheduler>, cancel: &CancellationToken) -> tokio::task::JoinHandle<()> {
    let scheduler = scheduler.clone();
    let cancel = cancel.clone();
    tokio::spawn(async move { scheduler.run(cancel).await })
}

#[tokio::test(start_paused = true)]
async fn test_weekday_entry_fires_five_times_a_week() {
    let c = cluster().await;
    c.schedules.create_schedule("s1").await.unwrap();
    c.schedules
        .add_entry("s1", ScheduleEntry::new("e1", "0 9 * * MON-FRI", "report.daily").unwrap())
        .await
        .unwrap();
    c.schedules.enable_schedule("s1").await.unwrap();

    // 周六零点开始
    let start = Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap();
    let scheduler = node(&c, "node-a", start);
    let cancel = CancellationToken::new();
    let handle = spawn(&scheduler, &cancel);

    let queue = c.queues.get_queue("default").await.unwrap().unwrap();
    let mut fired_on = Vec::new();
    for _ in 0..7 {
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        let messages = queue
            .receive_messages(10, ReceiveOptions::immediate(Duration::from_secs(60)))
            .await
            .unwrap();
        for message in messages {
            let info = JobInfo::parse(&message.body).unwrap();
            assert_eq!(info.job_id, "s1__entry__e1");
            assert!(queue.delete_message(&message).await.unwrap());
            let record = c.jobs.get_job("/", &info.job_id).await.unwrap().unwrap();
            assert_eq!(record.state, JobState::Waiting);
            fired_on.push(record.last_queued.unwrap().weekday());
            // 模拟 Worker 执行完毕
            c.jobs
                .job_store()
                .set_state("/", &info.job_id, JobState::None)
                .await
                .unwrap();
        }
    }

    assert_eq!(
        fired_on,
        vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
    );
    cancel.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_only_lock_holder_runs_schedules() {
    let c = cluster().await;
    c.schedules.create_schedule("s1").await.unwrap();
    c.schedules
        .add_entry("s1", ScheduleEntry::new("e1", "0 * * * *", "backup").unwrap())
        .await
        .unwrap();
    c.schedules.enable_schedule("s1").await.unwrap();

    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let a = node(&c, "node-a", start);
    let b = node(&c, "node-b", start);
    let cancel_a = CancellationToken::new();
    let cancel_b = CancellationToken::new();
    let handle_a = spawn(&a, &cancel_a);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let handle_b = spawn(&b, &cancel_b);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(a.active_schedules().await, vec!["s1"]);
    assert!(b.active_schedules().await.is_empty());

    // A 停止后 B 接手
    cancel_a.cancel();
    handle_a.await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(b.active_schedules().await, vec!["s1"]);
    assert_eq!(c.locks.holder("gyrex.jobs.scheduler").as_deref(), Some("node-b"));

    cancel_b.cancel();
    handle_b.await.unwrap();
}

#[tokio::test]
async fn test_enable_rejects_entries_with_unknown_job_types() {
    let c = cluster().await;
    c.schedules.create_schedule("s1").await.unwrap();
    c.schedules
        .add_entry("s1", ScheduleEntry::new("e1", "0 9 * * *", "backup").unwrap())
        .await
        .unwrap();

    // 提供者下线后启用失败
    let narrowed = ScheduleManager::new(
        c.store.clone(),
        Arc::new(StaticProviderLookup::new(["report.daily"])),
    );
    assert!(matches!(
        narrowed.enable_schedule("s1").await,
        Err(SchedulerError::JobProviderNotFound(t)) if t == "backup"
    ));
    let schedule = c.schedules.get_schedule("s1").await.unwrap().unwrap();
    assert!(!schedule.enabled);
}
