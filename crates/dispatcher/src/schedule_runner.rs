//! 单个调度的运行实例
//!
//! 每个启用的调度对应一个 tokio 任务：计算所有条目中最近的触发时间，
//! 睡眠到该时间点，然后把到期条目对应的作业投递到队列。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use scheduler_core::models::{ScheduleDefinition, ScheduleEntry};
use scheduler_core::SchedulerError;
use scheduler_infrastructure::{JobManager, QueueJobRequest};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cron_utils::CronScheduler;
use crate::time_provider::TimeProvider;

/// 调度运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Stopped,
    Active,
}

struct Trigger {
    entry: ScheduleEntry,
    cron: CronScheduler,
}

pub struct ScheduleRunner {
    schedule_id: String,
    version: i32,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ScheduleRunner {
    /// 启动调度。无法解析的条目记录错误后跳过，不影响其他条目。
    pub fn start(
        schedule: ScheduleDefinition,
        jobs: JobManager,
        clock: Arc<dyn TimeProvider>,
        parent: &CancellationToken,
    ) -> Self {
        let cancel = parent.child_token();
        let schedule_id = schedule.id.clone();
        let version = schedule.version;

        let mut triggers = Vec::with_capacity(schedule.entries.len());
        for entry in schedule.entries.values() {
            match CronScheduler::new(&entry.cron_expression, &schedule.timezone) {
                Ok(cron) => triggers.push(Trigger {
                    entry: entry.clone(),
                    cron,
                }),
                Err(e) => error!("调度 {} 的条目 {} 无法激活: {}", schedule.id, entry.id, e),
            }
        }

        info!("激活调度 {} ({} 个条目)", schedule.id, triggers.len());
        let handle = tokio::spawn(run_schedule(schedule, triggers, jobs, clock, cancel.clone()));

        Self {
            schedule_id,
            version,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn schedule_id(&self) -> &str {
        &self.schedule_id
    }

    /// 激活时读取的调度节点版本
    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn state(&self) -> ScheduleState {
        match &self.handle {
            Some(handle) if !handle.is_finished() => ScheduleState::Active,
            _ => ScheduleState::Stopped,
        }
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("调度 {} 的运行任务异常退出: {}", self.schedule_id, e);
                }
            }
        }
        info!("停止调度 {}", self.schedule_id);
    }
}

impl Drop for ScheduleRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_schedule(
    schedule: ScheduleDefinition,
    triggers: Vec<Trigger>,
    jobs: JobManager,
    clock: Arc<dyn TimeProvider>,
    cancel: CancellationToken,
) {
    let mut last = clock.now();
    loop {
        let Some(next) = next_fire_time(&triggers, last) else {
            debug!("调度 {} 没有后续触发时间", schedule.id);
            cancel.cancelled().await;
            return;
        };

        let wait = (next - clock.now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let now = clock.now();
        for trigger in &triggers {
            if trigger.cron.should_trigger(last, now) {
                fire(&schedule, &trigger.entry, &jobs, now).await;
            }
        }
        last = now;
    }
}

fn next_fire_time(triggers: &[Trigger], after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    triggers
        .iter()
        .filter_map(|t| t.cron.next_execution_time(after))
        .min()
}

async fn fire(schedule: &ScheduleDefinition, entry: &ScheduleEntry, jobs: &JobManager, now: DateTime<Utc>) {
    let job_id = entry.job_id(&schedule.id);
    let queue_id = schedule.effective_queue_id(jobs.default_queue_id()).to_string();
    let request = QueueJobRequest::new(&job_id, &entry.job_type_id, &schedule.context_path)
        .with_parameters(entry.job_parameters.clone())
        .with_queue(queue_id.as_str())
        .with_trigger(format!("cron:{}/{}", schedule.id, entry.id))
        .queued_at(now);

    counter!("scheduler_schedule_triggers_total").increment(1);
    match jobs.queue_job(request).await {
        Ok(_) => debug!(
            "条目 {}/{} 在 {} 触发，作业 {} 已投递到 {}",
            schedule.id,
            entry.id,
            now.format("%Y-%m-%d %H:%M:%S UTC"),
            job_id,
            queue_id
        ),
        Err(SchedulerError::JobStateConflict(msg)) => {
            warn!("条目 {}/{} 触发时作业仍在运行，跳过本次: {}", schedule.id, entry.id, msg)
        }
        Err(e) => error!("条目 {}/{} 触发失败: {}", schedule.id, entry.id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use scheduler_core::models::JobInfo;
    use scheduler_core::traits::{QueueService, ReceiveOptions};
    use scheduler_infrastructure::{InMemoryCoordinationStore, JobStore, StoreQueueService};

    use crate::time_provider::TokioTimeProvider;

    async fn job_manager() -> (JobManager, StoreQueueService) {
        let store = Arc::new(InMemoryCoordinationStore::new());
        let queues = StoreQueueService::new(store.clone());
        queues.create_queue("default").await.unwrap();
        let jobs = JobManager::new(JobStore::new(store), Arc::new(queues.clone()), "default");
        (jobs, queues)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_entry_at_cron_time() {
        let (jobs, queues) = job_manager().await;
        // 2024-01-05 是周五
        let start = Utc.with_ymd_and_hms(2024, 1, 5, 8, 59, 0).unwrap();
        let clock = Arc::new(TokioTimeProvider::starting_at(start));

        let mut schedule = ScheduleDefinition::new("s1").unwrap();
        let entry = ScheduleEntry::new("e1", "0 9 * * MON-FRI", "report.daily").unwrap();
        schedule.entries.insert("e1".to_string(), entry);

        let parent = CancellationToken::new();
        let runner = ScheduleRunner::start(schedule, jobs.clone(), clock, &parent);
        assert_eq!(runner.state(), ScheduleState::Active);

        tokio::time::sleep(Duration::from_secs(90)).await;

        let queue = queues.get_queue("default").await.unwrap().unwrap();
        let messages = queue
            .receive_messages(10, ReceiveOptions::immediate(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        let info = JobInfo::parse(&messages[0].body).unwrap();
        assert_eq!(info.job_id, "s1__entry__e1");
        assert_eq!(info.job_type_id, "report.daily");

        runner.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_job_is_skipped_until_done() {
        let (jobs, queues) = job_manager().await;
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(TokioTimeProvider::starting_at(start));

        let mut schedule = ScheduleDefinition::new("s1").unwrap();
        schedule
            .entries
            .insert("e1".to_string(), ScheduleEntry::new("e1", "* * * * *", "t").unwrap());

        let parent = CancellationToken::new();
        let runner = ScheduleRunner::start(schedule, jobs.clone(), clock, &parent);

        // 作业一直处于 WAITING，后续触发都被跳过
        tokio::time::sleep(Duration::from_secs(5 * 60 + 1)).await;
        let queue = queues.get_queue("default").await.unwrap().unwrap();
        assert_eq!(queue.message_count().await.unwrap(), 1);

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runner.state(), ScheduleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_queue_overrides_default() {
        let (jobs, queues) = job_manager().await;
        queues.create_queue("reports").await.unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();
        let clock = Arc::new(TokioTimeProvider::starting_at(start));

        let mut schedule = ScheduleDefinition::new("s2").unwrap();
        schedule.queue_id = Some("reports".to_string());
        schedule
            .entries
            .insert("e1".to_string(), ScheduleEntry::new("e1", "* * * * *", "t").unwrap());

        let runner = ScheduleRunner::start(schedule, jobs, clock, &CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(31)).await;

        let reports = queues.get_queue("reports").await.unwrap().unwrap();
        let default = queues.get_queue("default").await.unwrap().unwrap();
        assert_eq!(reports.message_count().await.unwrap(), 1);
        assert_eq!(default.message_count().await.unwrap(), 0);
        runner.stop().await;
    }
}
