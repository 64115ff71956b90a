use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 队列相关配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    /// 调度未指定队列时的投递目标，也是 Worker 唯一消费的队列
    pub default_queue_id: String,
    /// 死信队列，接收无法解析的消息
    pub failed_queue_id: String,
    pub receive_timeout_ms: u64,
    pub visibility_timeout_ms: u64,
    pub min_poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_queue_id: "gyrex.jobs.queue.default".to_string(),
            failed_queue_id: "gyrex.jobs.queue.failed".to_string(),
            receive_timeout_ms: 60_000,
            visibility_timeout_ms: 60_000,
            min_poll_interval_ms: 250,
        }
    }
}

impl QueueConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_millis(self.min_poll_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_queue_id.trim().is_empty() {
            return Err(anyhow::anyhow!("默认队列ID不能为空"));
        }
        if self.failed_queue_id.trim().is_empty() {
            return Err(anyhow::anyhow!("失败队列ID不能为空"));
        }
        if self.failed_queue_id == self.default_queue_id {
            return Err(anyhow::anyhow!("失败队列不能与默认队列相同"));
        }
        if self.visibility_timeout_ms == 0 {
            return Err(anyhow::anyhow!("消息隐藏时长必须大于0"));
        }
        if self.min_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("最小轮询间隔必须大于0"));
        }
        Ok(())
    }
}

/// 调度引擎配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub lock_name: String,
    pub lock_check_interval_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_name: "gyrex.jobs.scheduler".to_string(),
            lock_check_interval_ms: 1_000,
            backoff_initial_ms: 30_000,
            backoff_max_ms: 300_000,
        }
    }
}

impl SchedulerConfig {
    pub fn lock_check_interval(&self) -> Duration {
        Duration::from_millis(self.lock_check_interval_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.lock_name.trim().is_empty() {
            return Err(anyhow::anyhow!("调度锁名称不能为空"));
        }
        if self.lock_check_interval_ms == 0 {
            return Err(anyhow::anyhow!("锁检查间隔必须大于0"));
        }
        validate_backoff(self.backoff_initial_ms, self.backoff_max_ms)
    }
}

/// Worker引擎配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_id: String,
    pub max_concurrent_jobs: usize,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// 一轮没有取到消息后的休眠时长
    pub idle_sleep_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: default_worker_id(),
            max_concurrent_jobs: 4,
            backoff_initial_ms: 30_000,
            backoff_max_ms: 300_000,
            idle_sleep_ms: 1_000,
        }
    }
}

fn default_worker_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "worker".to_string())
}

impl WorkerConfig {
    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_id.trim().is_empty() {
            return Err(anyhow::anyhow!("Worker ID不能为空"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(anyhow::anyhow!("最大并发作业数必须大于0"));
        }
        validate_backoff(self.backoff_initial_ms, self.backoff_max_ms)
    }
}

/// 清理服务配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    /// 小于等于0时不删除任何作业
    pub max_age_days: i64,
    pub hung_job_threshold_seconds: u64,
    /// 单个作业锁的等待时长，0表示只尝试一次
    pub lock_timeout_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 3_600,
            max_age_days: 14,
            hung_job_threshold_seconds: 7_200,
            lock_timeout_ms: 0,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// None 表示最大保留时长为无限
    /// 超出可表示范围的天数视同永不过期
    pub fn max_age(&self) -> Option<chrono::Duration> {
        if self.max_age_days <= 0 {
            None
        } else {
            chrono::Duration::try_days(self.max_age_days)
        }
    }

    /// 超出可表示范围时视同永不判定为卡死
    pub fn hung_job_threshold(&self) -> chrono::Duration {
        i64::try_from(self.hung_job_threshold_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_seconds == 0 {
            return Err(anyhow::anyhow!("清理间隔必须大于0"));
        }
        if self.hung_job_threshold_seconds == 0 {
            return Err(anyhow::anyhow!("卡死检测阈值必须大于0"));
        }
        if self.max_age_days > 0 && chrono::Duration::try_days(self.max_age_days).is_none() {
            return Err(anyhow::anyhow!("过期天数 {} 超出范围", self.max_age_days));
        }
        if i64::try_from(self.hung_job_threshold_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .is_none()
        {
            return Err(anyhow::anyhow!(
                "卡死检测阈值 {}s 超出范围",
                self.hung_job_threshold_seconds
            ));
        }
        Ok(())
    }
}

/// 作业历史配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_entries: usize,
    pub max_message_length: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: 120,
            max_message_length: 2_000,
        }
    }
}

impl HistoryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_entries == 0 {
            return Err(anyhow::anyhow!("历史条目上限必须大于0"));
        }
        if self.max_message_length == 0 {
            return Err(anyhow::anyhow!("历史消息长度上限必须大于0"));
        }
        Ok(())
    }
}

fn validate_backoff(initial_ms: u64, max_ms: u64) -> anyhow::Result<()> {
    if initial_ms == 0 {
        return Err(anyhow::anyhow!("初始退避时长必须大于0"));
    }
    if initial_ms > max_ms {
        return Err(anyhow::anyhow!(
            "初始退避时长 {initial_ms}ms 不能大于最大退避时长 {max_ms}ms"
        ));
    }
    Ok(())
}
