use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::validate_id;
use crate::SchedulerResult;

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_CONTEXT_PATH: &str = "/";

/// 条目触发的作业ID格式：`{schedule}__entry__{entry}`
pub fn entry_job_id(schedule_id: &str, entry_id: &str) -> String {
    format!("{schedule_id}__entry__{entry_id}")
}

/// 调度定义
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleDefinition {
    pub id: String,
    pub context_path: String,
    pub timezone: String,
    pub enabled: bool,
    /// 目标队列；None 表示使用默认队列
    pub queue_id: Option<String>,
    pub entries: BTreeMap<String, ScheduleEntry>,
    /// 调度节点的存储版本，用于比较并设置
    pub version: i32,
}

impl ScheduleDefinition {
    pub fn new(id: impl Into<String>) -> SchedulerResult<Self> {
        let id = id.into();
        validate_id(&id, "调度ID")?;
        Ok(Self {
            id,
            context_path: DEFAULT_CONTEXT_PATH.to_string(),
            timezone: DEFAULT_TIMEZONE.to_string(),
            enabled: false,
            queue_id: None,
            entries: BTreeMap::new(),
            version: -1,
        })
    }

    pub fn from_data(id: impl Into<String>, data: ScheduleData, version: i32) -> Self {
        Self {
            id: id.into(),
            context_path: data.context_path,
            timezone: data.timezone,
            enabled: data.enabled,
            queue_id: data.queue_id,
            entries: data.entries,
            version,
        }
    }

    pub fn data(&self) -> ScheduleData {
        ScheduleData {
            context_path: self.context_path.clone(),
            timezone: self.timezone.clone(),
            enabled: self.enabled,
            queue_id: self.queue_id.clone(),
            entries: self.entries.clone(),
        }
    }

    pub fn entry(&self, entry_id: &str) -> Option<&ScheduleEntry> {
        self.entries.get(entry_id)
    }

    /// 实际投递的队列
    pub fn effective_queue_id<'a>(&'a self, default_queue_id: &'a str) -> &'a str {
        self.queue_id.as_deref().unwrap_or(default_queue_id)
    }
}

/// 调度节点的持久化内容。条目与启用标志保存在同一个节点中，
/// 一次带版本校验的写入同时覆盖两者。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleData {
    #[serde(default = "default_context_path")]
    pub context_path: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub queue_id: Option<String>,
    #[serde(default)]
    pub entries: BTreeMap<String, ScheduleEntry>,
}

fn default_context_path() -> String {
    DEFAULT_CONTEXT_PATH.to_string()
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

/// 调度条目
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub id: String,
    /// 经典5字段Unix CRON表达式
    pub cron_expression: String,
    pub job_type_id: String,
    #[serde(default)]
    pub job_parameters: BTreeMap<String, String>,
}

impl ScheduleEntry {
    pub fn new(
        id: impl Into<String>,
        cron_expression: impl Into<String>,
        job_type_id: impl Into<String>,
    ) -> SchedulerResult<Self> {
        let entry = Self {
            id: id.into(),
            cron_expression: cron_expression.into().trim().to_string(),
            job_type_id: job_type_id.into(),
            job_parameters: BTreeMap::new(),
        };
        validate_id(&entry.id, "条目ID")?;
        validate_id(&entry.job_type_id, "作业类型")?;
        Ok(entry)
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.job_parameters.insert(key.into(), value.into());
        self
    }

    /// 带秒字段的6字段形式，秒固定为0
    pub fn as_quartz_cron_expression(&self) -> String {
        as_quartz_cron_expression(&self.cron_expression)
    }

    pub fn job_id(&self, schedule_id: &str) -> String {
        entry_job_id(schedule_id, &self.id)
    }
}

pub fn as_quartz_cron_expression(expr: &str) -> String {
    format!("0 {}", expr.trim())
}
