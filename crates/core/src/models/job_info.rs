use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};

use crate::ids::{is_valid_id, validate_context_path, validate_id};
use crate::{SchedulerError, SchedulerResult};

pub const VERSION_KEY: &str = "gyrex.jobinfo.version";
pub const JOB_ID_KEY: &str = "gyrex.jobinfo.jobid";
pub const JOB_TYPE_KEY: &str = "gyrex.jobinfo.type";
pub const CONTEXT_PATH_KEY: &str = "gyrex.jobinfo.contextPath";
pub const QUEUE_TRIGGER_KEY: &str = "gyrex.jobinfo.queueTrigger";
pub const QUEUE_TIMESTAMP_KEY: &str = "gyrex.jobinfo.queueTimestamp";
pub const CURRENT_VERSION: &str = "1";

const RESERVED_PREFIX: &str = "gyrex.jobinfo.";

/// 通过队列在调度端与Worker之间传递的作业描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: String,
    pub job_type_id: String,
    pub context_path: String,
    pub parameters: BTreeMap<String, String>,
    pub queue_trigger: Option<String>,
    pub queue_timestamp: DateTime<Utc>,
}

impl JobInfo {
    pub fn new(
        job_id: impl Into<String>,
        job_type_id: impl Into<String>,
        context_path: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> SchedulerResult<Self> {
        let info = Self {
            job_id: job_id.into(),
            job_type_id: job_type_id.into(),
            context_path: context_path.into(),
            parameters,
            queue_trigger: None,
            queue_timestamp: Utc::now(),
        };
        validate_id(&info.job_id, "作业ID")?;
        validate_id(&info.job_type_id, "作业类型")?;
        validate_context_path(&info.context_path)?;
        if let Some(key) = info.parameters.keys().find(|k| k.starts_with(RESERVED_PREFIX)) {
            return Err(SchedulerError::invalid_id(format!("参数名 '{key}' 是保留键")));
        }
        Ok(info)
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.queue_trigger = Some(trigger.into());
        self
    }

    pub fn with_queue_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.queue_timestamp = timestamp;
        self
    }

    /// 编码为 key=value 行格式（按键排序）
    pub fn as_message(&self) -> Vec<u8> {
        let mut props: BTreeMap<&str, String> = BTreeMap::new();
        for (k, v) in &self.parameters {
            props.insert(k.as_str(), v.clone());
        }
        props.insert(VERSION_KEY, CURRENT_VERSION.to_string());
        props.insert(JOB_ID_KEY, self.job_id.clone());
        props.insert(JOB_TYPE_KEY, self.job_type_id.clone());
        props.insert(CONTEXT_PATH_KEY, self.context_path.clone());
        props.insert(
            QUEUE_TIMESTAMP_KEY,
            self.queue_timestamp.timestamp_millis().to_string(),
        );
        if let Some(trigger) = &self.queue_trigger {
            props.insert(QUEUE_TRIGGER_KEY, trigger.clone());
        }

        let mut out = String::new();
        for (k, v) in props {
            out.push_str(&escape(k, true));
            out.push('=');
            out.push_str(&escape(&v, false));
            out.push('\n');
        }
        out.into_bytes()
    }

    /// 解析消息体。版本不匹配或缺少作业ID都是硬失败。
    pub fn parse(bytes: &[u8]) -> SchedulerResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| SchedulerError::malformed(format!("作业信息不是有效的UTF-8: {e}")))?;

        let mut props = BTreeMap::new();
        for line in text.lines() {
            if line.trim().is_empty() || line.starts_with(['#', '!']) {
                continue;
            }
            let (key, value) = split_line(line)?;
            props.insert(key, value);
        }

        match props.remove(VERSION_KEY) {
            Some(v) if v == CURRENT_VERSION => {}
            Some(v) => {
                return Err(SchedulerError::malformed(format!(
                    "不支持的作业信息版本: {v}"
                )))
            }
            None => return Err(SchedulerError::malformed("作业信息缺少版本号")),
        }

        let job_id = props
            .remove(JOB_ID_KEY)
            .filter(|id| is_valid_id(id))
            .ok_or_else(|| SchedulerError::malformed("作业信息缺少有效的作业ID"))?;
        let job_type_id = props
            .remove(JOB_TYPE_KEY)
            .filter(|id| is_valid_id(id))
            .ok_or_else(|| SchedulerError::malformed(format!("作业 {job_id} 缺少有效的作业类型")))?;
        let context_path = props
            .remove(CONTEXT_PATH_KEY)
            .unwrap_or_else(|| "/".to_string());
        let queue_trigger = props.remove(QUEUE_TRIGGER_KEY);
        let queue_timestamp = match props.remove(QUEUE_TIMESTAMP_KEY) {
            Some(raw) => {
                let millis: i64 = raw
                    .parse()
                    .map_err(|_| SchedulerError::malformed(format!("无效的入队时间: {raw}")))?;
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| SchedulerError::malformed(format!("无效的入队时间: {raw}")))?
            }
            None => Utc::now(),
        };

        // 未知的保留键直接丢弃
        props.retain(|k, _| !k.starts_with(RESERVED_PREFIX));

        Ok(Self {
            job_id,
            job_type_id,
            context_path,
            parameters: props,
            queue_trigger,
            queue_timestamp,
        })
    }
}

fn escape(value: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        match c {
            // 行首的 # 和 ! 会被当成注释
            '#' | '!' if is_key && i == 0 => {
                out.push('\\');
                out.push(c);
            }
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '=' if is_key => out.push_str("\\="),
            c => out.push(c),
        }
    }
    out
}

fn split_line(line: &str) -> SchedulerResult<(String, String)> {
    let mut key = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        let target = if in_value { &mut value } else { &mut key };
        match c {
            '\\' => match chars.next() {
                Some('n') => target.push('\n'),
                Some('r') => target.push('\r'),
                Some(other) => target.push(other),
                None => return Err(SchedulerError::malformed(format!("行尾存在悬空转义: {line}"))),
            },
            '=' if !in_value => in_value = true,
            c => target.push(c),
        }
    }
    if !in_value {
        return Err(SchedulerError::malformed(format!("缺少 '=': {line}")));
    }
    Ok((key, value))
}
