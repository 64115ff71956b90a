use thiserror::Error;


/// 协调存储返回的失败类型
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("节点不存在: {path}")]
    NoNode { path: String },
    #[error("节点版本冲突: {path} (期望版本 {expected}, 实际版本 {actual})")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },
    #[error("节点已存在: {path}")]
    NodeExists { path: String },
    #[error("协调存储不可用: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn no_node<S: Into<String>>(path: S) -> Self {
        Self::NoNode { path: path.into() }
    }
    pub fn node_exists<S: Into<String>>(path: S) -> Self {
        Self::NodeExists { path: path.into() }
    }
    pub fn is_no_node(&self) -> bool {
        matches!(self, StoreError::NoNode { .. })
    }
    pub fn is_bad_version(&self) -> bool {
        matches!(self, StoreError::BadVersion { .. })
    }
    pub fn is_node_exists(&self) -> bool {
        matches!(self, StoreError::NodeExists { .. })
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("无效的标识符: {0}")]
    InvalidId(String),
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("无效的时区: {0}")]
    InvalidTimezone(String),
    #[error("未找到作业类型的提供者: {0}")]
    JobProviderNotFound(String),
    #[error("调度 {0} 处于启用状态，修改前必须先禁用")]
    ScheduleEnabled(String),
    #[error("调度未找到: {0}")]
    ScheduleNotFound(String),
    #[error("调度 {schedule_id} 中的条目未找到: {entry_id}")]
    EntryNotFound {
        schedule_id: String,
        entry_id: String,
    },
    #[error("调度已存在: {0}")]
    DuplicateSchedule(String),
    #[error("调度 {schedule_id} 中的条目已存在: {entry_id}")]
    DuplicateEntry {
        schedule_id: String,
        entry_id: String,
    },
    #[error("队列已存在: {0}")]
    DuplicateQueue(String),
    #[error("队列未找到: {0}")]
    QueueNotFound(String),
    #[error("消息已不存在: {0}")]
    NoSuchElement(String),
    #[error("作业未找到: {0}")]
    JobNotFound(String),
    #[error("作业状态冲突: {0}")]
    JobStateConflict(String),
    #[error("消息格式错误: {0}")]
    MalformedMessage(String),
    #[error("队列 {queue_id} 执行 {operation} 失败: {message}")]
    QueueOperation {
        queue_id: String,
        operation: String,
        message: String,
    },
    #[error("协调存储错误: {0}")]
    Store(#[from] StoreError),
    #[error("获取锁超时: {0}")]
    LockTimeout(String),
    #[error("失去锁: {0}")]
    LockLost(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn invalid_id<S: Into<String>>(msg: S) -> Self {
        Self::InvalidId(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedMessage(msg.into())
    }

    /// 以队列ID和操作名包装底层错误
    pub fn queue_operation<Q, O, E>(queue_id: Q, operation: O, cause: E) -> Self
    where
        Q: Into<String>,
        O: Into<String>,
        E: std::fmt::Display,
    {
        Self::QueueOperation {
            queue_id: queue_id.into(),
            operation: operation.into(),
            message: cause.to_string(),
        }
    }

    /// 版本冲突：预期内的并发竞争，不应在紧密循环中重试
    pub fn is_contention(&self) -> bool {
        matches!(self, SchedulerError::Store(e) if e.is_bad_version())
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self, SchedulerError::Store(e) if e.is_no_node())
    }

    /// 配置类错误，在API边界同步拒绝
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidId(_)
                | SchedulerError::InvalidCron { .. }
                | SchedulerError::InvalidTimezone(_)
                | SchedulerError::JobProviderNotFound(_)
                | SchedulerError::ScheduleEnabled(_)
                | SchedulerError::Configuration(_)
        )
    }

    /// 暂时性后端错误，引擎层应退避重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::QueueOperation { .. }
                | SchedulerError::Store(StoreError::Unavailable(_))
                | SchedulerError::LockTimeout(_)
                | SchedulerError::LockLost(_)
        )
    }

    /// 根因消息，供控制台类调用方直接展示
    pub fn root_cause_message(&self) -> String {
        match self {
            SchedulerError::QueueOperation { message, .. } => message.clone(),
            SchedulerError::Store(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
