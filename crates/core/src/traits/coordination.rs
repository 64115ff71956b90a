//! 协调存储接口
//!
//! 层级化、按路径寻址的节点存储，每个节点携带数据和版本号。
//! 写入和删除可以带期望版本做乐观并发控制，顺序节点由存储分配单调递增的后缀。
//!
//! 变更通知通过广播事件总线投递：订阅者拿到的是存储锁之外排队分发的事件，
//! 回调中再次访问存储或取消订阅都不会与分发过程冲突。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::{SchedulerResult, StoreError};

/// 节点创建方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// 在名称后追加10位补零的顺序号
    PersistentSequential,
}

/// 节点元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// 每次写入递增，新建节点为0
    pub version: i32,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

/// 存储变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Created(String),
    DataChanged(String),
    Deleted(String),
    /// 参数为父节点路径
    ChildrenChanged(String),
}

impl NodeEvent {
    pub fn path(&self) -> &str {
        match self {
            NodeEvent::Created(p)
            | NodeEvent::DataChanged(p)
            | NodeEvent::Deleted(p)
            | NodeEvent::ChildrenChanged(p) => p,
        }
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn exists(&self, path: &str) -> SchedulerResult<bool>;

    /// 创建节点（缺失的父节点一并创建），返回实际创建的路径
    async fn create_path(
        &self,
        path: &str,
        mode: CreateMode,
        data: Vec<u8>,
    ) -> SchedulerResult<String>;

    async fn read_record(&self, path: &str) -> SchedulerResult<(Vec<u8>, NodeStat)>;

    /// `expected_version` 为 None 时无条件覆盖
    async fn write_record(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<i32>,
    ) -> SchedulerResult<NodeStat>;

    /// 删除节点及其整个子树
    async fn delete_path(&self, path: &str, expected_version: Option<i32>) -> SchedulerResult<()>;

    /// 子节点名称，升序
    async fn read_children_names(&self, path: &str) -> SchedulerResult<Vec<String>>;

    /// 强制与服务端重新同步该子树
    async fn sync(&self, path: &str) -> SchedulerResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<NodeEvent>;
}

/// 把 NoNode 映射为 None，其余错误原样返回
pub fn optional<T>(result: SchedulerResult<T>) -> SchedulerResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_no_node() => Ok(None),
        Err(e) => Err(e),
    }
}

/// 创建持久节点；已存在时视为成功
pub async fn ensure_path(store: &dyn CoordinationStore, path: &str) -> SchedulerResult<()> {
    match store
        .create_path(path, CreateMode::Persistent, Vec::new())
        .await
    {
        Ok(_) => Ok(()),
        Err(crate::SchedulerError::Store(StoreError::NodeExists { .. })) => Ok(()),
        Err(e) => Err(e),
    }
}
