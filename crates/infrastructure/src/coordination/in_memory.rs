use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::paths;
use scheduler_core::traits::{CoordinationStore, CreateMode, NodeEvent, NodeStat};
use scheduler_core::{SchedulerError, SchedulerResult, StoreError};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Node {
    data: Vec<u8>,
    version: i32,
    created: DateTime<Utc>,
    modified: DateTime<Utc>,
    /// 顺序子节点计数器
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            data,
            version: 0,
            created: now,
            modified: now,
            next_sequence: 0,
        }
    }

    fn stat(&self) -> NodeStat {
        NodeStat {
            version: self.version,
            created: self.created,
            modified: self.modified,
        }
    }
}

/// 进程内的协调存储实现
///
/// 用于测试和单进程部署。事件在释放节点表锁之后才广播。
#[derive(Debug)]
pub struct InMemoryCoordinationStore {
    nodes: RwLock<BTreeMap<String, Node>>,
    events: broadcast::Sender<NodeEvent>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new()));
        Self {
            nodes: RwLock::new(nodes),
            events,
        }
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }

    fn publish(&self, events: Vec<NodeEvent>) {
        for event in events {
            trace!("存储事件: {:?}", event);
            // 没有订阅者时发送失败是正常的
            let _ = self.events.send(event);
        }
    }

    fn is_child_of(candidate: &str, parent: &str) -> bool {
        paths::parent(candidate) == Some(parent)
    }

    fn subtree_prefix(path: &str) -> String {
        if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        }
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_path(path: &str) -> SchedulerResult<()> {
    let valid = path.starts_with('/')
        && (path == "/" || !path.ends_with('/'))
        && !path.contains("//");
    if valid {
        Ok(())
    } else {
        Err(SchedulerError::invalid_id(format!("无效的节点路径: '{path}'")))
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn exists(&self, path: &str) -> SchedulerResult<bool> {
        validate_path(path)?;
        Ok(self.nodes.read().await.contains_key(path))
    }

    async fn create_path(
        &self,
        path: &str,
        mode: CreateMode,
        data: Vec<u8>,
    ) -> SchedulerResult<String> {
        validate_path(path)?;
        let parent = paths::parent(path)
            .ok_or_else(|| StoreError::node_exists(path))?
            .to_string();

        let mut events = Vec::new();
        let created = {
            let mut nodes = self.nodes.write().await;

            // 缺失的父节点一并创建
            let mut missing = Vec::new();
            let mut cursor = Some(parent.as_str());
            while let Some(p) = cursor {
                if nodes.contains_key(p) {
                    break;
                }
                missing.push(p.to_string());
                cursor = paths::parent(p);
            }
            for p in missing.into_iter().rev() {
                nodes.insert(p.clone(), Node::new(Vec::new()));
                if let Some(pp) = paths::parent(&p) {
                    events.push(NodeEvent::ChildrenChanged(pp.to_string()));
                }
                events.push(NodeEvent::Created(p));
            }

            let actual = match mode {
                CreateMode::Persistent => path.to_string(),
                CreateMode::PersistentSequential => {
                    let parent_node = nodes
                        .get_mut(&parent)
                        .ok_or_else(|| StoreError::no_node(parent.clone()))?;
                    let seq = parent_node.next_sequence;
                    parent_node.next_sequence += 1;
                    format!("{path}{seq:010}")
                }
            };

            if nodes.contains_key(&actual) {
                return Err(StoreError::node_exists(actual).into());
            }
            nodes.insert(actual.clone(), Node::new(data));
            events.push(NodeEvent::Created(actual.clone()));
            events.push(NodeEvent::ChildrenChanged(parent));
            actual
        };

        debug!("创建节点: {}", created);
        self.publish(events);
        Ok(created)
    }

    async fn read_record(&self, path: &str) -> SchedulerResult<(Vec<u8>, NodeStat)> {
        validate_path(path)?;
        let nodes = self.nodes.read().await;
        let node = nodes.get(path).ok_or_else(|| StoreError::no_node(path))?;
        Ok((node.data.clone(), node.stat()))
    }

    async fn write_record(
        &self,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<i32>,
    ) -> SchedulerResult<NodeStat> {
        validate_path(path)?;
        let stat = {
            let mut nodes = self.nodes.write().await;
            let node = nodes.get_mut(path).ok_or_else(|| StoreError::no_node(path))?;
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(StoreError::BadVersion {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    }
                    .into());
                }
            }
            node.data = data;
            node.version += 1;
            node.modified = Utc::now();
            node.stat()
        };
        self.publish(vec![NodeEvent::DataChanged(path.to_string())]);
        Ok(stat)
    }

    async fn delete_path(&self, path: &str, expected_version: Option<i32>) -> SchedulerResult<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(SchedulerError::invalid_id("不能删除根节点"));
        }
        let mut events = Vec::new();
        {
            let mut nodes = self.nodes.write().await;
            let node = nodes.get(path).ok_or_else(|| StoreError::no_node(path))?;
            if let Some(expected) = expected_version {
                if node.version != expected {
                    return Err(StoreError::BadVersion {
                        path: path.to_string(),
                        expected,
                        actual: node.version,
                    }
                    .into());
                }
            }

            let prefix = Self::subtree_prefix(path);
            let mut doomed: Vec<String> = nodes
                .range(prefix.clone()..)
                .take_while(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect();
            // 先子后父
            doomed.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
            doomed.push(path.to_string());
            for p in doomed {
                nodes.remove(&p);
                events.push(NodeEvent::Deleted(p));
            }
            if let Some(parent) = paths::parent(path) {
                events.push(NodeEvent::ChildrenChanged(parent.to_string()));
            }
        }
        debug!("删除节点: {}", path);
        self.publish(events);
        Ok(())
    }

    async fn read_children_names(&self, path: &str) -> SchedulerResult<Vec<String>> {
        validate_path(path)?;
        let nodes = self.nodes.read().await;
        if !nodes.contains_key(path) {
            return Err(StoreError::no_node(path).into());
        }
        let prefix = Self::subtree_prefix(path);
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| Self::is_child_of(k, path))
            .map(|(k, _)| paths::name(k).to_string())
            .collect())
    }

    async fn sync(&self, path: &str) -> SchedulerResult<()> {
        validate_path(path)?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}
