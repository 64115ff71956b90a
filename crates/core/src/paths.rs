//! 协调存储中的节点布局

use crate::ids::encode_node_name;

pub const QUEUES_ROOT: &str = "/gyrex/cloud/queues";
pub const JOBS_ROOT: &str = "/gyrex/jobs";
pub const SCHEDULES_ROOT: &str = "/gyrex/jobs/schedules";
pub const CONTEXTS_ROOT: &str = "/gyrex/jobs/contexts";

pub const JOBS_NODE: &str = "jobs";
pub const HISTORY_NODE: &str = "history";

pub fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// 父路径；根节点返回 None
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" || path.is_empty() {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn queue_path(queue_id: &str) -> String {
    join(QUEUES_ROOT, queue_id)
}

pub fn schedule_path(schedule_id: &str) -> String {
    join(SCHEDULES_ROOT, schedule_id)
}

pub fn context_path(context_path: &str) -> String {
    join(CONTEXTS_ROOT, &encode_node_name(context_path))
}

pub fn jobs_path(context: &str) -> String {
    join(&context_path(context), JOBS_NODE)
}

pub fn job_path(context: &str, job_id: &str) -> String {
    join(&jobs_path(context), &encode_node_name(job_id))
}

pub fn history_path(context: &str, job_id: &str) -> String {
    join(
        &join(&context_path(context), HISTORY_NODE),
        &encode_node_name(job_id),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_parent_name() {
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(join("/", "b"), "/b");
        assert_eq!(parent("/a/b"), Some("/a"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(name("/a/b"), "b");
    }

    #[test]
    fn test_job_layout() {
        assert_eq!(
            job_path("/", "s1__entry__e1"),
            "/gyrex/jobs/contexts/.2f/jobs/s1__entry__e1"
        );
        assert_eq!(
            history_path("/t", "a.b"),
            "/gyrex/jobs/contexts/.2ft/history/a.2eb"
        );
        assert_eq!(schedule_path("s1"), "/gyrex/jobs/schedules/s1");
    }
}
