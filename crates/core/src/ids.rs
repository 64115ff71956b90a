//! 标识符校验与节点名编码

use crate::{SchedulerError, SchedulerResult};

/// 标识符只允许 `[A-Za-z0-9_.-]`，且不能为空
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

pub fn validate_id(id: &str, what: &str) -> SchedulerResult<()> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(SchedulerError::invalid_id(format!(
            "{what} '{id}' 只能包含字母、数字、'_'、'.'和'-'"
        )))
    }
}

/// 上下文路径必须以 '/' 开头
pub fn validate_context_path(path: &str) -> SchedulerResult<()> {
    if path.starts_with('/') && !path.contains("//") {
        Ok(())
    } else {
        Err(SchedulerError::invalid_id(format!("无效的上下文路径: '{path}'")))
    }
}

/// 把外部标识符编码为节点名。
///
/// `[A-Za-z0-9_-]` 原样保留，其余字节写成 `.xx`（小写十六进制）。
/// '.' 本身也会被转义，所以编码是单射的，不同的外部ID不会映射到同一节点。
pub fn encode_node_name(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!(".{b:02x}"));
        }
    }
    out
}

pub fn decode_node_name(name: &str) -> SchedulerResult<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'.' {
            let hex = name
                .get(i + 1..i + 3)
                .ok_or_else(|| SchedulerError::invalid_id(format!("无效的节点名: {name}")))?;
            let b = u8::from_str_radix(hex, 16)
                .map_err(|_| SchedulerError::invalid_id(format!("无效的节点名: {name}")))?;
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| SchedulerError::invalid_id(format!("无效的节点名: {name}")))
}
