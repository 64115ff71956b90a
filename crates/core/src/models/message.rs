//! 队列消息的存储帧格式
//!
//! `[版本号: i32][隐藏截止时间: i64 毫秒][消息体长度: i32][消息体]`，全部大端序。

use chrono::{DateTime, TimeZone, Utc};

use crate::{SchedulerError, SchedulerResult};

pub const FRAME_VERSION: i32 = 1;
const HEADER_LEN: usize = 4 + 8 + 4;

/// 从队列接收到的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub queue_id: String,
    /// 底层顺序节点的名称
    pub message_id: String,
    pub body: Vec<u8>,
    /// 隐藏写入后的节点版本，删除时用于乐观锁校验
    pub version: i32,
    /// 隐藏截止时间（毫秒时间戳）
    pub invisible_until: i64,
}

impl QueueMessage {
    pub fn invisible_until_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.invisible_until).single()
    }
}

/// 已解码的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub invisible_until: i64,
    pub body: Vec<u8>,
}

impl MessageFrame {
    pub fn new(invisible_until: i64, body: Vec<u8>) -> Self {
        Self {
            invisible_until,
            body,
        }
    }

    pub fn is_hidden_at(&self, now_millis: i64) -> bool {
        self.invisible_until > now_millis
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.body.len());
        out.extend_from_slice(&FRAME_VERSION.to_be_bytes());
        out.extend_from_slice(&self.invisible_until.to_be_bytes());
        out.extend_from_slice(&(self.body.len() as i32).to_be_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    pub fn decode(bytes: &[u8]) -> SchedulerResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SchedulerError::malformed(format!(
                "消息帧长度不足: {} 字节",
                bytes.len()
            )));
        }
        let version = i32::from_be_bytes(read_array(&bytes[0..4]));
        if version != FRAME_VERSION {
            return Err(SchedulerError::malformed(format!(
                "不支持的消息帧版本: {version}"
            )));
        }
        let invisible_until = i64::from_be_bytes(read_array(&bytes[4..12]));
        let body_len = i32::from_be_bytes(read_array(&bytes[12..16]));
        if body_len < 0 || bytes.len() - HEADER_LEN != body_len as usize {
            return Err(SchedulerError::malformed(format!(
                "消息体长度不匹配: 声明 {body_len}, 实际 {}",
                bytes.len() - HEADER_LEN
            )));
        }
        Ok(Self {
            invisible_until,
            body: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

fn read_array<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(slice);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_big_endian() {
        let frame = MessageFrame::new(0x0102030405060708, b"hi".to_vec());
        let bytes = frame.encode();
        assert_eq!(&bytes[0..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 2]);
        assert_eq!(&bytes[16..], b"hi");
        assert_eq!(MessageFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_version_mismatch_fails_fast() {
        let mut bytes = MessageFrame::new(0, b"x".to_vec()).encode();
        bytes[3] = 2;
        assert!(matches!(
            MessageFrame::decode(&bytes),
            Err(SchedulerError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let bytes = MessageFrame::new(0, b"hello".to_vec()).encode();
        assert!(MessageFrame::decode(&bytes[..10]).is_err());
        assert!(MessageFrame::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_hidden_check() {
        let frame = MessageFrame::new(1_000, Vec::new());
        assert!(frame.is_hidden_at(999));
        assert!(!frame.is_hidden_at(1_000));
    }
}
