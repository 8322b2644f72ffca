//! 文件传输模块
//!
//! 包含:
//! - 文件描述与进度类型（`FileDto` / `FileProgress`）
//! - 数据通道抽象（`PeerConnector` / `PendingChannel` / `DataChannel`）
//! - 数据通道控制消息协议
//! - 进程内连接器（测试）和基于 WebSocket 直连的连接器

pub mod memory;
pub mod protocol;
pub mod websocket_handler;

pub use memory::MemoryConnector;
pub use protocol::{Control, ControlChannel, Envelope, Incoming};
pub use websocket_handler::DirectConnector;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 文件分块大小
pub const CHUNK_SIZE: usize = 16 * 1024;

/// 文件时间戳（RFC 3339）
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessed: Option<String>,
}

/// 文件描述（用于传输协商）
///
/// `id` 由发送方分配（"0"、"1"...），整个会话中双方都用它关联文件。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileDto {
    pub id: String,
    pub file_name: String,
    pub size: u64,
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
}

/// 单个文件的进度
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    pub id: String,
    pub curr: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileProgress {
    pub fn sending(id: &str, curr: u64) -> Self {
        Self {
            id: id.to_string(),
            curr,
            success: false,
            error: None,
        }
    }

    pub fn finished(id: &str, curr: u64) -> Self {
        Self {
            id: id.to_string(),
            curr,
            success: true,
            error: None,
        }
    }

    pub fn failed(id: &str, curr: u64, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            curr,
            success: false,
            error: Some(error.into()),
        }
    }

    /// 是否为终态（成功或失败）
    pub fn is_terminal(&self) -> bool {
        self.success || self.error.is_some()
    }
}

/// 数据通道上的一帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// 已建立的点对点数据通道
#[async_trait]
pub trait DataChannel: Send {
    /// 发送一帧（对端来不及处理时挂起）
    async fn send(&mut self, frame: Frame) -> Result<()>;

    /// 接收一帧，`None` 表示通道已关闭
    async fn recv(&mut self) -> Option<Frame>;

    async fn close(&mut self);
}

/// 完成协商前的数据通道
#[async_trait]
pub trait PendingChannel: Send {
    /// 打开通道；发起方传入对端的 answer
    async fn open(self: Box<Self>, remote_sdp: Option<&str>) -> Result<Box<dyn DataChannel>>;
}

/// 建立数据通道（offer / answer 协商）
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// 发起方：生成 offer
    async fn create_offer(
        &self,
        stun_servers: &[String],
    ) -> Result<(String, Box<dyn PendingChannel>)>;

    /// 应答方：根据 offer 生成 answer
    async fn accept_offer(
        &self,
        stun_servers: &[String],
        offer_sdp: &str,
    ) -> Result<(String, Box<dyn PendingChannel>)>;
}
