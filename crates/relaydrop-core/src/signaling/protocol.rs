//! 信令服务器消息格式
//!
//! JSON 文本帧，以 `type` 字段区分消息类型，字段名使用 camelCase。
//!
//! 服务器 -> 客户端: `HELLO` / `JOIN` / `UPDATE` / `LEFT` / `OFFER` / `ANSWER` / `ERROR`
//! 客户端 -> 服务器: `UPDATE` / `OFFER` / `ANSWER`

use serde::{Deserialize, Serialize};

/// 设备类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Mobile,
    #[default]
    Desktop,
    Web,
    Headless,
    Server,
}

/// 本地提议的身份（连接前，没有服务器分配的 id）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfoWithoutId {
    pub alias: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    pub token: String,
}

/// 服务器确认的身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub alias: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    pub token: String,
}

impl ClientInfoWithoutId {
    /// 附加服务器分配的 id
    pub fn with_id(self, id: impl Into<String>) -> ClientInfo {
        ClientInfo {
            id: id.into(),
            alias: self.alias,
            version: self.version,
            device_model: self.device_model,
            device_type: self.device_type,
            token: self.token,
        }
    }
}

/// OFFER / ANSWER 消息体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpMessage {
    /// 发送方
    pub peer: ClientInfo,
    pub session_id: String,
    pub sdp: String,
}

/// 服务器 -> 客户端
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Hello {
        client: ClientInfo,
        peers: Vec<ClientInfo>,
    },
    Join {
        peer: ClientInfo,
    },
    Update {
        peer: ClientInfo,
    },
    #[serde(rename_all = "camelCase")]
    Left {
        peer_id: String,
    },
    Offer(SdpMessage),
    Answer(SdpMessage),
    Error {
        code: u16,
    },
}

impl ServerMessage {
    /// 消息类型名称（用于日志）
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Hello { .. } => "HELLO",
            ServerMessage::Join { .. } => "JOIN",
            ServerMessage::Update { .. } => "UPDATE",
            ServerMessage::Left { .. } => "LEFT",
            ServerMessage::Offer(_) => "OFFER",
            ServerMessage::Answer(_) => "ANSWER",
            ServerMessage::Error { .. } => "ERROR",
        }
    }
}

/// 客户端 -> 服务器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Update {
        info: ClientInfoWithoutId,
    },
    #[serde(rename_all = "camelCase")]
    Offer {
        session_id: String,
        target: String,
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    Answer {
        session_id: String,
        target: String,
        sdp: String,
    },
}
