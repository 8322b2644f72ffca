//! 数据通道控制消息格式
//!
//! 文本帧格式: `type:id:name?payload`
//! - type: "action"（请求 / 通知）或 "ack"（应答）
//! - id: 发送方递增的消息 ID
//! - name: 消息名称（camelCase）
//! - payload: 可选的 JSON 载荷
//!
//! 二进制帧承载当前文件的数据块。

use log::trace;

use crate::error::{Error, Result};
use crate::transfer::{DataChannel, FileDto, Frame};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

static MSG_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\w+):(\d+):(\w+)(\?(.*))?$").expect("control message pattern is valid")
});

/// 通道上的原始控制消息
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub msg_type: String,
    pub id: u32,
    pub name: String,
    pub payload: Option<Value>,
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.msg_type, self.id, self.name)?;
        if let Some(payload) = &self.payload {
            write!(f, "?{}", payload)?;
        }
        Ok(())
    }
}

impl Envelope {
    /// 解析文本帧；格式错误或载荷不是 JSON 时返回 `None`
    pub fn parse(text: &str) -> Option<Self> {
        let caps = MSG_PATTERN.captures(text)?;

        let msg_type = caps.get(1)?.as_str().to_string();
        let id: u32 = caps.get(2)?.as_str().parse().ok()?;
        let name = caps.get(3)?.as_str().to_string();

        let payload = match caps.get(5) {
            Some(m) => Some(serde_json::from_str(m.as_str()).ok()?),
            None => None,
        };

        Some(Self {
            msg_type,
            id,
            name,
            payload,
        })
    }

    /// 编码控制消息
    pub fn from_control(id: u32, control: &Control) -> Result<Self> {
        let Value::Object(mut fields) = serde_json::to_value(control)? else {
            return Err(Error::Protocol("control message is not an object".to_string()));
        };
        let name = match fields.remove("name") {
            Some(Value::String(name)) => name,
            _ => return Err(Error::Protocol("control message without name".to_string())),
        };

        Ok(Self {
            msg_type: if control.is_reply() { "ack" } else { "action" }.to_string(),
            id,
            name,
            payload: fields.remove("payload"),
        })
    }

    /// 解码为控制消息
    pub fn to_control(&self) -> Result<Control> {
        let mut fields = serde_json::Map::new();
        fields.insert("name".to_string(), Value::String(self.name.clone()));
        if let Some(payload) = &self.payload {
            fields.insert("payload".to_string(), payload.clone());
        }

        serde_json::from_value(Value::Object(fields))
            .map_err(|e| Error::Protocol(format!("unexpected control message {}: {}", self.name, e)))
    }
}

/// 发送方的文件 offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesOffer {
    /// 发送方公钥（Base64 SPKI DER）
    pub public_key: String,
    /// 用该公钥签名的新令牌
    pub token: String,
    pub files: Vec<FileDto>,
}

/// 控制消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "camelCase")]
pub enum Control {
    /// 需要对端提供 PIN
    PinRequired { remaining: u32 },
    /// 无需（或已通过）PIN 校验
    Authorized,
    /// PIN 应答
    Pin { pin: String },
    /// 尝试次数耗尽
    PinRejected,
    /// 对端放弃输入 PIN
    Cancel,
    Files(FilesOffer),
    /// 接收方选中的文件 id
    Selection { files: Vec<String> },
    FileStart { id: String },
    FileEnd { id: String },
    FileAck {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// 发送方读取文件失败
    FileError { id: String, message: String },
    /// 会话级错误（如令牌校验失败）
    Error { message: String },
    Done,
}

impl Control {
    /// 应答类消息使用 `ack` 类型
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Control::Pin { .. } | Control::Selection { .. } | Control::FileAck { .. }
        )
    }
}

/// 从通道收到的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Control(Control),
    Chunk(Vec<u8>),
}

/// 在数据通道上收发控制消息和数据块
pub struct ControlChannel {
    inner: Box<dyn DataChannel>,
    next_id: u32,
}

impl ControlChannel {
    pub fn new(inner: Box<dyn DataChannel>) -> Self {
        Self { inner, next_id: 0 }
    }

    pub async fn send(&mut self, control: &Control) -> Result<()> {
        let envelope = Envelope::from_control(self.next_id, control)?;
        self.next_id = self.next_id.wrapping_add(1);
        trace!("Channel send: {}", envelope);
        self.inner.send(Frame::Text(envelope.to_string())).await
    }

    pub async fn send_chunk(&mut self, chunk: Vec<u8>) -> Result<()> {
        self.inner.send(Frame::Binary(chunk)).await
    }

    /// 接收下一条消息；通道关闭时返回 `ChannelClosed`
    pub async fn recv(&mut self) -> Result<Incoming> {
        match self.inner.recv().await {
            Some(Frame::Text(text)) => {
                trace!("Channel recv: {}", text);
                let envelope = Envelope::parse(&text)
                    .ok_or_else(|| Error::Protocol(format!("malformed control frame: {text}")))?;
                Ok(Incoming::Control(envelope.to_control()?))
            }
            Some(Frame::Binary(data)) => Ok(Incoming::Chunk(data)),
            None => Err(Error::ChannelClosed),
        }
    }

    /// 接收下一条控制消息，收到数据块视为协议错误
    pub async fn recv_control(&mut self) -> Result<Control> {
        match self.recv().await? {
            Incoming::Control(control) => Ok(control),
            Incoming::Chunk(_) => Err(Error::Protocol(
                "unexpected binary frame".to_string(),
            )),
        }
    }

    pub async fn close(&mut self) {
        self.inner.close().await;
    }
}
