//! 守护进程 IPC 消息
//!
//! Unix Domain Socket 上的换行分隔 JSON，每个请求对应一行响应。
//! 守护进程和 CLI 共用这里的类型。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::session::{FileState, Snapshot};
use crate::signaling::{ClientInfo, DeviceType};

pub fn socket_path() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join("relaydrop.sock")
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum IpcRequest {
    #[serde(rename = "status")]
    Status,
    #[serde(rename = "peers")]
    Peers,
    #[serde(rename = "send")]
    Send {
        files: Vec<String>,
        /// 对端 id 或别名
        target: String,
        /// 对端要求 PIN 时回答的 PIN
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pin: Option<String>,
    },
    #[serde(rename = "alias")]
    Alias { alias: String },
    /// 设置（或清除）要求对端提供的 PIN
    #[serde(rename = "pin")]
    Pin {
        #[serde(default)]
        pin: Option<String>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum IpcResponse {
    #[serde(rename = "ok")]
    Ok { message: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "peers")]
    Peers { peers: Vec<PeerSummary> },
    #[serde(rename = "status")]
    Status(StatusReport),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub id: String,
    pub alias: String,
    pub device_model: Option<String>,
    pub device_type: Option<DeviceType>,
}

impl From<&ClientInfo> for PeerSummary {
    fn from(info: &ClientInfo) -> Self {
        Self {
            id: info.id.clone(),
            alias: info.alias.clone(),
            device_model: info.device_model.clone(),
            device_type: info.device_type,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub connected: bool,
    pub id: Option<String>,
    pub alias: Option<String>,
    /// idle / sending / receiving
    pub state: String,
    pub progress: f64,
    pub files: Vec<FileState>,
    pub pin_enabled: bool,
    pub last_error: Option<String>,
}

impl From<&Snapshot> for StatusReport {
    fn from(snapshot: &Snapshot) -> Self {
        let state = serde_json::to_value(snapshot.session.state)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        Self {
            connected: snapshot.connected,
            id: snapshot.client.as_ref().map(|c| c.id.clone()),
            alias: snapshot.client.as_ref().map(|c| c.alias.clone()),
            state,
            progress: snapshot.session.ratio(),
            files: snapshot.session.file_state.values().cloned().collect(),
            pin_enabled: snapshot.pin_enabled,
            last_error: snapshot.last_error.clone(),
        }
    }
}

/// 写入一行 JSON
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// 读取一行 JSON，对端关闭时返回 `None`
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}
