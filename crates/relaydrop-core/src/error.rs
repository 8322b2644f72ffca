//! 错误类型
//!
//! 核心库对外 API 统一返回 [`Result`]，二进制程序中再转换为 `anyhow::Error`。

/// RelayDrop 核心错误
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// PIN 尝试次数耗尽，整个会话失败
    #[error("Authentication failed: PIN rejected too many times")]
    Authentication,

    #[error("PIN entry cancelled")]
    PinCancelled,

    #[error("Signaling connection closed")]
    SignalingClosed,

    #[error("Not connected to the signaling server")]
    NotConnected,

    #[error("Data channel closed")]
    ChannelClosed,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Transport error: {0}")]
    Transport(String),

    /// 已有会话在进行中
    #[error("Another transfer session is already active")]
    SessionBusy,

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Transfer aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, Error>;
