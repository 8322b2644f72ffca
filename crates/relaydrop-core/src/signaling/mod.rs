//! 信令客户端
//!
//! - `protocol`: 中继服务器的 JSON 消息格式
//! - `connection`: 逻辑连接句柄、拨号器抽象和 WebSocket 实现
//! - `memory`: 进程内中继（测试 / 本地演示）
//! - `reconnect`: 常驻重连循环

pub mod connection;
pub mod memory;
pub mod protocol;
pub mod reconnect;

pub use connection::{Dialer, SignalingConnection, SignalingEvent, WsDialer};
pub use memory::MemoryRelay;
pub use protocol::{
    ClientInfo, ClientInfoWithoutId, ClientMessage, DeviceType, SdpMessage, ServerMessage,
};
pub use reconnect::{ConnectionLoop, InfoSource, RETRY_DELAY};
