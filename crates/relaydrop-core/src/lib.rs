//! RelayDrop Core Library
//!
//! 通过中继信令服务器发现对端、协商数据通道并点对点传输文件。
//!
//! # 模块
//!
//! - **signaling**: 信令协议、WebSocket 连接和自动重连
//! - **crypto**: P-256 身份和带签名的客户端令牌
//! - **transfer**: 数据通道抽象和通道上的控制协议
//! - **workflow**: 发送 / 接收流程（PIN、文件选择、分块传输）
//! - **session**: 会话控制器、成员列表和会话状态
//! - **config** / **logging** / **ipc**: 守护进程与 CLI 共用的设置、日志级别和 IPC 消息
//!
//! # 使用示例
//!
//! ```ignore
//! use relaydrop_core::{AppSettings, Controller, DirectConnector, Identity, StaticPin, WsDialer};
//!
//! let settings = AppSettings::load();
//! let identity = Arc::new(Identity::load_or_generate(&Identity::default_path())?);
//!
//! // 1. 启动控制器并连接信令服务器
//! let controller = Controller::spawn(
//!     settings.controller_config(),
//!     identity,
//!     Arc::new(WsDialer),
//!     Arc::new(DirectConnector::new(settings.advertise_host)),
//! );
//! controller.setup_connection(settings.client_info(), Arc::new(StaticPin(None)))?;
//!
//! // 2. 等待对端出现后发送文件
//! let snapshot = controller.wait_for(|s| !s.peers.is_empty()).await?;
//! controller
//!     .start_send_session(&[PathBuf::from("photo.png")], &snapshot.peers[0].id, None)
//!     .await?;
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod workflow;

pub use error::{Error, Result};

pub use config::AppSettings;
pub use logging::LogLevel;

// Crypto re-exports
pub use crypto::{Identity, verify_client_token};

// Signaling re-exports
pub use signaling::{
    ClientInfo, ClientInfoWithoutId, DeviceType, Dialer, MemoryRelay, SignalingConnection,
    WsDialer,
};

// Transfer re-exports
pub use transfer::{DirectConnector, FileDto, FileProgress, MemoryConnector, PeerConnector};

// Session re-exports
pub use session::{Controller, ControllerConfig, FileStatus, SessionState, Snapshot};

// Workflow re-exports
pub use workflow::{AcceptAll, FileSelector, PinPrompt, StaticPin, TransferEvent};
