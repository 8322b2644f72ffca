//! 工作流模块
//!
//! 传输引擎的两个入口：
//! - [`send_files`]: 通过信令发送 offer，PIN 校验后在数据通道上发送文件
//! - [`receive_files`]: 响应收到的 offer，选择文件并写入下载目录
//!
//! 引擎不直接修改会话状态，所有进度都以 [`TransferEvent`] 发给控制器。

mod pin;
pub mod receiver;
pub mod sender;

pub use receiver::receive_files;
pub use sender::{SendRequest, send_files};

use log::warn;

use crate::crypto::Identity;
use crate::error::Result;
use crate::signaling::SignalingConnection;
use crate::transfer::{FileDto, FileProgress, PeerConnector};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// 默认 PIN 尝试次数
pub const PIN_MAX_TRIES: u32 = 3;

/// 等待 ANSWER 的默认超时
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(60);

/// 要求对端提供的 PIN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinPolicy {
    pub pin: String,
    pub max_tries: u32,
}

impl PinPolicy {
    pub fn new(pin: impl Into<String>) -> Self {
        Self {
            pin: pin.into(),
            max_tries: PIN_MAX_TRIES,
        }
    }
}

/// 对端要求 PIN 时询问本地用户
#[async_trait]
pub trait PinPrompt: Send + Sync {
    /// 返回 `None` 表示放弃
    async fn request_pin(&self) -> Option<String>;
}

/// 每次都回答同一个 PIN（`None` 则直接放弃）
#[derive(Debug, Clone, Default)]
pub struct StaticPin(pub Option<String>);

#[async_trait]
impl PinPrompt for StaticPin {
    async fn request_pin(&self) -> Option<String> {
        self.0.clone()
    }
}

/// 接收方选择要接受的文件
#[async_trait]
pub trait FileSelector: Send + Sync {
    /// 返回选中的文件 id
    async fn select(&self, files: &[FileDto]) -> Vec<String>;
}

/// 接受全部文件
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

#[async_trait]
impl FileSelector for AcceptAll {
    async fn select(&self, files: &[FileDto]) -> Vec<String> {
        files.iter().map(|f| f.id.clone()).collect()
    }
}

/// 传输引擎发给控制器的事件
#[derive(Debug)]
pub enum TransferEvent {
    /// 收到对端的文件列表（接收方，在选择之前）
    Offered(Vec<FileDto>),
    /// 被拒绝的文件（每次会话最多一次）
    FilesSkipped(Vec<String>),
    Progress(FileProgress),
    /// 会话结束
    Finished(Result<()>),
}

/// 一次传输所需的全部依赖
#[derive(Clone)]
pub struct TransferContext {
    pub signaling: SignalingConnection,
    pub connector: Arc<dyn PeerConnector>,
    pub stun_servers: Vec<String>,
    pub identity: Arc<Identity>,
    /// 本地要求对端提供的 PIN
    pub pin: Option<PinPolicy>,
    /// 对端要求 PIN 时的回答方式
    pub pin_prompt: Arc<dyn PinPrompt>,
    pub events: mpsc::UnboundedSender<TransferEvent>,
    pub answer_timeout: Duration,
}

impl TransferContext {
    pub(crate) fn emit(&self, event: TransferEvent) {
        if self.events.send(event).is_err() {
            warn!("Transfer event dropped: controller is gone");
        }
    }
}

/// 跟踪已接受文件的终态，保证每个文件恰好一个终态
pub(crate) struct FileTracker<'a> {
    ctx: &'a TransferContext,
    /// 尚未结束的文件及其已传输字节数
    open: Vec<(String, u64)>,
}

impl<'a> FileTracker<'a> {
    pub(crate) fn new(ctx: &'a TransferContext, ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            ctx,
            open: ids.into_iter().map(|id| (id, 0)).collect(),
        }
    }

    pub(crate) fn progress(&mut self, id: &str, curr: u64) {
        if let Some(entry) = self.open.iter_mut().find(|(open_id, _)| open_id == id) {
            entry.1 = curr;
            self.ctx
                .emit(TransferEvent::Progress(FileProgress::sending(id, curr)));
        }
    }

    pub(crate) fn finish(&mut self, id: &str) {
        if let Some(curr) = self.take(id) {
            self.ctx
                .emit(TransferEvent::Progress(FileProgress::finished(id, curr)));
        }
    }

    pub(crate) fn fail(&mut self, id: &str, error: &str) {
        if let Some(curr) = self.take(id) {
            self.ctx
                .emit(TransferEvent::Progress(FileProgress::failed(id, curr, error)));
        }
    }

    /// 通道丢失：所有未结束的文件记为失败
    pub(crate) fn fail_all(&mut self, error: &str) {
        for (id, curr) in self.open.drain(..) {
            self.ctx
                .emit(TransferEvent::Progress(FileProgress::failed(&id, curr, error)));
        }
    }

    fn take(&mut self, id: &str) -> Option<u64> {
        let pos = self.open.iter().position(|(open_id, _)| open_id == id)?;
        Some(self.open.remove(pos).1)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::signaling::SignalingConnection;
    use crate::transfer::MemoryConnector;

    /// 不经过信令的上下文（只用于直接驱动通道的测试）
    pub(crate) fn context(
        pin: Option<PinPolicy>,
        prompt: Option<&str>,
    ) -> (TransferContext, mpsc::UnboundedReceiver<TransferEvent>) {
        let (signaling_tx, _signaling_rx) = mpsc::unbounded_channel();
        let (signaling, _backend) = SignalingConnection::pair(signaling_tx);
        let (events, events_rx) = mpsc::unbounded_channel();

        let ctx = TransferContext {
            signaling,
            connector: Arc::new(MemoryConnector::new()),
            stun_servers: Vec::new(),
            identity: Arc::new(Identity::generate().unwrap()),
            pin,
            pin_prompt: Arc::new(StaticPin(prompt.map(str::to_string))),
            events,
            answer_timeout: ANSWER_TIMEOUT,
        };
        (ctx, events_rx)
    }

    pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}
