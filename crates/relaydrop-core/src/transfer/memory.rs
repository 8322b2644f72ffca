//! 进程内数据通道
//!
//! 两端必须共享同一个 [`MemoryConnector`]（克隆即可）。offer 中只携带一个通道 id，
//! 应答方凭 id 取走另一端。可以设置在若干帧之后切断链路，用于模拟通道丢失。

use log::debug;

use crate::error::{Error, Result};
use crate::transfer::{DataChannel, Frame, PeerConnector, PendingChannel};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 每个方向的缓冲帧数
const CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
struct MemorySdp {
    transport: String,
    id: String,
}

impl MemorySdp {
    fn new(id: &str) -> Self {
        Self {
            transport: "memory".to_string(),
            id: id.to_string(),
        }
    }

    fn parse(sdp: &str) -> Result<Self> {
        let parsed: Self = serde_json::from_str(sdp)
            .map_err(|e| Error::Transport(format!("invalid memory sdp: {e}")))?;
        if parsed.transport != "memory" {
            return Err(Error::Transport(format!(
                "unsupported transport: {}",
                parsed.transport
            )));
        }
        Ok(parsed)
    }
}

/// 进程内连接器
#[derive(Clone, Default)]
pub struct MemoryConnector {
    waiting: Arc<Mutex<HashMap<String, MemoryChannel>>>,
    fail_after: Option<usize>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 之后建立的每条链路在双方共发送 `frames` 帧后被切断
    pub fn with_fail_after(mut self, frames: usize) -> Self {
        self.fail_after = Some(frames);
        self
    }
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn create_offer(
        &self,
        _stun_servers: &[String],
    ) -> Result<(String, Box<dyn PendingChannel>)> {
        let id = uuid::Uuid::new_v4().to_string();
        let (local, remote) = MemoryChannel::pair(self.fail_after);

        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), remote);

        let sdp = serde_json::to_string(&MemorySdp::new(&id))?;
        Ok((sdp, Box::new(Ready(local))))
    }

    async fn accept_offer(
        &self,
        _stun_servers: &[String],
        offer_sdp: &str,
    ) -> Result<(String, Box<dyn PendingChannel>)> {
        let offer = MemorySdp::parse(offer_sdp)?;
        let channel = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&offer.id)
            .ok_or_else(|| Error::Transport(format!("no pending memory channel {}", offer.id)))?;

        debug!("Memory channel {} accepted", offer.id);
        let sdp = serde_json::to_string(&MemorySdp::new(&offer.id))?;
        Ok((sdp, Box::new(Ready(channel))))
    }
}

/// 已经配对好的通道，`open` 直接返回
struct Ready(MemoryChannel);

#[async_trait]
impl PendingChannel for Ready {
    async fn open(self: Box<Self>, _remote_sdp: Option<&str>) -> Result<Box<dyn DataChannel>> {
        Ok(Box::new(self.0))
    }
}

/// 链路状态（两端共享）
struct Link {
    severed: CancellationToken,
    remaining: Option<AtomicUsize>,
}

impl Link {
    /// 计入一帧；返回 false 表示链路已断
    fn consume(&self) -> bool {
        if self.severed.is_cancelled() {
            return false;
        }
        if let Some(remaining) = &self.remaining {
            let ok = remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !ok {
                debug!("Memory link severed");
                self.severed.cancel();
                return false;
            }
        }
        true
    }
}

/// 进程内数据通道的一端
pub struct MemoryChannel {
    tx: Option<mpsc::Sender<Frame>>,
    rx: mpsc::Receiver<Frame>,
    link: Arc<Link>,
}

impl MemoryChannel {
    /// 创建一对互联的通道
    pub fn pair(fail_after: Option<usize>) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let link = Arc::new(Link {
            severed: CancellationToken::new(),
            remaining: fail_after.map(AtomicUsize::new),
        });

        (
            Self {
                tx: Some(a_tx),
                rx: b_rx,
                link: link.clone(),
            },
            Self {
                tx: Some(b_tx),
                rx: a_rx,
                link,
            },
        )
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        if !self.link.consume() {
            return Err(Error::ChannelClosed);
        }
        let tx = self.tx.as_ref().ok_or(Error::ChannelClosed)?;

        tokio::select! {
            () = self.link.severed.cancelled() => Err(Error::ChannelClosed),
            sent = tx.send(frame) => sent.map_err(|_| Error::ChannelClosed),
        }
    }

    async fn recv(&mut self) -> Option<Frame> {
        tokio::select! {
            biased;
            () = self.link.severed.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_answer_pairs_channels() {
        let connector = MemoryConnector::new();
        let (offer, pending_a) = connector.create_offer(&[]).await.unwrap();
        let (answer, pending_b) = connector.accept_offer(&[], &offer).await.unwrap();

        let mut a = pending_a.open(Some(answer.as_str())).await.unwrap();
        let mut b = pending_b.open(None).await.unwrap();

        a.send(Frame::Text("hi".to_string())).await.unwrap();
        assert_eq!(b.recv().await, Some(Frame::Text("hi".to_string())));

        b.send(Frame::Binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(a.recv().await, Some(Frame::Binary(vec![1, 2, 3])));

        a.close().await;
        assert_eq!(b.recv().await, None);
    }

    #[tokio::test]
    async fn test_unknown_offer_rejected() {
        let connector = MemoryConnector::new();
        let sdp = serde_json::to_string(&MemorySdp::new("missing")).unwrap();
        assert!(connector.accept_offer(&[], &sdp).await.is_err());
        assert!(connector.accept_offer(&[], "not json").await.is_err());
    }

    #[tokio::test]
    async fn test_fail_after_severs_both_ends() {
        let (mut a, mut b) = MemoryChannel::pair(Some(2));

        a.send(Frame::Text("1".to_string())).await.unwrap();
        b.send(Frame::Text("2".to_string())).await.unwrap();
        assert!(matches!(
            a.send(Frame::Text("3".to_string())).await,
            Err(Error::ChannelClosed)
        ));

        assert_eq!(a.recv().await, None);
        assert_eq!(b.recv().await, None);
        assert!(b.send(Frame::Text("4".to_string())).await.is_err());
    }
}
