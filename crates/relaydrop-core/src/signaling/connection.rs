//! 信令连接
//!
//! [`SignalingConnection`] 是一条到信令服务器的逻辑连接的句柄（可克隆）：
//!
//! - `send()` 发送客户端消息
//! - `subscribe()` 订阅入站消息（传输引擎用它等待 ANSWER）
//! - `wait_until_close()` 挂起直到连接终止
//!
//! 连接的另一端是 [`SignalingBackend`]，由具体的拨号器（WebSocket、内存中继）持有，
//! 负责把入站消息按到达顺序同时投递给控制器事件通道和订阅者。

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::signaling::protocol::{ClientInfoWithoutId, ClientMessage, ServerMessage};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::Message;

/// 订阅通道容量
const SUBSCRIBER_CAPACITY: usize = 64;

/// 信令层发给控制器的事件
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// 连接建立
    Connected(SignalingConnection),
    /// 服务器消息（按到达顺序）
    Message(ServerMessage),
    /// 为下一次连接生成了新令牌
    TokenRefreshed(String),
    /// 连接终止（每条已建立的连接恰好一次）
    Closed,
}

/// 信令连接句柄
#[derive(Debug, Clone)]
pub struct SignalingConnection {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    inbound: broadcast::Sender<ServerMessage>,
    closed: watch::Receiver<bool>,
}

/// 连接的服务端一侧
pub struct SignalingBackend {
    /// 客户端发出的消息
    pub outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    sink: InboundSink,
    closed: watch::Sender<bool>,
}

/// 入站消息投递器
#[derive(Debug, Clone)]
pub struct InboundSink {
    inbound: broadcast::Sender<ServerMessage>,
    events: mpsc::UnboundedSender<SignalingEvent>,
}

impl SignalingConnection {
    /// 创建一对连接句柄和后端，入站消息会转发到 `events`
    pub fn pair(events: mpsc::UnboundedSender<SignalingEvent>) -> (Self, SignalingBackend) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        let connection = Self {
            outgoing: outgoing_tx,
            inbound: inbound.clone(),
            closed: closed_rx,
        };
        let backend = SignalingBackend {
            outgoing: outgoing_rx,
            sink: InboundSink { inbound, events },
            closed: closed_tx,
        };

        (connection, backend)
    }

    /// 发送客户端消息
    pub fn send(&self, message: ClientMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SignalingClosed);
        }
        self.outgoing
            .send(message)
            .map_err(|_| Error::SignalingClosed)
    }

    /// 订阅之后到达的服务器消息
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.inbound.subscribe()
    }

    /// 连接是否已终止
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// 挂起直到连接终止
    pub async fn wait_until_close(&self) {
        let mut closed = self.closed.clone();
        // 发送端被丢弃同样视为关闭
        let _ = closed.wait_for(|c| *c).await;
    }
}

impl SignalingBackend {
    /// 入站消息投递器（可克隆，供中继使用）
    pub fn sink(&self) -> InboundSink {
        self.sink.clone()
    }

    /// 投递一条服务器消息
    pub fn deliver(&self, message: ServerMessage) {
        self.sink.deliver(message);
    }

    /// 标记连接终止
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// 拆分为各部分，供 IO 任务在 `select!` 中分别借用
    pub fn into_parts(self) -> (mpsc::UnboundedReceiver<ClientMessage>, InboundSink, ClosedSignal) {
        (self.outgoing, self.sink, ClosedSignal(self.closed))
    }
}

/// 连接关闭信号（丢弃时同样会唤醒 `wait_until_close`）
pub struct ClosedSignal(watch::Sender<bool>);

impl ClosedSignal {
    pub fn close(&self) {
        self.0.send_replace(true);
    }
}

impl InboundSink {
    pub fn deliver(&self, message: ServerMessage) {
        debug!("Signaling received {}", message.kind());
        // 没有订阅者时 broadcast 会返回错误，忽略即可
        let _ = self.inbound.send(message.clone());
        let _ = self.events.send(SignalingEvent::Message(message));
    }
}

/// 建立信令连接
#[async_trait]
pub trait Dialer: Send + Sync {
    /// 使用 `info`（已带新令牌）连接到 `url`，入站消息转发到 `events`
    async fn dial(
        &self,
        url: &str,
        info: &ClientInfoWithoutId,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Result<SignalingConnection>;
}

/// WebSocket 信令拨号器
///
/// 提议的身份以 `?d=<base64url(JSON)>` 形式附加在 URL 上。
#[derive(Debug, Clone, Copy, Default)]
pub struct WsDialer;

impl WsDialer {
    /// 构造带身份参数的连接 URL
    pub fn connect_url(url: &str, info: &ClientInfoWithoutId) -> Result<String> {
        let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(info)?);
        let separator = if url.contains('?') { '&' } else { '?' };
        Ok(format!("{url}{separator}d={encoded}"))
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(
        &self,
        url: &str,
        info: &ClientInfoWithoutId,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Result<SignalingConnection> {
        let connect_url = Self::connect_url(url, info)?;
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = tokio_tungstenite::connect_async(&connect_url).await?;
        let (connection, backend) = SignalingConnection::pair(events);

        tokio::spawn(run_socket(ws_stream, backend));

        Ok(connection)
    }
}

/// WebSocket IO 循环：入站消息投递给后端，出站消息写入 socket
async fn run_socket<S>(ws_stream: tokio_tungstenite::WebSocketStream<S>, backend: SignalingBackend)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();
    let (mut outgoing, sink, closed) = backend.into_parts();

    loop {
        tokio::select! {
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Signaling socket error: {}", e);
                        break;
                    }
                    _ => continue,
                };

                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => sink.deliver(message),
                    Err(e) => warn!("Invalid signaling message: {} ({})", text, e),
                }
            }
            out = outgoing.recv() => {
                let Some(message) = out else { break };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode signaling message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("Signaling write failed: {}", e);
                    break;
                }
            }
        }
    }

    let _ = write.close().await;
    closed.close();
    info!("Signaling connection closed");
}
