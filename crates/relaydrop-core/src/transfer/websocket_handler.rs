//! WebSocket 直连数据通道
//!
//! 发起方在本地监听一个 TCP 端口，offer 中携带 `{"transport":"ws","address":"ip:port"}`；
//! 应答方直接连接该地址并完成 WebSocket 握手。适用于同一局域网内的设备，
//! 不做 NAT 穿透。对外通告的地址取自 `advertise_host`，否则通过向第一个 STUN
//! 服务器方向"连接" UDP socket 选出本机出口地址。
//!
//! offer 中还带有一个随机口令，应答方把它放在握手请求的路径里；路径不匹配的
//! 连接在握手阶段被拒绝，发起方继续等待，直到超时。

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transfer::{DataChannel, Frame, PeerConnector, PendingChannel};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use rand::RngCore;
use rand::rngs::OsRng;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async, client_async};

/// 等待对端连入的超时
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirectSdp {
    transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    address: Option<SocketAddr>,
    /// 连接口令（只出现在 offer 中）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    secret: Option<String>,
}

impl DirectSdp {
    fn parse(sdp: &str) -> Result<Self> {
        let parsed: Self = serde_json::from_str(sdp)
            .map_err(|e| Error::Transport(format!("invalid sdp: {e}")))?;
        if parsed.transport != "ws" {
            return Err(Error::Transport(format!(
                "unsupported transport: {}",
                parsed.transport
            )));
        }
        Ok(parsed)
    }
}

/// WebSocket 直连连接器
#[derive(Debug, Clone, Default)]
pub struct DirectConnector {
    advertise_host: Option<IpAddr>,
}

impl DirectConnector {
    pub fn new(advertise_host: Option<IpAddr>) -> Self {
        Self { advertise_host }
    }

    async fn local_ip(&self, stun_servers: &[String]) -> IpAddr {
        if let Some(host) = self.advertise_host {
            return host;
        }

        let Some(target) = stun_servers.first().map(|s| stun_host(s)) else {
            return IpAddr::V4(Ipv4Addr::LOCALHOST);
        };

        match route_to(target).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("Could not determine local address via {}: {}", target, e);
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        }
    }
}

fn new_secret() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn forbidden() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("unknown session".to_string()));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response
}

/// `stun:host:port` -> `host:port`
fn stun_host(server: &str) -> &str {
    server
        .strip_prefix("stuns:")
        .or_else(|| server.strip_prefix("stun:"))
        .unwrap_or(server)
}

/// 通往 `target` 时内核选择的本机地址（UDP connect 不发送数据）
async fn route_to(target: &str) -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}

#[async_trait]
impl PeerConnector for DirectConnector {
    async fn create_offer(
        &self,
        stun_servers: &[String],
    ) -> Result<(String, Box<dyn PendingChannel>)> {
        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        let address = SocketAddr::new(self.local_ip(stun_servers).await, port);
        info!("Data channel listening, advertised as {}", address);

        let secret = new_secret();
        let sdp = serde_json::to_string(&DirectSdp {
            transport: "ws".to_string(),
            address: Some(address),
            secret: Some(secret.clone()),
        })?;
        Ok((sdp, Box::new(DirectOffer { listener, secret })))
    }

    async fn accept_offer(
        &self,
        _stun_servers: &[String],
        offer_sdp: &str,
    ) -> Result<(String, Box<dyn PendingChannel>)> {
        let offer = DirectSdp::parse(offer_sdp)?;
        let address = offer
            .address
            .ok_or_else(|| Error::Transport("offer without address".to_string()))?;
        let secret = offer
            .secret
            .ok_or_else(|| Error::Transport("offer without secret".to_string()))?;

        let sdp = serde_json::to_string(&DirectSdp {
            transport: "ws".to_string(),
            address: None,
            secret: None,
        })?;
        Ok((sdp, Box::new(DirectAnswer { address, secret })))
    }
}

/// 发起方：等待持有口令的对端连入
struct DirectOffer {
    listener: TcpListener,
    secret: String,
}

#[async_trait]
impl PendingChannel for DirectOffer {
    async fn open(self: Box<Self>, remote_sdp: Option<&str>) -> Result<Box<dyn DataChannel>> {
        if let Some(sdp) = remote_sdp {
            DirectSdp::parse(sdp)?;
        }

        let deadline = tokio::time::Instant::now() + ACCEPT_TIMEOUT;
        let expected = format!("/{}", self.secret);

        loop {
            let (stream, peer) = tokio::time::timeout_at(deadline, self.listener.accept())
                .await
                .map_err(|_| Error::Timeout("data channel connection"))??;
            debug!("Data channel connection from {}", peer);

            let check = |request: &Request, response: Response| {
                if request.uri().path() == expected {
                    Ok(response)
                } else {
                    Err(forbidden())
                }
            };
            match tokio::time::timeout_at(deadline, accept_hdr_async(stream, check)).await {
                Ok(Ok(ws_stream)) => return Ok(Box::new(WsChannel { ws_stream })),
                Ok(Err(e)) => warn!("Rejected data channel connection from {}: {}", peer, e),
                Err(_) => return Err(Error::Timeout("data channel handshake")),
            }
        }
    }
}

/// 应答方：连接到 offer 中的地址
struct DirectAnswer {
    address: SocketAddr,
    secret: String,
}

#[async_trait]
impl PendingChannel for DirectAnswer {
    async fn open(self: Box<Self>, _remote_sdp: Option<&str>) -> Result<Box<dyn DataChannel>> {
        let stream = TcpStream::connect(self.address).await?;
        let url = format!("ws://{}/{}", self.address, self.secret);
        let (ws_stream, _) = client_async(url, stream).await?;
        debug!("Data channel connected to {}", self.address);

        Ok(Box::new(WsChannel { ws_stream }))
    }
}

/// 基于 WebSocket 的数据通道
struct WsChannel<S> {
    ws_stream: WebSocketStream<S>,
}

#[async_trait]
impl<S> DataChannel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.ws_stream.send(message).await.map_err(|e| {
            debug!("Data channel send failed: {}", e);
            Error::ChannelClosed
        })
    }

    async fn recv(&mut self) -> Option<Frame> {
        while let Some(msg) = self.ws_stream.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(Frame::Text(text)),
                Ok(Message::Binary(data)) => return Some(Frame::Binary(data)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    debug!("Data channel receive failed: {}", e);
                    return None;
                }
            }
        }
        None
    }

    async fn close(&mut self) {
        let _ = self.ws_stream.close(None).await;
    }
}
