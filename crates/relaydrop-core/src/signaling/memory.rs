//! 进程内信令中继
//!
//! 实现与真实信令服务器相同的房间语义，用于测试和本地演示：
//!
//! - 新连接收到 `HELLO{client, peers}`，其他成员收到 `JOIN`
//! - `UPDATE{info}` 更新身份并广播 `UPDATE`
//! - `OFFER` / `ANSWER` 按 `target` 转发，附带发送方身份
//! - 断开时其他成员收到 `LEFT`

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::signaling::connection::{
    ClosedSignal, Dialer, InboundSink, SignalingConnection, SignalingEvent,
};
use crate::signaling::protocol::{
    ClientInfo, ClientInfoWithoutId, ClientMessage, SdpMessage, ServerMessage,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 进程内中继（克隆后共享同一个房间）
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    /// 接下来拒绝的连接次数
    refuse: u32,
    clients: Vec<RelayClient>,
}

struct RelayClient {
    info: ClientInfo,
    sink: InboundSink,
    closed: ClosedSignal,
    cancel: CancellationToken,
}

impl RelayState {
    fn find(&self, id: &str) -> Option<&RelayClient> {
        self.clients.iter().find(|c| c.info.id == id)
    }

    fn broadcast_except(&self, id: &str, message: &ServerMessage) {
        for client in self.clients.iter().filter(|c| c.info.id != id) {
            client.sink.deliver(message.clone());
        }
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前在线的客户端
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.lock().clients.iter().map(|c| c.info.clone()).collect()
    }

    /// 拒绝接下来的 `count` 次连接
    pub fn refuse_next(&self, count: u32) {
        self.lock().refuse = count;
    }

    /// 从服务器侧断开某个客户端
    pub fn disconnect(&self, id: &str) -> bool {
        let cancel = self.lock().find(id).map(|c| c.cancel.clone());
        match cancel {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn serve(
        self,
        id: String,
        mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                msg = outgoing.recv() => match msg {
                    Some(message) => self.route(&id, message),
                    None => break,
                },
            }
        }
        self.remove(&id);
    }

    fn route(&self, from: &str, message: ClientMessage) {
        let mut state = self.lock();

        match message {
            ClientMessage::Update { info } => {
                let Some(client) = state.clients.iter_mut().find(|c| c.info.id == from) else {
                    return;
                };
                client.info = info.with_id(from);
                let peer = client.info.clone();
                state.broadcast_except(from, &ServerMessage::Update { peer });
            }
            ClientMessage::Offer {
                session_id,
                target,
                sdp,
            } => Self::forward(&state, from, &target, |peer| {
                ServerMessage::Offer(SdpMessage {
                    peer,
                    session_id,
                    sdp,
                })
            }),
            ClientMessage::Answer {
                session_id,
                target,
                sdp,
            } => Self::forward(&state, from, &target, |peer| {
                ServerMessage::Answer(SdpMessage {
                    peer,
                    session_id,
                    sdp,
                })
            }),
        }
    }

    fn forward(
        state: &RelayState,
        from: &str,
        target: &str,
        build: impl FnOnce(ClientInfo) -> ServerMessage,
    ) {
        let Some(sender) = state.find(from).map(|c| c.info.clone()) else {
            return;
        };
        match state.find(target) {
            Some(receiver) => receiver.sink.deliver(build(sender)),
            None => warn!("Relay: target {} not found", target),
        }
    }

    fn remove(&self, id: &str) {
        let mut state = self.lock();
        let Some(pos) = state.clients.iter().position(|c| c.info.id == id) else {
            return;
        };
        let client = state.clients.remove(pos);
        client.closed.close();
        debug!("Relay: {} left", id);
        state.broadcast_except(
            id,
            &ServerMessage::Left {
                peer_id: id.to_string(),
            },
        );
    }
}

#[async_trait]
impl Dialer for MemoryRelay {
    async fn dial(
        &self,
        _url: &str,
        info: &ClientInfoWithoutId,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Result<SignalingConnection> {
        let (connection, backend) = SignalingConnection::pair(events);
        let (outgoing, sink, closed) = backend.into_parts();
        let cancel = CancellationToken::new();

        let id = {
            let mut state = self.lock();
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(Error::Transport("relay refused connection".to_string()));
            }

            state.next_id += 1;
            let id = format!("peer-{}", state.next_id);
            let client = info.clone().with_id(&id);

            let peers = state.clients.iter().map(|c| c.info.clone()).collect();
            sink.deliver(ServerMessage::Hello {
                client: client.clone(),
                peers,
            });
            state.broadcast_except(&id, &ServerMessage::Join {
                peer: client.clone(),
            });

            state.clients.push(RelayClient {
                info: client,
                sink,
                closed,
                cancel: cancel.clone(),
            });
            id
        };

        debug!("Relay: {} joined", id);
        tokio::spawn(self.clone().serve(id, outgoing, cancel));

        Ok(connection)
    }
}
