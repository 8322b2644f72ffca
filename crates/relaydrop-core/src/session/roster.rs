//! 房间成员列表
//!
//! 按加入顺序保存其他客户端，以服务器分配的 id 去重。

use log::debug;

use crate::signaling::{ClientInfo, ServerMessage};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    peers: Vec<ClientInfo>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> &[ClientInfo] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ClientInfo> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// HELLO: 用服务器给出的列表重置
    pub fn reset(&mut self, peers: Vec<ClientInfo>) {
        self.peers.clear();
        for peer in peers {
            self.join(peer);
        }
    }

    /// JOIN: 追加；已存在的 id 原地替换
    pub fn join(&mut self, peer: ClientInfo) {
        match self.peers.iter_mut().find(|p| p.id == peer.id) {
            Some(existing) => *existing = peer,
            None => self.peers.push(peer),
        }
    }

    /// UPDATE: 按 id 替换，未知 id 忽略
    pub fn update(&mut self, peer: ClientInfo) {
        match self.peers.iter_mut().find(|p| p.id == peer.id) {
            Some(existing) => *existing = peer,
            None => debug!("UPDATE for unknown peer {}", peer.id),
        }
    }

    /// LEFT: 按 id 移除
    pub fn leave(&mut self, id: &str) {
        self.peers.retain(|p| p.id != id);
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// 应用一条服务器消息，返回成员列表是否受影响
    pub fn apply(&mut self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::Hello { peers, .. } => self.reset(peers.clone()),
            ServerMessage::Join { peer } => self.join(peer.clone()),
            ServerMessage::Update { peer } => self.update(peer.clone()),
            ServerMessage::Left { peer_id } => self.leave(peer_id),
            _ => return false,
        }
        true
    }
}
