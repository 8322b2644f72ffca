//! 会话控制器
//!
//! [`SessionController`] 是一个 actor：它独占身份、成员列表和会话状态，
//! 从三个通道接收输入并依次处理：
//!
//! - [`Controller`] 句柄发来的命令（发起发送、修改别名 / PIN、关闭）
//! - 信令层的 [`SignalingEvent`]
//! - 传输引擎的 [`TransferEvent`]
//!
//! 每处理完一条输入就向 `watch` 通道发布新的 [`Snapshot`]。

use log::{debug, info, warn};

use crate::crypto::Identity;
use crate::error::{Error, Result};
use crate::session::{Roster, Session, SessionState};
use crate::signaling::{
    ClientInfo, ClientInfoWithoutId, ClientMessage, ConnectionLoop, Dialer, InfoSource,
    SdpMessage, ServerMessage, SignalingConnection, SignalingEvent,
};
use crate::transfer::{FileDto, FileMetadata, PeerConnector};
use crate::workflow::{
    FileSelector, PinPolicy, PinPrompt, SendRequest, StaticPin, TransferContext, TransferEvent,
    receive_files, send_files,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// 控制器配置
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub signaling_url: String,
    pub stun_servers: Vec<String>,
    pub retry_delay: Duration,
    pub answer_timeout: Duration,
    /// 接收文件的保存目录
    pub download_dir: PathBuf,
    /// 要求对端提供的 PIN
    pub pin: Option<String>,
}

/// 对外发布的状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub connected: bool,
    /// 服务器确认的本机身份
    pub client: Option<ClientInfo>,
    pub peers: Vec<ClientInfo>,
    pub session: Session,
    pub pin_enabled: bool,
    /// 已结束的会话数
    pub finished_sessions: u64,
    /// 最近一次会话的错误
    pub last_error: Option<String>,
}

enum Command {
    Setup {
        info: ClientInfoWithoutId,
        pin_prompt: Arc<dyn PinPrompt>,
    },
    StartSend {
        files: Vec<FileDto>,
        file_map: HashMap<String, PathBuf>,
        target_id: String,
        pin_prompt: Option<Arc<dyn PinPrompt>>,
        reply: oneshot::Sender<Result<()>>,
    },
    SetAlias(String),
    SetPin(Option<String>),
    Shutdown(oneshot::Sender<()>),
}

/// 控制器句柄（可克隆）
#[derive(Clone)]
pub struct Controller {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl Controller {
    /// 启动控制器 actor
    pub fn spawn(
        config: ControllerConfig,
        identity: Arc<Identity>,
        dialer: Arc<dyn Dialer>,
        connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (signaling_tx, signaling_rx) = mpsc::unbounded_channel();
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();

        let initial = Snapshot {
            pin_enabled: config.pin.is_some(),
            ..Snapshot::default()
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);

        let actor = SessionController {
            pin: config.pin.clone(),
            config,
            identity,
            dialer,
            connector,
            proposing: None,
            pin_prompt: Arc::new(StaticPin(None)),
            connection_loop: None,
            signaling: None,
            client: None,
            roster: Roster::new(),
            session: Session::default(),
            finished_sessions: 0,
            last_error: None,
            active: None,
            snapshot: snapshot_tx,
            signaling_tx,
            transfer_tx,
        };
        tokio::spawn(actor.run(commands_rx, signaling_rx, transfer_rx));

        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::Aborted("controller stopped".to_string()))
    }

    /// 设置本地身份和 PIN 回答方式；第一次调用时启动重连循环
    pub fn setup_connection(
        &self,
        info: ClientInfoWithoutId,
        pin_prompt: Arc<dyn PinPrompt>,
    ) -> Result<()> {
        self.command(Command::Setup { info, pin_prompt })
    }

    /// 向 `target_id` 发送文件
    ///
    /// 会话开始后立即返回；结果通过快照（`finished_sessions` / `last_error`）观察。
    /// 已有会话进行中时返回 [`Error::SessionBusy`]。
    pub async fn start_send_session(
        &self,
        paths: &[PathBuf],
        target_id: &str,
        pin_prompt: Option<Arc<dyn PinPrompt>>,
    ) -> Result<()> {
        let files = convert_file_list_to_dto(paths).await?;
        let file_map = files
            .iter()
            .zip(paths)
            .map(|(f, p)| (f.id.clone(), p.clone()))
            .collect();

        let (reply, rx) = oneshot::channel();
        self.command(Command::StartSend {
            files,
            file_map,
            target_id: target_id.to_string(),
            pin_prompt,
            reply,
        })?;
        rx.await
            .map_err(|_| Error::Aborted("controller stopped".to_string()))?
    }

    /// 修改别名（同时更新提议身份和已确认身份，已连接时通知服务器）
    pub fn update_alias(&self, alias: impl Into<String>) -> Result<()> {
        self.command(Command::SetAlias(alias.into()))
    }

    /// 设置或清除要求对端提供的 PIN
    pub fn set_pin(&self, pin: Option<String>) -> Result<()> {
        self.command(Command::SetPin(pin))
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// 按 id 或别名查找在线的对端
    pub fn find_peer(&self, query: &str) -> Option<ClientInfo> {
        let snapshot = self.snapshot.borrow();
        snapshot
            .peers
            .iter()
            .find(|p| p.id == query)
            .or_else(|| snapshot.peers.iter().find(|p| p.alias == query))
            .cloned()
    }

    /// 等待快照满足条件
    pub async fn wait_for(&self, mut predicate: impl FnMut(&Snapshot) -> bool) -> Result<Snapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| Error::Aborted("controller stopped".to_string()))?;
        Ok(snapshot.clone())
    }

    /// 停止重连循环和正在进行的会话
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// 统计文件并生成 `FileDto` 列表（id 为下标）
pub async fn convert_file_list_to_dto(paths: &[PathBuf]) -> Result<Vec<FileDto>> {
    let mut files = Vec::with_capacity(paths.len());

    for (index, path) in paths.iter().enumerate() {
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }

        files.push(FileDto {
            id: index.to_string(),
            file_name: file_name(path),
            size: metadata.len(),
            file_type: mime_guess::from_path(path)
                .first_or_octet_stream()
                .to_string(),
            metadata: Some(FileMetadata {
                modified: metadata.modified().ok().map(rfc3339),
                accessed: metadata.accessed().ok().map(rfc3339),
            }),
        });
    }

    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// 每次连接前用最新的提议身份和新令牌生成 `ClientInfoWithoutId`
struct TokenMinter {
    identity: Arc<Identity>,
    proposing: watch::Receiver<ClientInfoWithoutId>,
}

impl InfoSource for TokenMinter {
    fn generate_new_info(&self) -> Result<ClientInfoWithoutId> {
        let mut info = self.proposing.borrow().clone();
        info.token = self.identity.generate_client_token();
        Ok(info)
    }
}

/// 接收方的文件选择：全部接受，并先把文件列表交给控制器初始化状态
struct SeedingSelector {
    events: mpsc::UnboundedSender<TransferEvent>,
}

#[async_trait]
impl FileSelector for SeedingSelector {
    async fn select(&self, files: &[FileDto]) -> Vec<String> {
        let _ = self.events.send(TransferEvent::Offered(files.to_vec()));
        files.iter().map(|f| f.id.clone()).collect()
    }
}

/// 保证会话任务以任何方式结束时都发送 `Finished`
struct FinishGuard {
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl FinishGuard {
    fn finish(mut self, result: Result<()>) {
        if let Some(events) = self.events.take() {
            let _ = events.send(TransferEvent::Finished(result));
        }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(events) = self.events.take() {
            let _ = events.send(TransferEvent::Finished(Err(Error::Aborted(
                "session task ended unexpectedly".to_string(),
            ))));
        }
    }
}

/// 控制器 actor
pub struct SessionController {
    config: ControllerConfig,
    identity: Arc<Identity>,
    dialer: Arc<dyn Dialer>,
    connector: Arc<dyn PeerConnector>,

    proposing: Option<watch::Sender<ClientInfoWithoutId>>,
    pin_prompt: Arc<dyn PinPrompt>,
    pin: Option<String>,
    connection_loop: Option<ConnectionLoop>,

    signaling: Option<SignalingConnection>,
    client: Option<ClientInfo>,
    roster: Roster,

    session: Session,
    finished_sessions: u64,
    last_error: Option<String>,
    active: Option<JoinHandle<()>>,

    snapshot: watch::Sender<Snapshot>,
    signaling_tx: mpsc::UnboundedSender<SignalingEvent>,
    transfer_tx: mpsc::UnboundedSender<TransferEvent>,
}

impl SessionController {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signaling: mpsc::UnboundedReceiver<SignalingEvent>,
        mut transfers: mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        self.stop().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = signaling.recv() => self.handle_signaling(event),
                Some(event) = transfers.recv() => self.handle_transfer(event),
            }
            self.publish();
        }

        self.stop().await;
    }

    async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.abort();
        }
        if let Some(connection_loop) = self.connection_loop.take() {
            connection_loop.shutdown().await;
        }
        info!("Session controller stopped");
    }

    fn publish(&self) {
        let next = Snapshot {
            connected: self.signaling.is_some(),
            client: self.client.clone(),
            peers: self.roster.peers().to_vec(),
            session: self.session.clone(),
            pin_enabled: self.pin.is_some(),
            finished_sessions: self.finished_sessions,
            last_error: self.last_error.clone(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Setup { info, pin_prompt } => self.setup(info, pin_prompt),
            Command::StartSend {
                files,
                file_map,
                target_id,
                pin_prompt,
                reply,
            } => {
                let result = self.start_send(files, file_map, &target_id, pin_prompt);
                let _ = reply.send(result);
            }
            Command::SetAlias(alias) => self.set_alias(alias),
            Command::SetPin(pin) => {
                info!("PIN {}", if pin.is_some() { "enabled" } else { "disabled" });
                self.pin = pin;
            }
            Command::Shutdown(_) => {}
        }
    }

    fn setup(&mut self, info: ClientInfoWithoutId, pin_prompt: Arc<dyn PinPrompt>) {
        self.pin_prompt = pin_prompt;

        if let Some(proposing) = &self.proposing {
            proposing.send_replace(info);
        } else {
            self.proposing = Some(watch::channel(info).0);
        }

        if self.connection_loop.is_some() {
            debug!("Connection loop already running");
            return;
        }
        let Some(proposing) = &self.proposing else {
            return;
        };

        let minter = TokenMinter {
            identity: self.identity.clone(),
            proposing: proposing.subscribe(),
        };
        self.connection_loop = Some(ConnectionLoop::spawn(
            self.config.signaling_url.clone(),
            self.config.retry_delay,
            self.dialer.clone(),
            Arc::new(minter),
            self.signaling_tx.clone(),
        ));
        info!("Connection loop started ({})", self.config.signaling_url);
    }

    fn set_alias(&mut self, alias: String) {
        let Some(proposing) = &self.proposing else {
            warn!("Alias change before setup ignored");
            return;
        };

        proposing.send_modify(|info| info.alias.clone_from(&alias));
        if let Some(client) = &mut self.client {
            client.alias.clone_from(&alias);
        }

        if let Some(signaling) = &self.signaling {
            let info = proposing.borrow().clone();
            if let Err(e) = signaling.send(ClientMessage::Update { info }) {
                warn!("Failed to publish alias change: {}", e);
            }
        }
        info!("Alias changed to {}", alias);
    }

    fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Connected(connection) => {
                self.signaling = Some(connection);
            }
            SignalingEvent::Message(message) => self.handle_message(message),
            SignalingEvent::TokenRefreshed(token) => {
                if let Some(proposing) = &self.proposing {
                    proposing.send_modify(|info| info.token.clone_from(&token));
                }
                if let Some(client) = &mut self.client {
                    client.token = token;
                }
            }
            SignalingEvent::Closed => {
                debug!("Signaling closed, clearing connection state");
                self.signaling = None;
                self.client = None;
                self.roster.clear();
            }
        }
    }

    fn handle_message(&mut self, message: ServerMessage) {
        self.roster.apply(&message);

        match message {
            ServerMessage::Hello { client, peers } => {
                info!("Connected as {} ({} peers online)", client.id, peers.len());
                self.client = Some(client);
            }
            ServerMessage::Update { peer } => {
                if let Some(client) = &mut self.client {
                    if client.id == peer.id {
                        *client = peer;
                    }
                }
            }
            ServerMessage::Offer(offer) => self.accept_offer(offer),
            ServerMessage::Error { code } => warn!("Signaling server error {}", code),
            ServerMessage::Join { .. } | ServerMessage::Left { .. } | ServerMessage::Answer(_) => {}
        }
    }

    fn transfer_context(&self, pin_prompt: Option<Arc<dyn PinPrompt>>) -> Result<TransferContext> {
        let signaling = self.signaling.clone().ok_or(Error::NotConnected)?;

        Ok(TransferContext {
            signaling,
            connector: self.connector.clone(),
            stun_servers: self.config.stun_servers.clone(),
            identity: self.identity.clone(),
            pin: self.pin.as_ref().map(PinPolicy::new),
            pin_prompt: pin_prompt.unwrap_or_else(|| self.pin_prompt.clone()),
            events: self.transfer_tx.clone(),
            answer_timeout: self.config.answer_timeout,
        })
    }

    fn start_send(
        &mut self,
        files: Vec<FileDto>,
        file_map: HashMap<String, PathBuf>,
        target_id: &str,
        pin_prompt: Option<Arc<dyn PinPrompt>>,
    ) -> Result<()> {
        if !self.session.is_idle() {
            return Err(Error::SessionBusy);
        }
        let ctx = self.transfer_context(pin_prompt)?;
        if self.roster.get(target_id).is_none() {
            return Err(Error::UnknownPeer(target_id.to_string()));
        }

        self.session.begin(SessionState::Sending);
        self.session.seed(&files);
        self.last_error = None;
        info!("Sending {} file(s) to {}", files.len(), target_id);

        let request = SendRequest {
            file_dto_list: files,
            file_map,
            target_id: target_id.to_string(),
        };
        self.spawn_session(async move { send_files(&ctx, request).await });
        Ok(())
    }

    fn accept_offer(&mut self, offer: SdpMessage) {
        if !self.session.is_idle() {
            warn!(
                "Dropping offer {} from {}: a session is already active",
                offer.session_id, offer.peer.alias
            );
            return;
        }
        let ctx = match self.transfer_context(None) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!("Cannot accept offer {}: {}", offer.session_id, e);
                return;
            }
        };

        self.session.begin(SessionState::Receiving);
        self.last_error = None;
        info!("Receiving from {}", offer.peer.alias);

        let selector = SeedingSelector {
            events: self.transfer_tx.clone(),
        };
        let output_dir = self.config.download_dir.clone();
        self.spawn_session(async move {
            receive_files(&ctx, &offer, &selector, &output_dir)
                .await
                .map(|_| ())
        });
    }

    fn spawn_session<F>(&mut self, session: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let guard = FinishGuard {
            events: Some(self.transfer_tx.clone()),
        };
        self.active = Some(tokio::spawn(async move {
            let result = session.await;
            guard.finish(result);
        }));
    }

    fn handle_transfer(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Offered(files) => {
                if self.session.state == SessionState::Receiving {
                    self.session.seed(&files);
                }
            }
            TransferEvent::FilesSkipped(ids) => {
                info!("Files skipped: {:?}", ids);
                self.session.mark_skipped(&ids);
            }
            TransferEvent::Progress(progress) => self.session.apply_progress(&progress),
            TransferEvent::Finished(result) => {
                match &result {
                    Ok(()) => info!("Session finished"),
                    Err(e) => warn!("Session failed: {}", e),
                }
                self.session.finish();
                self.finished_sessions += 1;
                self.last_error = result.err().map(|e| e.to_string());
                self.active = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MemoryRelay;
    use crate::transfer::MemoryConnector;

    fn config(dir: &Path) -> ControllerConfig {
        ControllerConfig {
            signaling_url: "mem://relay".to_string(),
            stun_servers: Vec::new(),
            retry_delay: Duration::from_millis(50),
            answer_timeout: Duration::from_secs(5),
            download_dir: dir.to_path_buf(),
            pin: None,
        }
    }

    fn info(alias: &str) -> ClientInfoWithoutId {
        ClientInfoWithoutId {
            alias: alias.to_string(),
            version: "2.1".to_string(),
            device_model: None,
            device_type: None,
            token: String::new(),
        }
    }

    fn spawn(relay: &MemoryRelay, dir: &Path) -> Controller {
        Controller::spawn(
            config(dir),
            Arc::new(Identity::generate().unwrap()),
            Arc::new(relay.clone()),
            Arc::new(MemoryConnector::new()),
        )
    }

    #[tokio::test]
    async fn test_convert_file_list_to_dto() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("photo.png");
        std::fs::write(&a, vec![0u8; 100]).unwrap();
        std::fs::write(&b, vec![0u8; 50]).unwrap();

        let files = convert_file_list_to_dto(&[a, b]).await.unwrap();
        assert_eq!(files[0].id, "0");
        assert_eq!(files[0].file_name, "a.txt");
        assert_eq!(files[0].size, 100);
        assert_eq!(files[0].file_type, "text/plain");
        assert_eq!(files[1].id, "1");
        assert_eq!(files[1].file_type, "image/png");

        let modified = files[0].metadata.as_ref().unwrap().modified.as_deref().unwrap();
        assert!(DateTime::parse_from_rfc3339(modified).is_ok());

        assert!(convert_file_list_to_dto(&[dir.path().to_path_buf()]).await.is_err());
    }

    #[tokio::test]
    async fn test_connects_and_tracks_roster() {
        let relay = MemoryRelay::new();
        let dir = tempfile::tempdir().unwrap();

        let alice = spawn(&relay, dir.path());
        alice
            .setup_connection(info("Alice"), Arc::new(StaticPin(None)))
            .unwrap();
        let snapshot = alice.wait_for(|s| s.client.is_some()).await.unwrap();
        assert!(snapshot.connected);
        assert_eq!(snapshot.client.unwrap().alias, "Alice");

        let bob = spawn(&relay, dir.path());
        bob.setup_connection(info("Bob"), Arc::new(StaticPin(None)))
            .unwrap();
        alice.wait_for(|s| s.peers.len() == 1).await.unwrap();
        assert_eq!(alice.find_peer("Bob").unwrap().alias, "Bob");

        bob.update_alias("Robert").unwrap();
        alice
            .wait_for(|s| s.peers.first().is_some_and(|p| p.alias == "Robert"))
            .await
            .unwrap();
        let bob_snapshot = bob.wait_for(|s| s.client.is_some()).await.unwrap();
        assert_eq!(bob_snapshot.client.unwrap().alias, "Robert");

        bob.shutdown().await;
        alice.wait_for(|s| s.peers.is_empty()).await.unwrap();
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_setup_does_not_spawn_another_loop() {
        let relay = MemoryRelay::new();
        let dir = tempfile::tempdir().unwrap();

        let alice = spawn(&relay, dir.path());
        alice
            .setup_connection(info("Alice"), Arc::new(StaticPin(None)))
            .unwrap();
        alice
            .setup_connection(info("Alice"), Arc::new(StaticPin(None)))
            .unwrap();
        alice.wait_for(|s| s.client.is_some()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(relay.clients().len(), 1);
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_requires_connection_and_known_peer() {
        let relay = MemoryRelay::new();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"hello").unwrap();

        let alice = spawn(&relay, dir.path());
        let err = alice
            .start_send_session(&[file.clone()], "peer-9", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));

        alice
            .setup_connection(info("Alice"), Arc::new(StaticPin(None)))
            .unwrap();
        alice.wait_for(|s| s.connected).await.unwrap();
        let err = alice
            .start_send_session(&[file], "peer-9", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(_)));
        assert!(alice.snapshot().session.is_idle());

        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_refreshes_identity() {
        let relay = MemoryRelay::new();
        let dir = tempfile::tempdir().unwrap();

        let alice = spawn(&relay, dir.path());
        alice
            .setup_connection(info("Alice"), Arc::new(StaticPin(None)))
            .unwrap();
        let first = alice.wait_for(|s| s.client.is_some()).await.unwrap();
        let first = first.client.unwrap();

        relay.disconnect(&first.id);
        let second = alice
            .wait_for(|s| s.client.as_ref().is_some_and(|c| c.id != first.id))
            .await
            .unwrap()
            .client
            .unwrap();

        assert_ne!(second.token, first.token);
        assert_eq!(second.alias, "Alice");
        alice.shutdown().await;
    }

    #[tokio::test]
    async fn test_finish_guard_reports_abort() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let guard = FinishGuard {
            events: Some(events),
        };
        let task = tokio::spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        });
        task.abort();
        let _ = task.await;

        assert!(matches!(
            rx.recv().await,
            Some(TransferEvent::Finished(Err(Error::Aborted(_))))
        ));
    }
}
