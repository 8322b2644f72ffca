//! Core Service - 会话控制器和 IPC 请求处理

use anyhow::Result;
use relaydrop_core::ipc::{IpcRequest, IpcResponse, PeerSummary, StatusReport};
use relaydrop_core::workflow::PinPrompt;
use relaydrop_core::{
    AppSettings, Controller, DirectConnector, Error, Identity, Snapshot, StaticPin, WsDialer,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};

/// 守护进程持有的服务状态
pub struct Service {
    controller: Controller,
    settings: Mutex<AppSettings>,
    /// 别名 / PIN 修改后写回的配置文件
    settings_path: Option<PathBuf>,
}

impl Service {
    /// 按设置启动控制器并连接信令服务器
    pub fn start(settings: AppSettings, settings_path: Option<PathBuf>) -> Result<Self> {
        let identity = Identity::load_or_generate(&Identity::default_path())?;
        tracing::info!("Identity fingerprint: {}", identity.fingerprint());

        let controller = Controller::spawn(
            settings.controller_config(),
            Arc::new(identity),
            Arc::new(WsDialer),
            Arc::new(DirectConnector::new(settings.advertise_host)),
        );
        Self::with_controller(controller, settings, settings_path)
    }

    /// 使用已创建的控制器（测试时传入内存中继上的控制器）
    pub fn with_controller(
        controller: Controller,
        settings: AppSettings,
        settings_path: Option<PathBuf>,
    ) -> Result<Self> {
        controller.setup_connection(
            settings.client_info(),
            Arc::new(StaticPin(settings.remote_pin.clone())),
        )?;

        Ok(Self {
            controller,
            settings: Mutex::new(settings),
            settings_path,
        })
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => IpcResponse::Error {
                message: e.to_string(),
            },
        }
    }

    async fn dispatch(&self, request: IpcRequest) -> Result<IpcResponse> {
        let response = match request {
            IpcRequest::Status => IpcResponse::Status(StatusReport::from(&self.controller.snapshot())),
            IpcRequest::Peers => IpcResponse::Peers {
                peers: self
                    .controller
                    .snapshot()
                    .peers
                    .iter()
                    .map(PeerSummary::from)
                    .collect(),
            },
            IpcRequest::Send { files, target, pin } => {
                let peer = self
                    .controller
                    .find_peer(&target)
                    .ok_or_else(|| Error::UnknownPeer(target.clone()))?;
                let paths: Vec<PathBuf> = files.iter().map(PathBuf::from).collect();
                let prompt = pin.map(|pin| Arc::new(StaticPin(Some(pin))) as Arc<dyn PinPrompt>);

                tracing::info!("Sending {} file(s) to {} ({})", paths.len(), peer.alias, peer.id);
                self.controller
                    .start_send_session(&paths, &peer.id, prompt)
                    .await?;
                IpcResponse::Ok {
                    message: format!("Sending {} file(s) to {}", paths.len(), peer.alias),
                }
            }
            IpcRequest::Alias { alias } => {
                let alias = alias.trim().to_string();
                if alias.is_empty() {
                    anyhow::bail!("alias must not be empty");
                }
                self.controller.update_alias(alias.clone())?;
                self.persist(|settings| settings.alias.clone_from(&alias)).await;
                IpcResponse::Ok {
                    message: format!("Alias set to {alias}"),
                }
            }
            IpcRequest::Pin { pin } => {
                let pin = pin.filter(|p| !p.is_empty());
                let message = if pin.is_some() {
                    "PIN enabled"
                } else {
                    "PIN disabled"
                };
                self.controller.set_pin(pin.clone())?;
                self.persist(|settings| settings.pin = pin).await;
                IpcResponse::Ok {
                    message: message.to_string(),
                }
            }
        };
        Ok(response)
    }

    async fn persist(&self, update: impl FnOnce(&mut AppSettings)) {
        let mut settings = self.settings.lock().await;
        update(&mut settings);

        if let Some(path) = &self.settings_path {
            if let Err(e) = settings.save_to(path) {
                tracing::warn!("Failed to save settings: {}", e);
            }
        }
    }
}

/// 记录连接、成员和会话的变化
pub async fn watch_snapshots(mut snapshots: watch::Receiver<Snapshot>) {
    let mut last = snapshots.borrow_and_update().clone();

    while snapshots.changed().await.is_ok() {
        let current = snapshots.borrow_and_update().clone();

        if current.connected != last.connected {
            match &current.client {
                Some(client) => tracing::info!("Signaling connected as {}", client.alias),
                None if current.connected => tracing::info!("Signaling connected"),
                None => tracing::warn!("Signaling disconnected, reconnecting"),
            }
        }
        if current.peers.len() != last.peers.len() {
            tracing::info!("{} peer(s) online", current.peers.len());
        }
        if current.session.state != last.session.state {
            tracing::info!("Session state: {:?}", current.session.state);
        }
        if current.finished_sessions != last.finished_sessions {
            match &current.last_error {
                Some(error) => tracing::warn!("Transfer failed: {}", error),
                None => tracing::info!(
                    "Transfer complete ({} bytes)",
                    current.session.curr
                ),
            }
        }

        last = current;
    }
}
