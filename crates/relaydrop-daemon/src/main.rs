//! RelayDrop Daemon
//!
//! 后台守护进程，负责：
//! - 保持与信令服务器的连接（断线自动重连）
//! - 接收对端发来的文件
//! - 通过 Unix Socket 与 CLI 通信

mod ipc;
mod service;

use anyhow::Result;
use relaydrop_core::AppSettings;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::service::Service;

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（relaydrop-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let settings_path = AppSettings::config_path();
    let settings = AppSettings::load_from(&settings_path);

    // 初始化日志，RUST_LOG 优先于配置文件
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.directive())),
        )
        .try_init();

    tracing::info!("RelayDrop Daemon starting ({})", settings.alias);
    tracing::info!("Signaling server: {}", settings.signaling_url);
    tracing::info!("Download directory: {:?}", settings.download_dir);

    let service = Arc::new(Service::start(settings, Some(settings_path))?);
    let controller = service.controller().clone();

    let ipc_handle = tokio::spawn(ipc::run_ipc_server(service));
    let observer_handle = tokio::spawn(crate::service::watch_snapshots(controller.subscribe()));

    tokio::select! {
        res = ipc_handle => {
            tracing::error!("IPC server exited: {:?}", res);
        }
        res = observer_handle => {
            tracing::error!("Snapshot observer exited: {:?}", res);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    controller.shutdown().await;
    let _ = std::fs::remove_file(relaydrop_core::ipc::socket_path());

    Ok(())
}
