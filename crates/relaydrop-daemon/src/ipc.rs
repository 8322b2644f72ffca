//! IPC Server - Unix Domain Socket 通信

use anyhow::Result;
use relaydrop_core::Error;
use relaydrop_core::ipc::{IpcRequest, IpcResponse, read_message, socket_path, write_message};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{UnixListener, UnixStream};

use crate::service::Service;

pub async fn run_ipc_server(service: Arc<Service>) -> Result<()> {
    let path = socket_path();

    // 删除旧的 socket 文件
    let _ = std::fs::remove_file(&path);

    let listener = UnixListener::bind(&path)?;
    tracing::info!("IPC server listening on {:?}", path);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, &service).await {
                        tracing::debug!("IPC client error: {}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Failed to accept IPC connection: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, service: &Service) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let response = match read_message::<_, IpcRequest>(&mut reader).await {
            Ok(Some(request)) => {
                tracing::debug!("IPC request: {:?}", request);
                service.handle(request).await
            }
            Ok(None) => break,
            Err(Error::Json(e)) => IpcResponse::Error {
                message: format!("Invalid request: {e}"),
            },
            Err(e) => return Err(e.into()),
        };

        write_message(&mut writer, &response).await?;
    }

    Ok(())
}
