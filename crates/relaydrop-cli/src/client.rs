//! IPC Client - 与守护进程通信

use anyhow::{Context, Result};
use relaydrop_core::ipc::{IpcRequest, IpcResponse, read_message, socket_path, write_message};
use tokio::io::BufReader;
use tokio::net::UnixStream;

pub async fn send_request(request: &IpcRequest) -> Result<IpcResponse> {
    let path = socket_path();

    let stream = match UnixStream::connect(&path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("❌ 无法连接到守护进程: {}", e);
            eprintln!("   请确保 relaydrop-daemon 正在运行");
            return Err(e.into());
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_message(&mut writer, request).await?;
    let response: IpcResponse = read_message(&mut reader)
        .await?
        .context("daemon closed the connection")?;

    match &response {
        IpcResponse::Ok { message } => println!("✅ {}", message),
        IpcResponse::Error { message } => eprintln!("❌ {}", message),
        _ => {}
    }

    Ok(response)
}
