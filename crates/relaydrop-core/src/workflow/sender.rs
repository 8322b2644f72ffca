//! 发送端工作流
//!
//! 1. 生成数据通道 offer，经信令发给目标并等待 ANSWER
//! 2. 打开数据通道
//! 3. 双向 PIN 校验（先校验对端，再按对端要求提供 PIN）
//! 4. 发送签名的文件列表，等待对端的选择
//! 5. 依次发送被接受的文件，每个文件等待对端确认
//! 6. 发送 `done` 并关闭通道

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::signaling::{ClientMessage, SdpMessage, ServerMessage};
use crate::transfer::protocol::FilesOffer;
use crate::transfer::{CHUNK_SIZE, Control, ControlChannel, FileDto};
use crate::workflow::{FileTracker, TransferContext, TransferEvent, pin};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;

/// 发送请求
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub file_dto_list: Vec<FileDto>,
    /// 文件 id -> 本地路径
    pub file_map: HashMap<String, PathBuf>,
    /// 目标客户端 id
    pub target_id: String,
}

/// 向 `request.target_id` 发送文件
///
/// 被拒绝的文件在发送任何数据之前通过 `FilesSkipped` 报告一次；
/// 每个被接受的文件恰好报告一次终态。通道在任何结果下都会被关闭。
pub async fn send_files(ctx: &TransferContext, request: SendRequest) -> Result<()> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (offer_sdp, pending) = ctx.connector.create_offer(&ctx.stun_servers).await?;

    // 先订阅再发送，避免错过 ANSWER
    let mut inbound = ctx.signaling.subscribe();
    ctx.signaling.send(ClientMessage::Offer {
        session_id: session_id.clone(),
        target: request.target_id.clone(),
        sdp: offer_sdp,
    })?;
    info!(
        "Sent offer {} to {} ({} files)",
        session_id,
        request.target_id,
        request.file_dto_list.len()
    );

    let answer = wait_for_answer(ctx, &mut inbound, &session_id).await?;
    debug!("Received answer from {}", answer.peer.alias);

    let channel = pending.open(Some(answer.sdp.as_str())).await?;
    let mut channel = ControlChannel::new(channel);

    let result = run(ctx, &mut channel, &request).await;
    channel.close().await;

    match &result {
        Ok(()) => info!("Send session {} finished", session_id),
        Err(e) => warn!("Send session {} failed: {}", session_id, e),
    }
    result
}

async fn wait_for_answer(
    ctx: &TransferContext,
    inbound: &mut broadcast::Receiver<ServerMessage>,
    session_id: &str,
) -> Result<SdpMessage> {
    let wait = async {
        loop {
            match inbound.recv().await {
                Ok(ServerMessage::Answer(answer)) if answer.session_id == session_id => {
                    return Ok(answer);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} signaling messages while waiting for answer", n);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::SignalingClosed),
            }
        }
    };

    tokio::select! {
        result = tokio::time::timeout(ctx.answer_timeout, wait) => {
            result.map_err(|_| Error::Timeout("answer"))?
        }
        () = ctx.signaling.wait_until_close() => Err(Error::SignalingClosed),
    }
}

async fn run(ctx: &TransferContext, channel: &mut ControlChannel, request: &SendRequest) -> Result<()> {
    pin::demand_pin(channel, ctx.pin.as_ref()).await?;
    pin::answer_pin(channel, ctx.pin_prompt.as_ref()).await?;

    channel
        .send(&Control::Files(FilesOffer {
            public_key: ctx.identity.public_key().to_string(),
            token: ctx.identity.generate_client_token(),
            files: request.file_dto_list.clone(),
        }))
        .await?;

    let selection = match channel.recv_control().await? {
        Control::Selection { files } => files,
        Control::Error { message } => return Err(Error::Remote(message)),
        other => {
            return Err(Error::Protocol(format!(
                "expected selection, got {other:?}"
            )));
        }
    };

    let (accepted, declined): (Vec<&FileDto>, Vec<&FileDto>) = request
        .file_dto_list
        .iter()
        .partition(|f| selection.contains(&f.id));

    if !declined.is_empty() {
        info!("Peer declined {} file(s)", declined.len());
        ctx.emit(TransferEvent::FilesSkipped(
            declined.iter().map(|f| f.id.clone()).collect(),
        ));
    }

    let mut tracker = FileTracker::new(ctx, accepted.iter().map(|f| f.id.clone()));
    let result = stream_files(channel, request, &accepted, &mut tracker).await;
    if let Err(e) = &result {
        tracker.fail_all(&e.to_string());
    }
    result
}

async fn stream_files(
    channel: &mut ControlChannel,
    request: &SendRequest,
    accepted: &[&FileDto],
    tracker: &mut FileTracker<'_>,
) -> Result<()> {
    for file in accepted {
        send_one(channel, file, request.file_map.get(&file.id), tracker).await?;
    }
    channel.send(&Control::Done).await
}

/// 发送单个文件；只有通道级错误会返回 `Err`
async fn send_one(
    channel: &mut ControlChannel,
    file: &FileDto,
    path: Option<&PathBuf>,
    tracker: &mut FileTracker<'_>,
) -> Result<()> {
    let id = file.id.as_str();

    let opened = match path {
        Some(path) => tokio::fs::File::open(path).await.map_err(|e| e.to_string()),
        None => Err("no local path for file".to_string()),
    };
    let mut source = match opened {
        Ok(source) => source,
        Err(message) => return report_read_error(channel, id, message, tracker).await,
    };

    channel.send(&Control::FileStart { id: id.to_string() }).await?;

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return report_read_error(channel, id, e.to_string(), tracker).await,
        };
        channel.send_chunk(buf[..n].to_vec()).await?;
        sent += n as u64;
        tracker.progress(id, sent);
    }

    channel.send(&Control::FileEnd { id: id.to_string() }).await?;

    match channel.recv_control().await? {
        Control::FileAck { id: ack, error } if ack == id => match error {
            None => {
                debug!("{} delivered ({} bytes)", file.file_name, sent);
                tracker.finish(id);
            }
            Some(error) => {
                warn!("Peer failed to store {}: {}", file.file_name, error);
                tracker.fail(id, &error);
            }
        },
        Control::Error { message } => return Err(Error::Remote(message)),
        other => {
            return Err(Error::Protocol(format!(
                "expected ack for {id}, got {other:?}"
            )));
        }
    }

    Ok(())
}

async fn report_read_error(
    channel: &mut ControlChannel,
    id: &str,
    message: String,
    tracker: &mut FileTracker<'_>,
) -> Result<()> {
    warn!("Failed to read file {}: {}", id, message);
    channel
        .send(&Control::FileError {
            id: id.to_string(),
            message: message.clone(),
        })
        .await?;
    tracker.fail(id, &message);
    Ok(())
}
