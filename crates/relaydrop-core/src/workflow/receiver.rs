//! 接收端工作流
//!
//! 1. 根据 offer 生成 answer，经信令回复发送方
//! 2. 打开数据通道，完成双向 PIN 校验
//! 3. 校验文件列表上的令牌（必须与发送方在信令服务器上出示的身份一致）
//! 4. 让调用方选择文件，回复选择结果
//! 5. 接收文件写入下载目录，逐个确认

use log::{debug, info, warn};

use crate::crypto::{TOKEN_MAX_AGE, token_fingerprint, verify_client_token};
use crate::error::{Error, Result};
use crate::signaling::{ClientMessage, SdpMessage};
use crate::transfer::protocol::FilesOffer;
use crate::transfer::{Control, ControlChannel, FileDto, Incoming};
use crate::workflow::{FileSelector, FileTracker, TransferContext, TransferEvent, pin};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// 响应 `offer` 接收文件，返回保存的文件路径
pub async fn receive_files(
    ctx: &TransferContext,
    offer: &SdpMessage,
    selector: &dyn FileSelector,
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    let (answer_sdp, pending) = ctx
        .connector
        .accept_offer(&ctx.stun_servers, &offer.sdp)
        .await?;

    ctx.signaling.send(ClientMessage::Answer {
        session_id: offer.session_id.clone(),
        target: offer.peer.id.clone(),
        sdp: answer_sdp,
    })?;
    info!(
        "Accepted offer {} from {}",
        offer.session_id, offer.peer.alias
    );

    let channel = pending.open(None).await?;
    let mut channel = ControlChannel::new(channel);

    let result = run(ctx, &mut channel, offer, selector, output_dir).await;
    channel.close().await;

    match &result {
        Ok(saved) => info!(
            "Receive session {} finished, {} file(s) saved",
            offer.session_id,
            saved.len()
        ),
        Err(e) => warn!("Receive session {} failed: {}", offer.session_id, e),
    }
    result
}

async fn run(
    ctx: &TransferContext,
    channel: &mut ControlChannel,
    offer: &SdpMessage,
    selector: &dyn FileSelector,
    output_dir: &Path,
) -> Result<Vec<PathBuf>> {
    pin::answer_pin(channel, ctx.pin_prompt.as_ref()).await?;
    pin::demand_pin(channel, ctx.pin.as_ref()).await?;

    let files_offer = match channel.recv_control().await? {
        Control::Files(files_offer) => files_offer,
        Control::Error { message } => return Err(Error::Remote(message)),
        other => {
            return Err(Error::Protocol(format!(
                "expected file list, got {other:?}"
            )));
        }
    };

    if let Err(e) = verify_offer(&files_offer, &offer.peer.token) {
        warn!("Rejecting file list from {}: {}", offer.peer.alias, e);
        channel
            .send(&Control::Error {
                message: e.to_string(),
            })
            .await?;
        return Err(e);
    }

    let selected = selector.select(&files_offer.files).await;
    let (accepted, declined): (Vec<FileDto>, Vec<FileDto>) = files_offer
        .files
        .into_iter()
        .partition(|f| selected.contains(&f.id));

    if !declined.is_empty() {
        ctx.emit(TransferEvent::FilesSkipped(
            declined.into_iter().map(|f| f.id).collect(),
        ));
    }

    channel
        .send(&Control::Selection {
            files: accepted.iter().map(|f| f.id.clone()).collect(),
        })
        .await?;

    let mut tracker = FileTracker::new(ctx, accepted.iter().map(|f| f.id.clone()));
    let mut inbox = Inbox::new(output_dir, &accepted);

    let result = inbox.run(channel, &mut tracker).await;
    if let Err(e) = &result {
        inbox.discard().await;
        tracker.fail_all(&e.to_string());
    }
    result.map(|()| inbox.saved)
}

/// 校验文件列表的签名令牌，并确认与信令身份出自同一把密钥
fn verify_offer(files_offer: &FilesOffer, relay_token: &str) -> Result<()> {
    verify_client_token(&files_offer.token, &files_offer.public_key, TOKEN_MAX_AGE)?;

    let presented = token_fingerprint(&files_offer.token);
    if presented.is_none() || presented != token_fingerprint(relay_token) {
        return Err(Error::InvalidToken(
            "sender key does not match its signaling identity".to_string(),
        ));
    }
    Ok(())
}

/// 正在写入的文件
struct Receiving {
    id: String,
    path: PathBuf,
    expected: u64,
    written: u64,
    /// 写入失败后置为 `None`，之后的数据块丢弃
    file: Option<File>,
    error: Option<String>,
}

/// 接收循环的状态
struct Inbox<'a> {
    output_dir: &'a Path,
    accepted: &'a [FileDto],
    current: Option<Receiving>,
    saved: Vec<PathBuf>,
}

impl<'a> Inbox<'a> {
    fn new(output_dir: &'a Path, accepted: &'a [FileDto]) -> Self {
        Self {
            output_dir,
            accepted,
            current: None,
            saved: Vec::new(),
        }
    }

    async fn run(&mut self, channel: &mut ControlChannel, tracker: &mut FileTracker<'_>) -> Result<()> {
        loop {
            match channel.recv().await? {
                Incoming::Control(Control::FileStart { id }) => self.start(&id, tracker).await?,
                Incoming::Chunk(data) => self.write(&data, tracker).await?,
                Incoming::Control(Control::FileEnd { id }) => {
                    let error = self.end(&id, tracker).await?;
                    channel.send(&Control::FileAck { id, error }).await?;
                }
                Incoming::Control(Control::FileError { id, message }) => {
                    warn!("Sender failed to read {}: {}", id, message);
                    if self.current.as_ref().is_some_and(|c| c.id == id) {
                        self.discard().await;
                    }
                    tracker.fail(&id, &message);
                }
                Incoming::Control(Control::Done) => {
                    if self.current.is_some() {
                        return Err(Error::Protocol("done while a file is open".to_string()));
                    }
                    return Ok(());
                }
                Incoming::Control(Control::Error { message }) => return Err(Error::Remote(message)),
                Incoming::Control(other) => {
                    return Err(Error::Protocol(format!(
                        "unexpected message during transfer: {other:?}"
                    )));
                }
            }
        }
    }

    async fn start(&mut self, id: &str, tracker: &mut FileTracker<'_>) -> Result<()> {
        if self.current.is_some() {
            return Err(Error::Protocol(format!("fileStart {id} while a file is open")));
        }
        let dto = self
            .accepted
            .iter()
            .find(|f| f.id == id)
            .ok_or_else(|| Error::Protocol(format!("file {id} was not accepted")))?;

        let (path, file, error) = match create_unique(self.output_dir, &dto.file_name).await {
            Ok((path, file)) => (path, Some(file), None),
            Err(e) => {
                warn!("Cannot create file for {}: {}", dto.file_name, e);
                (PathBuf::new(), None, Some(e.to_string()))
            }
        };
        debug!("Receiving {} into {:?}", dto.file_name, path);
        tracker.progress(id, 0);

        self.current = Some(Receiving {
            id: id.to_string(),
            path,
            expected: dto.size,
            written: 0,
            file,
            error,
        });
        Ok(())
    }

    async fn write(&mut self, data: &[u8], tracker: &mut FileTracker<'_>) -> Result<()> {
        let current = self
            .current
            .as_mut()
            .ok_or_else(|| Error::Protocol("data outside of a file".to_string()))?;

        current.written += data.len() as u64;
        if current.written > current.expected && current.error.is_none() {
            warn!(
                "{:?} exceeds its declared size of {} bytes",
                current.path, current.expected
            );
            current.file = None;
            current.error = Some(format!(
                "received more than the declared {} bytes",
                current.expected
            ));
            remove_partial(&current.path).await;
        }
        if let Some(file) = current.file.as_mut() {
            if let Err(e) = file.write_all(data).await {
                warn!("Write to {:?} failed: {}", current.path, e);
                current.file = None;
                current.error = Some(e.to_string());
                remove_partial(&current.path).await;
            } else {
                tracker.progress(&current.id, current.written);
            }
        }
        Ok(())
    }

    /// 结束当前文件，返回要回给发送方的错误
    async fn end(&mut self, id: &str, tracker: &mut FileTracker<'_>) -> Result<Option<String>> {
        let mut current = match self.current.take() {
            Some(current) if current.id == id => current,
            _ => return Err(Error::Protocol(format!("fileEnd {id} without fileStart"))),
        };

        if current.error.is_none() && current.written != current.expected {
            current.error = Some(format!(
                "expected {} bytes, received {}",
                current.expected, current.written
            ));
        }
        if current.error.is_none() {
            if let Some(file) = current.file.as_mut() {
                if let Err(e) = file.flush().await {
                    current.error = Some(e.to_string());
                }
            }
        }

        match current.error {
            None => {
                info!("Saved {:?}", current.path);
                tracker.finish(id);
                self.saved.push(current.path);
                Ok(None)
            }
            Some(error) => {
                drop(current.file);
                remove_partial(&current.path).await;
                tracker.fail(id, &error);
                Ok(Some(error))
            }
        }
    }

    /// 删除正在写入的半成品
    async fn discard(&mut self) {
        if let Some(current) = self.current.take() {
            drop(current.file);
            remove_partial(&current.path).await;
        }
    }
}

async fn remove_partial(path: &Path) {
    if path.as_os_str().is_empty() {
        return;
    }
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {:?}: {}", path, e);
        }
    }
}

/// 只保留文件名部分，去掉路径分隔符
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_control() || c == ':' { '_' } else { c })
        .collect();

    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        "file".to_string()
    } else {
        cleaned
    }
}

/// `name` 已存在时依次尝试 `stem (1).ext`、`stem (2).ext`...
fn candidate_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{name} ({n})"),
    }
}

/// 在 `dir` 中创建一个不覆盖已有文件的新文件
async fn create_unique(dir: &Path, name: &str) -> std::io::Result<(PathBuf, File)> {
    tokio::fs::create_dir_all(dir).await?;
    let name = sanitize_file_name(name);

    let mut n = 0;
    loop {
        let path = dir.join(candidate_name(&name, n));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name("dir/"), "file");
        assert_eq!(sanitize_file_name("a\nb"), "a_b");
    }

    #[test]
    fn test_candidate_name() {
        assert_eq!(candidate_name("a.txt", 0), "a.txt");
        assert_eq!(candidate_name("a.txt", 2), "a (2).txt");
        assert_eq!(candidate_name("archive.tar.gz", 1), "archive.tar (1).gz");
        assert_eq!(candidate_name(".bashrc", 1), ".bashrc (1)");
        assert_eq!(candidate_name("README", 3), "README (3)");
    }

    #[tokio::test]
    async fn test_create_unique_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"old").unwrap();

        let (first, _) = create_unique(dir.path(), "a.txt").await.unwrap();
        let (second, _) = create_unique(dir.path(), "a.txt").await.unwrap();

        assert_eq!(first, dir.path().join("a (1).txt"));
        assert_eq!(second, dir.path().join("a (2).txt"));
        assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"old");
    }

    #[test]
    fn test_verify_offer_binds_relay_identity() {
        let sender = Identity::generate().unwrap();
        let other = Identity::generate().unwrap();
        let offer = FilesOffer {
            public_key: sender.public_key().to_string(),
            token: sender.generate_client_token(),
            files: Vec::new(),
        };

        verify_offer(&offer, &sender.generate_client_token()).unwrap();
        assert!(matches!(
            verify_offer(&offer, &other.generate_client_token()),
            Err(Error::InvalidToken(_))
        ));
        assert!(matches!(
            verify_offer(&offer, "garbage"),
            Err(Error::InvalidToken(_))
        ));

        let forged = FilesOffer {
            public_key: other.public_key().to_string(),
            ..offer
        };
        assert!(verify_offer(&forged, &sender.generate_client_token()).is_err());
    }

    #[tokio::test]
    async fn test_oversized_file_is_cut_off_before_end() {
        use crate::transfer::CHUNK_SIZE;
        use crate::workflow::test_support::{context, drain};

        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut events) = context(None, None);
        let accepted = vec![FileDto {
            id: "0".to_string(),
            file_name: "small.txt".to_string(),
            size: 10,
            file_type: "text/plain".to_string(),
            metadata: None,
        }];
        let mut tracker = FileTracker::new(&ctx, ["0".to_string()]);
        let mut inbox = Inbox::new(dir.path(), &accepted);

        inbox.start("0", &mut tracker).await.unwrap();
        for _ in 0..80 {
            inbox.write(&[7u8; CHUNK_SIZE], &mut tracker).await.unwrap();
        }

        let on_disk: u64 = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().metadata().unwrap().len())
            .sum();
        assert!(on_disk <= 10, "{on_disk} bytes written for a 10-byte file");

        let error = inbox.end("0", &mut tracker).await.unwrap();
        assert!(error.unwrap().contains("declared 10 bytes"));
        assert!(inbox.saved.is_empty());
        assert!(!dir.path().join("small.txt").exists());

        let failed = drain(&mut events).into_iter().any(|e| {
            matches!(e, TransferEvent::Progress(p) if p.id == "0" && p.error.is_some())
        });
        assert!(failed);
    }
}
