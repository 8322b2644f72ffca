//! 集成测试 - 信令中继 + 数据通道上的完整传输
//!
//! 两个控制器（或直接驱动的工作流）共享同一个进程内中继和内存连接器。

use async_trait::async_trait;
use relaydrop_core::session::{Session, convert_file_list_to_dto};
use relaydrop_core::signaling::{ServerMessage, SignalingEvent};
use relaydrop_core::workflow::{
    PinPolicy, SendRequest, TransferContext, receive_files, send_files,
};
use relaydrop_core::{
    ClientInfo, ClientInfoWithoutId, Controller, ControllerConfig, Dialer, Error, FileDto,
    FileSelector, FileStatus, Identity, MemoryConnector, MemoryRelay, SessionState,
    SignalingConnection, Snapshot, StaticPin, TransferEvent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

fn info(alias: &str) -> ClientInfoWithoutId {
    ClientInfoWithoutId {
        alias: alias.to_string(),
        version: "2.1".to_string(),
        device_model: Some("test".to_string()),
        device_type: None,
        token: String::new(),
    }
}

fn config(download_dir: &Path, pin: Option<&str>) -> ControllerConfig {
    ControllerConfig {
        signaling_url: "mem://relay".to_string(),
        stun_servers: Vec::new(),
        retry_delay: Duration::from_millis(50),
        answer_timeout: Duration::from_secs(5),
        download_dir: download_dir.to_path_buf(),
        pin: pin.map(str::to_string),
    }
}

struct Peer {
    controller: Controller,
    dir: tempfile::TempDir,
}

/// 启动一个控制器并等待它在中继上拿到 id
async fn start_peer(
    relay: &MemoryRelay,
    connector: &MemoryConnector,
    alias: &str,
    pin: Option<&str>,
    remote_pin: Option<&str>,
) -> Peer {
    let dir = tempfile::tempdir().unwrap();
    let controller = Controller::spawn(
        config(dir.path(), pin),
        Arc::new(Identity::generate().unwrap()),
        Arc::new(relay.clone()),
        Arc::new(connector.clone()),
    );
    controller
        .setup_connection(info(alias), Arc::new(StaticPin(remote_pin.map(str::to_string))))
        .unwrap();
    wait_for(&controller, |s| s.client.is_some()).await;

    Peer { controller, dir }
}

async fn wait_for(controller: &Controller, predicate: impl FnMut(&Snapshot) -> bool) -> Snapshot {
    tokio::time::timeout(WAIT, controller.wait_for(predicate))
        .await
        .expect("timed out waiting for snapshot")
        .unwrap()
}

/// 两个互相可见的对端
async fn pair(
    connector: &MemoryConnector,
    sender_pin: Option<&str>,
    receiver_answer: Option<&str>,
) -> (Peer, Peer, String) {
    let relay = MemoryRelay::new();
    let alice = start_peer(&relay, connector, "Alice", sender_pin, None).await;
    let bob = start_peer(&relay, connector, "Bob", None, receiver_answer).await;

    let bob_id = bob.controller.snapshot().client.unwrap().id;
    wait_for(&alice.controller, |s| s.peers.iter().any(|p| p.id == bob_id)).await;
    wait_for(&bob.controller, |s| s.peers.len() == 1).await;

    (alice, bob, bob_id)
}

fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, content).unwrap();
    path
}

/// 完整发送两个文件，接收方内容一致，双方回到 idle
#[tokio::test]
async fn test_end_to_end_transfer() {
    let connector = MemoryConnector::new();
    let (alice, bob, bob_id) = pair(&connector, None, None).await;

    let source = tempfile::tempdir().unwrap();
    let a = write_file(source.path(), "a.txt", 100_000);
    let b = write_file(source.path(), "empty.bin", 0);

    alice
        .controller
        .start_send_session(&[a.clone(), b], &bob_id, None)
        .await
        .unwrap();

    let sent = wait_for(&alice.controller, |s| s.finished_sessions == 1).await;
    let received = wait_for(&bob.controller, |s| s.finished_sessions == 1).await;

    for snapshot in [&sent, &received] {
        assert_eq!(snapshot.session.state, SessionState::Idle);
        assert!(snapshot.last_error.is_none(), "{:?}", snapshot.last_error);
        assert_eq!(snapshot.session.file_state.len(), 2);
        assert!(snapshot
            .session
            .file_state
            .values()
            .all(|f| f.state == FileStatus::Finished));
        assert_eq!(snapshot.session.curr, 100_000);
        assert_eq!(snapshot.session.total, 100_000);
    }

    assert_eq!(
        std::fs::read(bob.dir.path().join("a.txt")).unwrap(),
        std::fs::read(&a).unwrap()
    );
    assert_eq!(
        std::fs::metadata(bob.dir.path().join("empty.bin")).unwrap().len(),
        0
    );

    alice.controller.shutdown().await;
    bob.controller.shutdown().await;
}

/// 一个会话进行中时不能开始第二个
#[tokio::test]
async fn test_second_session_is_rejected() {
    let connector = MemoryConnector::new();
    let (alice, bob, bob_id) = pair(&connector, None, None).await;

    let source = tempfile::tempdir().unwrap();
    let a = write_file(source.path(), "a.txt", 64 * 1024);

    alice
        .controller
        .start_send_session(&[a.clone()], &bob_id, None)
        .await
        .unwrap();
    let err = alice
        .controller
        .start_send_session(&[a], &bob_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionBusy));

    wait_for(&alice.controller, |s| s.finished_sessions == 1).await;
    alice.controller.shutdown().await;
    bob.controller.shutdown().await;
}

#[tokio::test]
async fn test_correct_pin() {
    let connector = MemoryConnector::new();
    let (alice, bob, bob_id) = pair(&connector, Some("1234"), Some("1234")).await;
    assert!(alice.controller.snapshot().pin_enabled);

    let source = tempfile::tempdir().unwrap();
    let a = write_file(source.path(), "a.txt", 10);

    alice
        .controller
        .start_send_session(&[a], &bob_id, None)
        .await
        .unwrap();

    let sent = wait_for(&alice.controller, |s| s.finished_sessions == 1).await;
    assert!(sent.last_error.is_none());
    assert!(bob.dir.path().join("a.txt").exists());

    alice.controller.shutdown().await;
    bob.controller.shutdown().await;
}

/// PIN 次数耗尽：双方都以认证错误结束，没有文件被写入
#[tokio::test]
async fn test_wrong_pin_exhausts_tries() {
    let connector = MemoryConnector::new();
    let (alice, bob, bob_id) = pair(&connector, Some("1234"), Some("0000")).await;

    let source = tempfile::tempdir().unwrap();
    let a = write_file(source.path(), "a.txt", 10);

    alice
        .controller
        .start_send_session(&[a], &bob_id, None)
        .await
        .unwrap();

    let sent = wait_for(&alice.controller, |s| s.finished_sessions == 1).await;
    let received = wait_for(&bob.controller, |s| s.finished_sessions == 1).await;

    let expected = Error::Authentication.to_string();
    assert_eq!(sent.last_error.as_deref(), Some(expected.as_str()));
    assert_eq!(received.last_error.as_deref(), Some(expected.as_str()));
    assert!(sent.session.is_idle());
    assert!(received.session.is_idle());
    assert!(received.session.file_state.is_empty());
    assert!(!bob.dir.path().join("a.txt").exists());

    alice.controller.shutdown().await;
    bob.controller.shutdown().await;
}

/// 通道在传输中途断开：未完成的文件记为错误，会话回到 idle
#[tokio::test]
async fn test_channel_loss_mid_transfer() {
    let connector = MemoryConnector::new().with_fail_after(8);
    let (alice, bob, bob_id) = pair(&connector, None, None).await;

    let source = tempfile::tempdir().unwrap();
    let a = write_file(source.path(), "big.bin", 200 * 1024);

    alice
        .controller
        .start_send_session(&[a], &bob_id, None)
        .await
        .unwrap();

    let sent = wait_for(&alice.controller, |s| s.finished_sessions == 1).await;
    let received = wait_for(&bob.controller, |s| s.finished_sessions == 1).await;

    assert_eq!(
        sent.last_error.as_deref(),
        Some(Error::ChannelClosed.to_string().as_str())
    );
    assert!(received.last_error.is_some());
    for snapshot in [&sent, &received] {
        assert!(snapshot.session.is_idle());
        assert_eq!(snapshot.session.file_state["0"].state, FileStatus::Error);
    }
    assert!(!bob.dir.path().join("big.bin").exists());

    alice.controller.shutdown().await;
    bob.controller.shutdown().await;
}

/// 直接加入中继，返回连接、事件通道和服务器分配的身份
async fn join(
    relay: &MemoryRelay,
    identity: &Identity,
    alias: &str,
) -> (
    SignalingConnection,
    mpsc::UnboundedReceiver<SignalingEvent>,
    ClientInfo,
) {
    let (events, mut rx) = mpsc::unbounded_channel();
    let mut proposed = info(alias);
    proposed.token = identity.generate_client_token();

    let connection = relay.dial("mem://relay", &proposed, events).await.unwrap();
    let client = loop {
        if let Some(SignalingEvent::Message(ServerMessage::Hello { client, .. })) = rx.recv().await
        {
            break client;
        }
    };
    (connection, rx, client)
}

fn context(
    signaling: SignalingConnection,
    connector: &MemoryConnector,
    identity: Identity,
    pin: Option<PinPolicy>,
) -> (TransferContext, mpsc::UnboundedReceiver<TransferEvent>) {
    let (events, rx) = mpsc::unbounded_channel();
    let ctx = TransferContext {
        signaling,
        connector: Arc::new(connector.clone()),
        stun_servers: Vec::new(),
        identity: Arc::new(identity),
        pin,
        pin_prompt: Arc::new(StaticPin(None)),
        events,
        answer_timeout: Duration::from_secs(5),
    };
    (ctx, rx)
}

/// 拒绝指定 id 的文件
struct Decline(&'static str);

#[async_trait]
impl FileSelector for Decline {
    async fn select(&self, files: &[FileDto]) -> Vec<String> {
        files
            .iter()
            .filter(|f| f.id != self.0)
            .map(|f| f.id.clone())
            .collect()
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// 接收方拒绝一个文件：发送方在任何数据之前收到一次 `FilesSkipped`，
/// 被拒绝的文件不再有进度，会话总量只计被接受的文件
#[tokio::test]
async fn test_declined_file_is_skipped() {
    let relay = MemoryRelay::new();
    let connector = MemoryConnector::new();
    let alice_identity = Identity::generate().unwrap();
    let bob_identity = Identity::generate().unwrap();

    let (alice_conn, _alice_rx, _alice) = join(&relay, &alice_identity, "Alice").await;
    let (bob_conn, mut bob_rx, bob) = join(&relay, &bob_identity, "Bob").await;

    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let paths = vec![
        write_file(source.path(), "a.txt", 100),
        write_file(source.path(), "b.txt", 50),
    ];
    let files = convert_file_list_to_dto(&paths).await.unwrap();
    let request = SendRequest {
        file_dto_list: files.clone(),
        file_map: files
            .iter()
            .zip(&paths)
            .map(|(f, p)| (f.id.clone(), p.clone()))
            .collect(),
        target_id: bob.id.clone(),
    };

    let (alice_ctx, mut alice_events) = context(alice_conn, &connector, alice_identity, None);
    let (bob_ctx, mut bob_events) = context(bob_conn, &connector, bob_identity, None);

    let receiver = async {
        let offer = loop {
            if let Some(SignalingEvent::Message(ServerMessage::Offer(offer))) = bob_rx.recv().await {
                break offer;
            }
        };
        receive_files(&bob_ctx, &offer, &Decline("1"), output.path()).await
    };
    let (sent, saved) = tokio::time::timeout(WAIT, async {
        tokio::join!(send_files(&alice_ctx, request), receiver)
    })
    .await
    .unwrap();

    sent.unwrap();
    assert_eq!(saved.unwrap(), vec![output.path().join("a.txt")]);
    assert!(!output.path().join("b.txt").exists());

    let events = drain(&mut alice_events);
    assert!(matches!(
        events.first(),
        Some(TransferEvent::FilesSkipped(ids)) if ids == &vec!["1".to_string()]
    ));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TransferEvent::FilesSkipped(_)))
            .count(),
        1
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, TransferEvent::Progress(p) if p.id == "1")));

    let mut session = Session::default();
    session.begin(SessionState::Sending);
    session.seed(&files);
    for event in &events {
        match event {
            TransferEvent::FilesSkipped(ids) => session.mark_skipped(ids),
            TransferEvent::Progress(progress) => session.apply_progress(progress),
            _ => {}
        }
    }
    session.finish();

    assert_eq!(session.total, 100);
    assert_eq!(session.curr, 100);
    assert_eq!(session.file_state["0"].state, FileStatus::Finished);
    assert_eq!(session.file_state["1"].state, FileStatus::Skipped);

    let receiver_events = drain(&mut bob_events);
    assert!(receiver_events.iter().any(
        |e| matches!(e, TransferEvent::Progress(p) if p.id == "0" && p.success)
    ));
}

/// 文件列表的签名必须与发送方在信令上出示的身份一致
#[tokio::test]
async fn test_offer_with_foreign_key_is_rejected() {
    let relay = MemoryRelay::new();
    let connector = MemoryConnector::new();
    let relay_identity = Identity::generate().unwrap();
    let signing_identity = Identity::generate().unwrap();
    let bob_identity = Identity::generate().unwrap();

    // 信令上用一把密钥，文件列表用另一把签名
    let (alice_conn, _alice_rx, _alice) = join(&relay, &relay_identity, "Alice").await;
    let (bob_conn, mut bob_rx, bob) = join(&relay, &bob_identity, "Bob").await;

    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let path = write_file(source.path(), "a.txt", 10);
    let files = convert_file_list_to_dto(std::slice::from_ref(&path))
        .await
        .unwrap();
    let request = SendRequest {
        file_dto_list: files,
        file_map: [("0".to_string(), path)].into_iter().collect(),
        target_id: bob.id,
    };

    let (alice_ctx, _alice_events) = context(alice_conn, &connector, signing_identity, None);
    let (bob_ctx, _bob_events) = context(bob_conn, &connector, bob_identity, None);

    let receiver = async {
        let offer = loop {
            if let Some(SignalingEvent::Message(ServerMessage::Offer(offer))) = bob_rx.recv().await {
                break offer;
            }
        };
        receive_files(&bob_ctx, &offer, &relaydrop_core::AcceptAll, output.path()).await
    };
    let (sent, received) = tokio::time::timeout(WAIT, async {
        tokio::join!(send_files(&alice_ctx, request), receiver)
    })
    .await
    .unwrap();

    assert!(matches!(received, Err(Error::InvalidToken(_))));
    assert!(matches!(sent, Err(Error::Remote(_))));
    assert!(!output.path().join("a.txt").exists());
}

/// 直接驱动的一次传输结果
struct DirectOutcome {
    sent: relaydrop_core::Result<()>,
    saved: relaydrop_core::Result<Vec<PathBuf>>,
    sender_events: Vec<TransferEvent>,
    receiver_events: Vec<TransferEvent>,
}

/// 在新的中继上把 `files` 从 Alice 发给 Bob，Bob 接受全部文件
async fn transfer_directly(
    files: Vec<FileDto>,
    paths: &[PathBuf],
    output: &Path,
) -> DirectOutcome {
    let relay = MemoryRelay::new();
    let connector = MemoryConnector::new();
    let alice_identity = Identity::generate().unwrap();
    let bob_identity = Identity::generate().unwrap();

    let (alice_conn, _alice_rx, _alice) = join(&relay, &alice_identity, "Alice").await;
    let (bob_conn, mut bob_rx, bob) = join(&relay, &bob_identity, "Bob").await;

    let request = SendRequest {
        file_map: files
            .iter()
            .zip(paths)
            .map(|(f, p)| (f.id.clone(), p.clone()))
            .collect(),
        file_dto_list: files,
        target_id: bob.id,
    };
    let (alice_ctx, mut alice_events) = context(alice_conn, &connector, alice_identity, None);
    let (bob_ctx, mut bob_events) = context(bob_conn, &connector, bob_identity, None);

    let receiver = async {
        let offer = loop {
            if let Some(SignalingEvent::Message(ServerMessage::Offer(offer))) = bob_rx.recv().await {
                break offer;
            }
        };
        receive_files(&bob_ctx, &offer, &relaydrop_core::AcceptAll, output).await
    };
    let (sent, saved) = tokio::time::timeout(WAIT, async {
        tokio::join!(send_files(&alice_ctx, request), receiver)
    })
    .await
    .unwrap();

    DirectOutcome {
        sent,
        saved,
        sender_events: drain(&mut alice_events),
        receiver_events: drain(&mut bob_events),
    }
}

/// 每个文件的终态：`Some(true)` 成功，`Some(false)` 失败
fn outcome(events: &[TransferEvent], id: &str) -> Option<bool> {
    events.iter().find_map(|e| match e {
        TransferEvent::Progress(p) if p.id == id && p.success => Some(true),
        TransferEvent::Progress(p) if p.id == id && p.error.is_some() => Some(false),
        _ => None,
    })
}

/// 发送方读不到某个文件时只影响该文件，其余文件照常送达
#[tokio::test]
async fn test_unreadable_file_does_not_affect_siblings() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let paths = vec![
        write_file(source.path(), "gone.txt", 100),
        write_file(source.path(), "kept.txt", 50),
    ];
    let files = convert_file_list_to_dto(&paths).await.unwrap();
    std::fs::remove_file(&paths[0]).unwrap();

    let result = transfer_directly(files, &paths, output.path()).await;

    result.sent.unwrap();
    assert_eq!(result.saved.unwrap(), vec![output.path().join("kept.txt")]);
    for events in [&result.sender_events, &result.receiver_events] {
        assert_eq!(outcome(events, "0"), Some(false));
        assert_eq!(outcome(events, "1"), Some(true));
    }
    assert_eq!(
        std::fs::read(output.path().join("kept.txt")).unwrap(),
        std::fs::read(&paths[1]).unwrap()
    );
}

/// 接收方无法写入某个文件时回复带错误的确认，其余文件照常送达
#[tokio::test]
async fn test_receiver_write_failure_is_reported_per_file() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let paths = vec![
        write_file(source.path(), "a.txt", 100),
        write_file(source.path(), "b.txt", 50),
    ];
    let mut files = convert_file_list_to_dto(&paths).await.unwrap();
    // 超过文件系统允许的文件名长度
    files[0].file_name = format!("{}.txt", "x".repeat(300));

    let result = transfer_directly(files, &paths, output.path()).await;

    result.sent.unwrap();
    assert_eq!(result.saved.unwrap(), vec![output.path().join("b.txt")]);
    for events in [&result.sender_events, &result.receiver_events] {
        assert_eq!(outcome(events, "0"), Some(false));
        assert_eq!(outcome(events, "1"), Some(true));
    }
    assert_eq!(std::fs::read_dir(output.path()).unwrap().count(), 1);
}

/// 发送的字节数超过声明的大小时接收方拒收该文件
#[tokio::test]
async fn test_file_larger_than_declared_is_rejected() {
    let source = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let paths = vec![
        write_file(source.path(), "grown.bin", 10),
        write_file(source.path(), "b.txt", 50),
    ];
    let files = convert_file_list_to_dto(&paths).await.unwrap();
    write_file(source.path(), "grown.bin", 3 * 16 * 1024);

    let result = transfer_directly(files, &paths, output.path()).await;

    result.sent.unwrap();
    assert_eq!(result.saved.unwrap(), vec![output.path().join("b.txt")]);
    assert_eq!(outcome(&result.sender_events, "0"), Some(false));
    assert_eq!(outcome(&result.sender_events, "1"), Some(true));
    assert!(!output.path().join("grown.bin").exists());
}

/// 接收方要求 PIN：发送方回答正确时传输成功，回答错误时双方认证失败
#[tokio::test]
async fn test_receiver_demands_pin() {
    let relay = MemoryRelay::new();
    let connector = MemoryConnector::new();
    let alice = start_peer(&relay, &connector, "Alice", None, None).await;
    let bob = start_peer(&relay, &connector, "Bob", Some("4321"), None).await;
    let bob_id = bob.controller.snapshot().client.unwrap().id;
    wait_for(&alice.controller, |s| s.peers.iter().any(|p| p.id == bob_id)).await;
    wait_for(&bob.controller, |s| s.peers.len() == 1).await;

    let source = tempfile::tempdir().unwrap();
    let a = write_file(source.path(), "a.txt", 10);

    alice
        .controller
        .start_send_session(
            std::slice::from_ref(&a),
            &bob_id,
            Some(Arc::new(StaticPin(Some("4321".to_string())))),
        )
        .await
        .unwrap();
    let sent = wait_for(&alice.controller, |s| s.finished_sessions == 1).await;
    wait_for(&bob.controller, |s| s.finished_sessions == 1).await;
    assert!(sent.last_error.is_none(), "{:?}", sent.last_error);
    assert!(bob.dir.path().join("a.txt").exists());

    alice
        .controller
        .start_send_session(
            &[a],
            &bob_id,
            Some(Arc::new(StaticPin(Some("0000".to_string())))),
        )
        .await
        .unwrap();
    let sent = wait_for(&alice.controller, |s| s.finished_sessions == 2).await;
    let received = wait_for(&bob.controller, |s| s.finished_sessions == 2).await;

    let expected = Error::Authentication.to_string();
    assert_eq!(sent.last_error.as_deref(), Some(expected.as_str()));
    assert_eq!(received.last_error.as_deref(), Some(expected.as_str()));
    assert!(!bob.dir.path().join("a (1).txt").exists());

    alice.controller.shutdown().await;
    bob.controller.shutdown().await;
}
