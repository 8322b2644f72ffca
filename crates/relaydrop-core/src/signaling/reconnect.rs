//! 信令重连循环
//!
//! 启动后常驻运行：每轮先生成新的身份（新令牌），连接成功后挂起等待连接关闭；
//! 连接失败或关闭后固定等待 `retry_delay` 再重试。没有退避增长，也没有重试上限。
//! 取消令牌只用于进程退出和测试。

use log::{debug, info, warn};

use crate::error::Result;
use crate::signaling::connection::{Dialer, SignalingEvent};
use crate::signaling::protocol::ClientInfoWithoutId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 默认重试间隔
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// 每次连接前提供最新的本地身份
pub trait InfoSource: Send + Sync {
    /// 返回带新令牌的身份；令牌不会在两次连接尝试之间复用
    fn generate_new_info(&self) -> Result<ClientInfoWithoutId>;
}

/// 受监督的重连任务
pub struct ConnectionLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ConnectionLoop {
    pub fn spawn(
        url: String,
        retry_delay: Duration,
        dialer: Arc<dyn Dialer>,
        source: Arc<dyn InfoSource>,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            url,
            retry_delay,
            dialer,
            source,
            events,
            cancel.clone(),
        ));
        Self { cancel, handle }
    }

    /// 停止并等待任务结束
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("Connection loop task failed: {}", e);
        }
    }
}

async fn run(
    url: String,
    retry_delay: Duration,
    dialer: Arc<dyn Dialer>,
    source: Arc<dyn InfoSource>,
    events: mpsc::UnboundedSender<SignalingEvent>,
    cancel: CancellationToken,
) {
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;

        let connect = async {
            let info = source.generate_new_info()?;
            let _ = events.send(SignalingEvent::TokenRefreshed(info.token.clone()));
            debug!("Signaling connect attempt #{}", attempt);
            dialer.dial(&url, &info, events.clone()).await
        };

        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = connect => result,
        };

        match result {
            Ok(connection) => {
                info!("Signaling connected (attempt #{})", attempt);
                let _ = events.send(SignalingEvent::Connected(connection.clone()));

                let cancelled = tokio::select! {
                    () = cancel.cancelled() => true,
                    () = connection.wait_until_close() => false,
                };
                let _ = events.send(SignalingEvent::Closed);
                if cancelled {
                    break;
                }
                info!("Signaling connection lost, retrying in {:?}", retry_delay);
            }
            Err(e) => {
                warn!(
                    "Signaling connect failed: {}; retrying in {:?}",
                    e, retry_delay
                );
            }
        }

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(retry_delay) => {}
        }
    }

    debug!("Connection loop stopped");
}
