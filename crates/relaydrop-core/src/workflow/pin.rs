//! 数据通道上的 PIN 校验
//!
//! 校验方发送 `pinRequired{remaining}` 或 `authorized`；被校验方对每个
//! `pinRequired` 回答 `pin{pin}`，放弃时回答 `cancel`。次数耗尽后校验方发送
//! `pinRejected`，双方都以认证错误结束。

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::transfer::{Control, ControlChannel};
use crate::workflow::{PinPolicy, PinPrompt};

/// 作为校验方：按 `policy` 要求对端提供 PIN
pub(crate) async fn demand_pin(channel: &mut ControlChannel, policy: Option<&PinPolicy>) -> Result<()> {
    let Some(policy) = policy else {
        return channel.send(&Control::Authorized).await;
    };

    let mut remaining = policy.max_tries.max(1);
    loop {
        channel.send(&Control::PinRequired { remaining }).await?;

        match channel.recv_control().await? {
            Control::Pin { pin } if pin == policy.pin => {
                info!("Peer presented the correct PIN");
                return channel.send(&Control::Authorized).await;
            }
            Control::Pin { .. } => {
                remaining -= 1;
                warn!("Peer presented a wrong PIN ({} tries left)", remaining);
                if remaining == 0 {
                    channel.send(&Control::PinRejected).await?;
                    return Err(Error::Authentication);
                }
            }
            Control::Cancel => return Err(Error::PinCancelled),
            Control::Error { message } => return Err(Error::Remote(message)),
            other => return Err(unexpected(&other)),
        }
    }
}

/// 作为被校验方：按对端要求提供 PIN
pub(crate) async fn answer_pin(channel: &mut ControlChannel, prompt: &dyn PinPrompt) -> Result<()> {
    loop {
        match channel.recv_control().await? {
            Control::Authorized => return Ok(()),
            Control::PinRequired { remaining } => {
                debug!("Peer requires a PIN ({} tries left)", remaining);
                match prompt.request_pin().await {
                    Some(pin) => channel.send(&Control::Pin { pin }).await?,
                    None => {
                        channel.send(&Control::Cancel).await?;
                        return Err(Error::PinCancelled);
                    }
                }
            }
            Control::PinRejected => return Err(Error::Authentication),
            Control::Error { message } => return Err(Error::Remote(message)),
            other => return Err(unexpected(&other)),
        }
    }
}

fn unexpected(control: &Control) -> Error {
    Error::Protocol(format!("unexpected message during PIN exchange: {control:?}"))
}
