//! RelayDrop CLI
//!
//! 命令行客户端，通过 Unix Socket 与守护进程通信

mod client;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relaydrop_core::FileStatus;
use relaydrop_core::ipc::{IpcRequest, IpcResponse, StatusReport};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "relaydrop", version, about = "RelayDrop - 经中继信令的点对点文件传输")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 发送文件
    Send {
        /// 要发送的文件路径
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// 目标设备 (id 或别名)
        #[arg(short, long)]
        to: String,
        /// 对端要求 PIN 时使用的 PIN
        #[arg(short, long)]
        pin: Option<String>,
        /// 等待传输结束并显示进度
        #[arg(short, long)]
        wait: bool,
    },
    /// 列出在线设备
    Peers,
    /// 查看当前状态
    Status {
        /// 以 JSON 输出
        #[arg(long)]
        json: bool,
    },
    /// 修改本机别名
    Alias {
        /// 新别名
        alias: String,
    },
    /// 设置接收时要求对端提供的 PIN (不指定则关闭)
    Pin {
        pin: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Send {
            files,
            to,
            pin,
            wait,
        } => {
            let mut paths = Vec::with_capacity(files.len());
            for file in &files {
                let path = std::fs::canonicalize(file)
                    .with_context(|| format!("cannot access {}", file.display()))?;
                paths.push(path.to_string_lossy().to_string());
            }

            println!("📤 发送 {} 个文件 -> {}", paths.len(), to);
            let resp = client::send_request(&IpcRequest::Send {
                files: paths,
                target: to,
                pin,
            })
            .await?;

            if matches!(resp, IpcResponse::Ok { .. }) && wait {
                wait_for_idle().await?;
            }
        }
        Commands::Peers => {
            let resp = client::send_request(&IpcRequest::Peers).await?;
            if let IpcResponse::Peers { peers } = resp {
                if peers.is_empty() {
                    println!("   没有在线设备");
                } else {
                    for peer in &peers {
                        let model = peer.device_model.as_deref().unwrap_or("-");
                        println!("   {} [{}] ({})", peer.alias, peer.id, model);
                    }
                }
            }
        }
        Commands::Status { json } => {
            let resp = client::send_request(&IpcRequest::Status).await?;
            if let IpcResponse::Status(report) = resp {
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_status(&report);
                }
            }
        }
        Commands::Alias { alias } => {
            client::send_request(&IpcRequest::Alias { alias }).await?;
        }
        Commands::Pin { pin } => {
            client::send_request(&IpcRequest::Pin { pin }).await?;
        }
    }

    Ok(())
}

fn print_status(report: &StatusReport) {
    let connection = if report.connected { "已连接" } else { "未连接" };
    println!("信令: {}", connection);
    if let (Some(alias), Some(id)) = (&report.alias, &report.id) {
        println!("本机: {} [{}]", alias, id);
    }
    println!("PIN: {}", if report.pin_enabled { "开启" } else { "关闭" });
    println!("状态: {}", report.state);

    if !report.files.is_empty() {
        println!("进度: {:.1}%", report.progress * 100.0);
        for file in &report.files {
            let mark = match file.state {
                FileStatus::Pending => "⏳",
                FileStatus::Skipped => "⏭️ ",
                FileStatus::Sending => "🔄",
                FileStatus::Finished => "✅",
                FileStatus::Error => "❌",
            };
            println!("   {} {} ({}/{} bytes)", mark, file.name, file.curr, file.total);
            if let Some(error) = &file.error {
                println!("      {}", error);
            }
        }
    }
    if let Some(error) = &report.last_error {
        println!("最近错误: {}", error);
    }
}

/// 轮询状态直到会话结束
async fn wait_for_idle() -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    loop {
        interval.tick().await;
        let IpcResponse::Status(report) = client::send_request(&IpcRequest::Status).await? else {
            continue;
        };

        if report.state == "idle" {
            match &report.last_error {
                Some(error) => anyhow::bail!("传输失败: {error}"),
                None => println!("✅ 传输完成"),
            }
            return Ok(());
        }
        println!("   {:.1}%", report.progress * 100.0);
    }
}
