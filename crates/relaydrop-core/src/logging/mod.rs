//! 日志模块
//!
//! 核心库只通过 `log` 门面输出日志；二进制程序用 `tracing_log::LogTracer`
//! 桥接到 `tracing`，并用这里的级别生成 `EnvFilter` 指令。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 本项目各 crate 的目标名
const TARGETS: [&str; 3] = ["relaydrop_core", "relaydrop_daemon", "relaydrop"];

/// 日志级别
///
/// 实现了 `PartialOrd` 以便过滤。
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    #[default]
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    /// 获取显示名称
    pub fn name(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// `EnvFilter` 指令：本项目按该级别输出，第三方库只输出警告
    pub fn directive(&self) -> String {
        let level = self.name().to_lowercase();
        let mut directive = String::from("warn");
        for target in TARGETS {
            directive.push_str(&format!(",{target}={level}"));
        }
        directive
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ERROR" => Ok(LogLevel::Error),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            "TRACE" => Ok(LogLevel::Trace),
            _ => Err(format!("unknown log level: {s}")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
