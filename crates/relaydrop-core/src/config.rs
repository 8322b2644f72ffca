//! 应用配置和持久化
//!
//! 提供别名、信令服务器、STUN 服务器、PIN 和下载目录等设置的存储和读取。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::LogLevel;
use crate::session::ControllerConfig;
use crate::signaling::{ClientInfoWithoutId, DeviceType, RETRY_DELAY};

/// 默认信令服务器
pub const DEFAULT_SIGNALING_URL: &str = "wss://public.localsend.org/v1/ws";

/// 协议版本（出现在 `ClientInfo.version` 中）
pub const PROTOCOL_VERSION: &str = "2.1";

/// 默认 STUN 服务器
pub fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

/// 应用设置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// 在房间中显示的别名
    pub alias: String,
    pub device_model: Option<String>,
    pub device_type: DeviceType,
    pub signaling_url: String,
    pub stun_servers: Vec<String>,
    /// 要求对端提供的 PIN
    pub pin: Option<String>,
    /// 对端要求 PIN 时自动回答的 PIN
    pub remote_pin: Option<String>,
    /// 下载目录
    pub download_dir: PathBuf,
    /// 重连间隔（秒），0 视为默认值
    pub retry_delay_secs: u64,
    /// 等待 ANSWER 的超时（秒）
    pub answer_timeout_secs: u64,
    /// 数据通道对外通告的地址（不设置时自动探测）
    pub advertise_host: Option<IpAddr>,
    pub log_level: LogLevel,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            alias: get_default_alias(),
            device_model: Some(std::env::consts::OS.to_string()),
            device_type: DeviceType::Headless,
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: default_stun_servers(),
            pin: None,
            remote_pin: None,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            retry_delay_secs: 5,
            answer_timeout_secs: 60,
            advertise_host: None,
            log_level: LogLevel::Info,
        }
    }
}

impl AppSettings {
    /// 获取配置文件路径
    pub fn config_path() -> PathBuf {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relaydrop");
        config_dir.join("settings.toml")
    }

    /// 加载设置（如果文件不存在则使用默认值）
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {:?}", path);
                        return settings;
                    }
                    Err(e) => {
                        log::warn!("Failed to parse settings: {}, using defaults", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read settings file: {}, using defaults", e);
                }
            }
        }
        Self::default()
    }

    /// 保存设置
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        debug!("Saved settings to {:?}", path);
        Ok(())
    }

    /// 提议给信令服务器的身份（令牌在每次连接前生成）
    pub fn client_info(&self) -> ClientInfoWithoutId {
        ClientInfoWithoutId {
            alias: self.alias.clone(),
            version: PROTOCOL_VERSION.to_string(),
            device_model: self.device_model.clone(),
            device_type: Some(self.device_type),
            token: String::new(),
        }
    }

    /// 会话控制器配置
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            signaling_url: self.signaling_url.clone(),
            stun_servers: self.stun_servers.clone(),
            retry_delay: self.retry_delay(),
            answer_timeout: Duration::from_secs(self.answer_timeout_secs),
            download_dir: self.download_dir.clone(),
            pin: self.pin.clone(),
        }
    }

    fn retry_delay(&self) -> Duration {
        if self.retry_delay_secs == 0 {
            log::warn!(
                "retry_delay_secs = 0 is not allowed, using {}s",
                RETRY_DELAY.as_secs()
            );
            return RETRY_DELAY;
        }
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// 获取默认别名（主机名）
fn get_default_alias() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "RelayDrop".to_string())
}
