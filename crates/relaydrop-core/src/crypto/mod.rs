//! 加密模块
//!
//! - P-256 ECDSA 签名身份
//! - 带时间戳的客户端令牌生成与校验

pub mod identity;

pub use identity::{Identity, TOKEN_MAX_AGE, token_fingerprint, verify_client_token};
