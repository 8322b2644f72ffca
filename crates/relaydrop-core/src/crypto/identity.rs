//! 客户端身份与令牌
//!
//! 每个进程持有一对 P-256 ECDSA 签名密钥（可持久化到配置目录）。
//! 连接信令服务器和发起传输时都会生成一个绑定当前时间的客户端令牌：
//!
//! ```text
//! sha256.<fingerprint>.<unix 秒>.<nonce>.p256.<signature>
//! ```
//!
//! - fingerprint: SPKI DER 公钥的 SHA-256（base64url，无填充）
//! - nonce: 8 字节随机数，保证每次生成的令牌都不相同
//! - signature: 对 `.p256.` 之前部分的 ECDSA-P256-SHA256 签名（base64url）

use log::{debug, info};

use crate::error::{Error, Result};
use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use p256::ecdsa::{
    Signature, SigningKey, VerifyingKey,
    signature::{Signer, Verifier},
};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 令牌最大有效期
pub const TOKEN_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// 允许的时钟偏差（令牌时间戳最多领先本地时间这么多）
const CLOCK_SKEW: Duration = Duration::from_secs(60);

const TOKEN_HASH: &str = "sha256";
const TOKEN_SIGNATURE_SEPARATOR: &str = ".p256.";

/// 本地签名身份
pub struct Identity {
    signing_key: SigningKey,
    /// Base64 (standard) 编码的 SPKI DER 公钥
    public_key_b64: String,
    /// 公钥指纹
    fingerprint: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// 持久化格式
#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    version: u32,
    /// Base64 编码的私钥标量
    secret_key: String,
}

impl Identity {
    /// 生成新的随机身份
    pub fn generate() -> Result<Self> {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// 从 32 字节私钥恢复身份
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        let signing_key =
            SigningKey::from_slice(bytes).map_err(|e| Error::Crypto(e.to_string()))?;
        Self::from_signing_key(signing_key)
    }

    fn from_signing_key(signing_key: SigningKey) -> Result<Self> {
        let der = signing_key
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| Error::Crypto(e.to_string()))?;

        Ok(Self {
            public_key_b64: STANDARD.encode(der.as_bytes()),
            fingerprint: fingerprint_of(der.as_bytes()),
            signing_key,
        })
    }

    /// 默认存储位置: `<config_dir>/relaydrop/identity.json`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relaydrop")
            .join("identity.json")
    }

    /// 读取已保存的身份，不存在时生成并保存
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let file: IdentityFile = serde_json::from_str(&content)?;
            let secret = STANDARD.decode(&file.secret_key)?;
            let identity = Self::from_secret_bytes(&secret)?;
            debug!("Loaded identity {} from {:?}", identity.fingerprint, path);
            return Ok(identity);
        }

        let identity = Self::generate()?;
        identity.save(path)?;
        info!("Generated new identity {}", identity.fingerprint);
        Ok(identity)
    }

    /// 保存私钥
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = IdentityFile {
            version: 1,
            secret_key: STANDARD.encode(self.signing_key.to_bytes()),
        };
        write_private(path, serde_json::to_string_pretty(&file)?.as_bytes())?;
        debug!("Saved identity to {:?}", path);
        Ok(())
    }

    /// Base64 编码的 SPKI DER 公钥
    pub fn public_key(&self) -> &str {
        &self.public_key_b64
    }

    /// 公钥指纹（令牌中的第二段）
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// 以当前时间生成客户端令牌
    pub fn generate_client_token(&self) -> String {
        self.token_at(unix_now())
    }

    fn token_at(&self, timestamp: u64) -> String {
        let nonce: [u8; 8] = rand::random();
        let signed = format!(
            "{TOKEN_HASH}.{}.{timestamp}.{}",
            self.fingerprint,
            URL_SAFE_NO_PAD.encode(nonce)
        );
        let signature: Signature = self.signing_key.sign(signed.as_bytes());
        format!(
            "{signed}{TOKEN_SIGNATURE_SEPARATOR}{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        )
    }
}

/// 解析后的令牌
struct ParsedToken<'a> {
    signed: &'a str,
    fingerprint: &'a str,
    timestamp: u64,
    signature: &'a str,
}

impl<'a> ParsedToken<'a> {
    fn parse(token: &'a str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidToken(reason.to_string());

        let (signed, signature) = token
            .rsplit_once(TOKEN_SIGNATURE_SEPARATOR)
            .ok_or_else(|| invalid("missing signature"))?;

        let parts: Vec<&str> = signed.split('.').collect();
        if parts.len() != 4 || parts[0] != TOKEN_HASH {
            return Err(invalid("malformed token"));
        }

        let timestamp = parts[2]
            .parse()
            .map_err(|_| invalid("malformed timestamp"))?;

        Ok(Self {
            signed,
            fingerprint: parts[1],
            timestamp,
            signature,
        })
    }
}

/// 提取令牌中的公钥指纹
pub fn token_fingerprint(token: &str) -> Option<&str> {
    ParsedToken::parse(token).ok().map(|t| t.fingerprint)
}

/// 校验令牌：格式、公钥指纹、签名和时效
pub fn verify_client_token(token: &str, public_key_b64: &str, max_age: Duration) -> Result<()> {
    let parsed = ParsedToken::parse(token)?;

    let der = STANDARD
        .decode(public_key_b64)
        .map_err(|e| Error::InvalidToken(format!("bad public key encoding: {e}")))?;

    if fingerprint_of(&der) != parsed.fingerprint {
        return Err(Error::InvalidToken(
            "fingerprint does not match public key".to_string(),
        ));
    }

    let key = VerifyingKey::from_public_key_der(&der)
        .map_err(|e| Error::InvalidToken(format!("bad public key: {e}")))?;

    let signature_bytes = URL_SAFE_NO_PAD
        .decode(parsed.signature)
        .map_err(|e| Error::InvalidToken(format!("bad signature encoding: {e}")))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|e| Error::InvalidToken(format!("bad signature: {e}")))?;

    key.verify(parsed.signed.as_bytes(), &signature)
        .map_err(|_| Error::InvalidToken("signature mismatch".to_string()))?;

    let now = unix_now();
    if parsed.timestamp > now + CLOCK_SKEW.as_secs() {
        return Err(Error::InvalidToken("issued in the future".to_string()));
    }
    if now.saturating_sub(parsed.timestamp) > max_age.as_secs() {
        return Err(Error::InvalidToken("expired".to_string()));
    }

    Ok(())
}

fn fingerprint_of(public_key_der: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(public_key_der))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// 写入私钥文件（unix 上权限为 600）
#[cfg(unix)]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // 已存在的文件不受 mode 影响
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(content)?;
    file.flush()
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    fs::write(path, content)
}
