/*!
 * \brief 凭证保险箱
 * \details
 * - 当前方案：ChaCha20-Poly1305，每次加密生成随机 12 字节 nonce
 * - 密钥由环境变量 `DEBATE_CREDENTIAL_SECRET` 经 SHA-256 派生，缺失即启动失败
 * - 格式：v2:base64(nonce || ciphertext || tag)
 * - 解密时按顺序尝试多种历史编码，旧数据仍可读取
 */

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use sha2::{Digest, Sha256};

use crate::error::{LlmError, Result};

/** \brief 保存密钥的环境变量名 */
pub const SECRET_ENV: &str = "DEBATE_CREDENTIAL_SECRET";

/** \brief 当前方案前缀 */
const CURRENT_PREFIX: &str = "v2:";

const NONCE_SIZE: usize = 12;

/** \brief 旧版固定 nonce 的派生标签 */
const LEGACY_NONCE_LABEL: &[u8] = b"debate-legacy-iv";

/** \brief 明文存储时代常见的 Key 前缀 */
const KNOWN_KEY_PREFIXES: &[&str] = &["sk-ant-", "sk-proj-", "sk-"];

/**
 * \brief 单个解码策略。
 * \details 返回 None 表示该策略不认识此 blob，交由下一个策略处理。
 */
pub trait CredentialDecoder: Send + Sync {
    fn name(&self) -> &'static str;
    fn decode(&self, blob: &str) -> Option<String>;
}

/**
 * \brief 明文 Key（早期未加密数据）。
 */
pub struct PlaintextKeyDecoder {
    prefixes: &'static [&'static str],
}

impl Default for PlaintextKeyDecoder {
    fn default() -> Self {
        Self {
            prefixes: KNOWN_KEY_PREFIXES,
        }
    }
}

impl CredentialDecoder for PlaintextKeyDecoder {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    fn decode(&self, blob: &str) -> Option<String> {
        self.prefixes
            .iter()
            .any(|p| blob.starts_with(p))
            .then(|| blob.to_string())
    }
}

/**
 * \brief 旧版方案：无前缀 base64，nonce 由密钥派生且固定不变。
 */
pub struct LegacyFixedNonceDecoder {
    cipher: ChaCha20Poly1305,
    nonce: [u8; NONCE_SIZE],
}

impl CredentialDecoder for LegacyFixedNonceDecoder {
    fn name(&self) -> &'static str {
        "legacy-fixed-nonce"
    }

    fn decode(&self, blob: &str) -> Option<String> {
        let bytes = BASE64.decode(blob).ok()?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&self.nonce), bytes.as_slice())
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}

/**
 * \brief 当前方案：随机 nonce 拼接在密文之前。
 */
pub struct CurrentSchemeDecoder {
    cipher: ChaCha20Poly1305,
}

impl CredentialDecoder for CurrentSchemeDecoder {
    fn name(&self) -> &'static str {
        "v2"
    }

    fn decode(&self, blob: &str) -> Option<String> {
        let encoded = blob.strip_prefix(CURRENT_PREFIX)?;
        let combined = BASE64.decode(encoded).ok()?;
        if combined.len() < NONCE_SIZE {
            return None;
        }
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .ok()?;
        String::from_utf8(plaintext).ok()
    }
}

/**
 * \brief 凭证保险箱，纯函数变换，可并发使用。
 */
pub struct CredentialVault {
    cipher: ChaCha20Poly1305,
    legacy_nonce: [u8; NONCE_SIZE],
    decoders: Vec<Box<dyn CredentialDecoder>>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.decoders.iter().map(|d| d.name()).collect();
        f.debug_struct("CredentialVault")
            .field("decoders", &names)
            .finish_non_exhaustive()
    }
}

impl CredentialVault {
    /**
     * \brief 从环境变量构造；变量缺失或为空时返回 MissingSecret。
     */
    pub fn from_env() -> Result<Self> {
        match std::env::var(SECRET_ENV) {
            Ok(secret) if !secret.trim().is_empty() => Ok(Self::new(&secret)),
            _ => Err(LlmError::MissingSecret(SECRET_ENV)),
        }
    }

    pub fn new(secret: &str) -> Self {
        let key = derive_key(secret);
        let cipher = ChaCha20Poly1305::new(&key.into());
        let legacy_nonce = derive_legacy_nonce(secret);
        let decoders: Vec<Box<dyn CredentialDecoder>> = vec![
            Box::new(PlaintextKeyDecoder::default()),
            Box::new(LegacyFixedNonceDecoder {
                cipher: cipher.clone(),
                nonce: legacy_nonce,
            }),
            Box::new(CurrentSchemeDecoder {
                cipher: cipher.clone(),
            }),
        ];
        Self {
            cipher,
            legacy_nonce,
            decoders,
        }
    }

    /**
     * \brief 加密 Provider 的明文 Key。
     */
    pub fn store(&self, provider_id: i64, plaintext: &str) -> Result<String> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| LlmError::Store("credential encryption failed".to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        tracing::debug!(provider_id, "sealed provider credential");
        Ok(format!("{}{}", CURRENT_PREFIX, BASE64.encode(&combined)))
    }

    /**
     * \brief 依次尝试各解码策略还原明文。
     */
    pub fn reveal(&self, blob: &str) -> Result<String> {
        for decoder in &self.decoders {
            if let Some(plaintext) = decoder.decode(blob) {
                if decoder.name() != "v2" {
                    tracing::debug!(scheme = decoder.name(), "credential decoded with legacy scheme");
                }
                return Ok(plaintext);
            }
        }
        Err(LlmError::DecryptionFailed)
    }

    /**
     * \brief 以旧版固定 nonce 方案加密，仅用于兼容性验证。
     */
    pub fn seal_legacy(&self, plaintext: &str) -> Result<String> {
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&self.legacy_nonce), plaintext.as_bytes())
            .map_err(|_| LlmError::Store("credential encryption failed".to_string()))?;
        Ok(BASE64.encode(ciphertext))
    }

    /** \brief 该 blob 是否需要重新加密为当前方案。 */
    pub fn needs_upgrade(blob: &str) -> bool {
        !blob.is_empty() && !blob.starts_with(CURRENT_PREFIX)
    }
}

fn derive_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    key
}

fn derive_legacy_nonce(secret: &str) -> [u8; NONCE_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(LEGACY_NONCE_LABEL);
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&digest[..NONCE_SIZE]);
    nonce
}
