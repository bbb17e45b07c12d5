use std::path::PathBuf;
use std::time::Duration;

use crate::error::{LlmError, Result};
use crate::prompt::PlaceholderPolicy;
use crate::vault::SECRET_ENV;

pub const DB_PATH_ENV: &str = "DEBATE_DB_PATH";
pub const HTTP_TIMEOUT_ENV: &str = "DEBATE_HTTP_TIMEOUT_SECS";
pub const MAX_RETRIES_ENV: &str = "DEBATE_MAX_RETRIES";
pub const STRICT_PLACEHOLDERS_ENV: &str = "DEBATE_STRICT_PLACEHOLDERS";

const DEFAULT_DB_PATH: &str = "debate.db";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 1;

/**
 * \brief 进程级设置，启动时从环境变量读取一次。
 */
#[derive(Clone)]
pub struct Settings {
    pub credential_secret: String,
    pub db_path: PathBuf,
    pub http_timeout: Duration,
    pub max_retries: u32,
    pub placeholder_policy: PlaceholderPolicy,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("credential_secret", &"<redacted>")
            .field("db_path", &self.db_path)
            .field("http_timeout", &self.http_timeout)
            .field("max_retries", &self.max_retries)
            .field("placeholder_policy", &self.placeholder_policy)
            .finish()
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 从任意键值来源构造，便于测试。
     * \details 密钥缺失即失败；超时限制在 5–600 秒，重试次数限制在 0–3。
     */
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let credential_secret = lookup(SECRET_ENV)
            .filter(|s| !s.trim().is_empty())
            .ok_or(LlmError::MissingSecret(SECRET_ENV))?;

        let db_path = lookup(DB_PATH_ENV)
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let timeout_secs = lookup(HTTP_TIMEOUT_ENV)
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS)
            .clamp(5, 600);

        let max_retries = lookup(MAX_RETRIES_ENV)
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES)
            .min(3);

        let strict = lookup(STRICT_PLACEHOLDERS_ENV)
            .map(|s| parse_flag(&s))
            .unwrap_or(false);

        Ok(Self {
            credential_secret,
            db_path,
            http_timeout: Duration::from_secs(timeout_secs),
            max_retries,
            placeholder_policy: if strict {
                PlaceholderPolicy::Reject
            } else {
                PlaceholderPolicy::PassThrough
            },
        })
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
