use std::fmt;

use thiserror::Error;

/**
 * \brief 编排层统一错误类型。
 * \details 只有 `TransportError` 与 `Timeout` 允许重试，其余均需要改配置或人工介入。
 */
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("no active configuration resolves for function `{0}`")]
    NoConfigurationAvailable(String),

    #[error("configuration invalid: {0}")]
    ConfigurationInvalid(ConfigInvariant),

    #[error("credential decryption failed")]
    DecryptionFailed,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("provider rejected request ({status}, {kind}): {body}")]
    ProviderRejected {
        status: u16,
        kind: ErrorKind,
        body: String,
    },

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("unresolved placeholders: {}", .0.join(", "))]
    UnresolvedPlaceholders(Vec<String>),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("required secret `{0}` is not set")]
    MissingSecret(&'static str),

    #[error("store error: {0}")]
    Store(String),
}

impl LlmError {
    /** \brief 是否允许在 Dispatching 阶段内重试。 */
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::TransportError(_) | LlmError::Timeout(_))
    }

    /**
     * \brief 写入 Interaction.error_kind 的稳定标识。
     */
    pub fn code(&self) -> &'static str {
        match self {
            LlmError::NoConfigurationAvailable(_) => "no_configuration_available",
            LlmError::ConfigurationInvalid(_) => "configuration_invalid",
            LlmError::DecryptionFailed => "decryption_failed",
            LlmError::TransportError(_) => "transport_error",
            LlmError::ProviderRejected { .. } => "provider_rejected",
            LlmError::Timeout(_) => "timeout",
            LlmError::UnresolvedPlaceholders(_) => "unresolved_placeholders",
            LlmError::MalformedResponse(_) => "malformed_response",
            LlmError::MissingSecret(_) => "missing_secret",
            LlmError::Store(_) => "store_error",
        }
    }
}

impl From<rusqlite::Error> for LlmError {
    fn from(err: rusqlite::Error) -> Self {
        LlmError::Store(err.to_string())
    }
}

impl From<anyhow::Error> for LlmError {
    fn from(err: anyhow::Error) -> Self {
        LlmError::Store(format!("{:#}", err))
    }
}

/**
 * \brief 解析出的配置违反的具体不变量，供运维定位。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigInvariant {
    ProviderMissing { provider_id: i64 },
    ProviderInactive { provider: String },
    ProviderWithoutCredential { provider: String },
    ModelMissing { model_id: i64 },
    ModelInactive { model: String },
    ModelProviderMismatch { model: String, provider: String },
    BlankModelIdentifier { model: String },
    NoAdapterRegistered { provider: String, kind: String },
    TemplateMissing { template_id: i64 },
    TemplateInactive { template: String, version: i64 },
}

impl fmt::Display for ConfigInvariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProviderMissing { provider_id } => {
                write!(f, "provider id {} does not exist", provider_id)
            }
            Self::ProviderInactive { provider } => write!(f, "provider `{}` is inactive", provider),
            Self::ProviderWithoutCredential { provider } => {
                write!(f, "provider `{}` has no stored credential", provider)
            }
            Self::ModelMissing { model_id } => write!(f, "model id {} does not exist", model_id),
            Self::ModelInactive { model } => write!(f, "model `{}` is inactive", model),
            Self::ModelProviderMismatch { model, provider } => write!(
                f,
                "model `{}` does not belong to provider `{}`",
                model, provider
            ),
            Self::BlankModelIdentifier { model } => {
                write!(f, "model `{}` has an empty model identifier", model)
            }
            Self::NoAdapterRegistered { provider, kind } => write!(
                f,
                "provider `{}` uses kind `{}` which has no registered adapter",
                provider, kind
            ),
            Self::TemplateMissing { template_id } => {
                write!(f, "prompt template id {} does not exist", template_id)
            }
            Self::TemplateInactive { template, version } => {
                write!(f, "prompt template `{}` v{} is not active", template, version)
            }
        }
    }
}

/**
 * \brief 上游非 2xx 响应的细分类别。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    InvalidModel,
    Authentication,
    QuotaExceeded,
    RateLimited,
    Overloaded,
    ServerError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::InvalidModel => "invalid_model",
            ErrorKind::Authentication => "authentication",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Unknown => "unknown",
        }
    }

    /** \brief 按 HTTP 状态码给出的通用分类，适配器可在此基础上细化。 */
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => ErrorKind::BadRequest,
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::InvalidModel,
            402 => ErrorKind::QuotaExceeded,
            429 => ErrorKind::RateLimited,
            503 | 529 => ErrorKind::Overloaded,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_failures_are_retryable() {
        assert!(LlmError::TransportError("reset".into()).is_retryable());
        assert!(LlmError::Timeout(1000).is_retryable());
        assert!(!LlmError::DecryptionFailed.is_retryable());
        assert!(!LlmError::ProviderRejected {
            status: 400,
            kind: ErrorKind::InvalidModel,
            body: "{}".into(),
        }
        .is_retryable());
        assert!(!LlmError::NoConfigurationAvailable("chat".into()).is_retryable());
    }

    #[test]
    fn test_invariant_is_named_in_message() {
        let err = LlmError::ConfigurationInvalid(ConfigInvariant::ProviderWithoutCredential {
            provider: "anthropic".into(),
        });
        assert_eq!(
            err.to_string(),
            "configuration invalid: provider `anthropic` has no stored credential"
        );
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Authentication);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimited);
        assert_eq!(ErrorKind::from_status(502), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(529), ErrorKind::Overloaded);
    }
}
