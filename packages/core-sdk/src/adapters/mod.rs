/*!
 * \brief Provider 适配器
 * \details 每个上游厂商一个适配器，负责：
 * - 把统一请求转换为厂商的 HTTP 负载与请求头
 * - 把厂商响应解析回统一结果
 * - 对非 2xx 响应做分类
 */

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ErrorKind, LlmError, Result};
use crate::models::{NormalizedRequest, NormalizedResult};

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;

/**
 * \brief 鉴权头描述：头名称与取值前缀。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthScheme {
    pub kind: &'static str,
    pub header: &'static str,
    pub value_prefix: &'static str,
}

impl AuthScheme {
    pub fn header_value(&self, api_key: &str) -> String {
        format!("{}{}", self.value_prefix, api_key)
    }
}

/** \brief 各厂商鉴权方式，按适配器 kind 查表。 */
pub static AUTH_SCHEMES: &[AuthScheme] = &[
    AuthScheme {
        kind: "anthropic",
        header: "x-api-key",
        value_prefix: "",
    },
    AuthScheme {
        kind: "openai",
        header: "authorization",
        value_prefix: "Bearer ",
    },
];

pub fn auth_scheme_for(kind: &str) -> Option<&'static AuthScheme> {
    AUTH_SCHEMES.iter().find(|s| s.kind == kind)
}

/**
 * \brief 厂商线上请求：相对路径、JSON 负载与额外请求头（不含鉴权头）。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    pub path: &'static str,
    pub body: Value,
    pub headers: Vec<(&'static str, String)>,
}

/**
 * \brief 适配器统一接口。
 */
pub trait ProviderAdapter: Send + Sync {
    /** \brief 对应 AUTH_SCHEMES 中的 kind */
    fn kind(&self) -> &'static str;

    fn build_request(&self, request: &NormalizedRequest) -> WireRequest;

    fn parse_response(&self, body: &Value) -> Result<NormalizedResult>;

    fn classify_error(&self, status: u16, body: &str) -> ErrorKind;

    /** \brief 每个请求都需要携带的厂商专有头（不含鉴权）。 */
    fn extra_headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn models_path(&self) -> &'static str {
        "/v1/models"
    }

    /** \brief 默认兼容 `{"data":[{"id":..}]}` 与裸数组两种格式。 */
    fn parse_model_list(&self, body: &Value) -> Result<Vec<String>> {
        parse_model_list(body)
    }
}

/**
 * \brief 适配器注册表，按 Provider.kind 查找。
 */
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 内置 Anthropic 与 OpenAI 两类适配器及其常用别名。
     */
    pub fn with_defaults() -> Self {
        let anthropic: Arc<dyn ProviderAdapter> = Arc::new(AnthropicAdapter::default());
        let openai: Arc<dyn ProviderAdapter> = Arc::new(OpenAiAdapter);
        let mut registry = Self::new();
        registry.register("anthropic", anthropic.clone());
        registry.register("claude", anthropic);
        registry.register("openai", openai.clone());
        registry.register("openai-compatible", openai.clone());
        registry.register("deepseek", openai);
        registry
    }

    pub fn register(&mut self, key: &str, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(key.to_ascii_lowercase(), adapter);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind.to_ascii_lowercase()).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.adapters.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/**
 * \brief 各厂商通用的错误分类兜底：先看正文是否指向模型标识，再看状态码。
 */
pub(crate) fn classify_common(status: u16, body: &str) -> ErrorKind {
    let lower = body.to_ascii_lowercase();
    if matches!(status, 400 | 404) && lower.contains("model") {
        return ErrorKind::InvalidModel;
    }
    if lower.contains("quota") || lower.contains("credit balance") {
        return ErrorKind::QuotaExceeded;
    }
    ErrorKind::from_status(status)
}

pub(crate) fn token_count(v: Option<&Value>) -> u64 {
    v.and_then(|n| n.as_u64()).unwrap_or(0)
}

fn parse_model_list(v: &Value) -> Result<Vec<String>> {
    if let Some(arr) = v.get("data").and_then(|x| x.as_array()) {
        Ok(arr
            .iter()
            .filter_map(|item| item.get("id").and_then(|s| s.as_str()))
            .map(|s| s.to_string())
            .collect())
    } else if let Some(arr) = v.as_array() {
        Ok(arr
            .iter()
            .filter_map(|item| {
                item.get("id")
                    .and_then(|s| s.as_str())
                    .or_else(|| item.as_str())
            })
            .map(|s| s.to_string())
            .collect())
    } else {
        Err(LlmError::MalformedResponse(format!(
            "unexpected models payload: {}",
            v
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_lookup_is_case_insensitive_with_aliases() {
        let registry = AdapterRegistry::with_defaults();
        assert_eq!(registry.get("Anthropic").unwrap().kind(), "anthropic");
        assert_eq!(registry.get("claude").unwrap().kind(), "anthropic");
        assert_eq!(registry.get("deepseek").unwrap().kind(), "openai");
        assert!(registry.get("gemini").is_none());
        assert!(registry.kinds().contains(&"openai-compatible".to_string()));
    }

    #[test]
    fn test_every_builtin_adapter_has_an_auth_scheme() {
        let registry = AdapterRegistry::with_defaults();
        for key in registry.kinds() {
            let adapter = registry.get(&key).unwrap();
            assert!(auth_scheme_for(adapter.kind()).is_some(), "missing scheme for {}", key);
        }
    }

    #[test]
    fn test_auth_header_values() {
        let anthropic = auth_scheme_for("anthropic").unwrap();
        assert_eq!(anthropic.header, "x-api-key");
        assert_eq!(anthropic.header_value("sk-ant-1"), "sk-ant-1");
        let openai = auth_scheme_for("openai").unwrap();
        assert_eq!(openai.header, "authorization");
        assert_eq!(openai.header_value("sk-1"), "Bearer sk-1");
    }

    #[test]
    fn test_parse_model_list_formats() {
        let data = json!({"data": [{"id": "gpt-4o"}, {"id": "gpt-4o-mini"}]});
        assert_eq!(parse_model_list(&data).unwrap(), vec!["gpt-4o", "gpt-4o-mini"]);
        let bare = json!(["a", {"id": "b"}]);
        assert_eq!(parse_model_list(&bare).unwrap(), vec!["a", "b"]);
        assert!(matches!(
            parse_model_list(&json!({"x": 1})),
            Err(LlmError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_classify_common() {
        assert_eq!(
            classify_common(400, r#"{"error":"invalid model"}"#),
            ErrorKind::InvalidModel
        );
        assert_eq!(classify_common(400, r#"{"error":"bad json"}"#), ErrorKind::BadRequest);
        assert_eq!(classify_common(429, "You exceeded your current quota"), ErrorKind::QuotaExceeded);
        assert_eq!(classify_common(500, ""), ErrorKind::ServerError);
    }
}
