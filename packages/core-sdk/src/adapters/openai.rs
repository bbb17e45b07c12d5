use serde_json::{json, Value};

use super::{classify_common, token_count, ProviderAdapter, WireRequest};
use crate::error::{ErrorKind, LlmError, Result};
use crate::models::{NormalizedRequest, NormalizedResult, Usage};

/**
 * \brief OpenAI Chat Completions 及兼容接口：所有消息（含 system）放在同一数组。
 */
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiAdapter;

impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> &'static str {
        "openai"
    }

    fn build_request(&self, request: &NormalizedRequest) -> WireRequest {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": false
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = request.max_tokens {
            body["max_tokens"] = json!(n);
        }
        WireRequest {
            path: "/v1/chat/completions",
            body,
            headers: self.extra_headers(),
        }
    }

    fn parse_response(&self, v: &Value) -> Result<NormalizedResult> {
        let first = v
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| LlmError::MalformedResponse(format!("missing choices: {}", v)))?;
        let content = first
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        let usage = v.get("usage");
        Ok(NormalizedResult {
            content,
            usage: Usage {
                input_tokens: token_count(usage.and_then(|u| u.get("prompt_tokens"))),
                output_tokens: token_count(usage.and_then(|u| u.get("completion_tokens"))),
            },
        })
    }

    fn classify_error(&self, status: u16, body: &str) -> ErrorKind {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let code = parsed
            .as_ref()
            .and_then(|v| v.get("error"))
            .and_then(|e| e.get("code").or_else(|| e.get("type")))
            .and_then(|c| c.as_str());
        match code {
            Some("model_not_found") => ErrorKind::InvalidModel,
            Some("insufficient_quota") => ErrorKind::QuotaExceeded,
            Some("invalid_api_key") => ErrorKind::Authentication,
            Some("rate_limit_exceeded") => ErrorKind::RateLimited,
            _ => classify_common(status, body),
        }
    }
}
