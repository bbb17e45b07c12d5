use serde_json::{json, Value};

use super::{classify_common, token_count, ProviderAdapter, WireRequest};
use crate::error::{ErrorKind, LlmError, Result};
use crate::models::{Message, NormalizedRequest, NormalizedResult, Role, Usage};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/**
 * \brief Anthropic Messages API：system 独立为顶层字段，messages 只含 user/assistant。
 */
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    pub default_max_tokens: u32,
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self {
            default_max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn kind(&self) -> &'static str {
        "anthropic"
    }

    fn build_request(&self, request: &NormalizedRequest) -> WireRequest {
        let (system_prompt, payload_messages) = anthropic_payload(&request.messages);

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens.unwrap_or(self.default_max_tokens),
            "messages": payload_messages,
        });
        if let Some(sys) = system_prompt {
            body["system"] = json!(sys);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }

        WireRequest {
            path: "/v1/messages",
            body,
            headers: self.extra_headers(),
        }
    }

    fn extra_headers(&self) -> Vec<(&'static str, String)> {
        vec![("anthropic-version", ANTHROPIC_VERSION.to_string())]
    }

    fn parse_response(&self, v: &Value) -> Result<NormalizedResult> {
        let blocks = v.get("content").and_then(|arr| arr.as_array()).ok_or_else(|| {
            LlmError::MalformedResponse(format!("missing content array: {}", v))
        })?;
        let content = blocks
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("");
        let usage = v.get("usage");
        Ok(NormalizedResult {
            content,
            usage: Usage {
                input_tokens: token_count(usage.and_then(|u| u.get("input_tokens"))),
                output_tokens: token_count(usage.and_then(|u| u.get("output_tokens"))),
            },
        })
    }

    fn classify_error(&self, status: u16, body: &str) -> ErrorKind {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        let error_type = parsed
            .as_ref()
            .and_then(|v| v.get("error"))
            .and_then(|e| e.get("type"))
            .and_then(|t| t.as_str());
        match error_type {
            Some("not_found_error") => ErrorKind::InvalidModel,
            Some("authentication_error") | Some("permission_error") => ErrorKind::Authentication,
            Some("rate_limit_error") => ErrorKind::RateLimited,
            Some("overloaded_error") => ErrorKind::Overloaded,
            Some("api_error") => ErrorKind::ServerError,
            _ => classify_common(status, body),
        }
    }
}

/** \brief 多条 system 消息以空行拼接；其余消息按原顺序转为文本块。 */
fn anthropic_payload(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_parts = Vec::new();
    let mut items = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => system_parts.push(msg.content.clone()),
            Role::User | Role::Assistant => items.push(json!({
                "role": msg.role.as_str(),
                "content": [{"type": "text", "text": msg.content}]
            })),
        }
    }
    let system_prompt = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system_prompt, items)
}
