use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/**
 * \brief 上游 LLM 厂商记录。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    /** \brief 自增主键 */
    pub id: i64,
    /** \brief 唯一名称 */
    pub name: String,
    /** \brief 适配器注册表中的键，如 anthropic / openai */
    pub kind: String,
    /** \brief API 基地址 */
    pub base_url: String,
    pub is_active: bool,
    /** \brief 加密后的 API Key，序列化时不输出 */
    #[serde(skip_serializing)]
    pub credential_blob: String,
    /** \brief 同时在途请求上限（为空则不限） */
    pub max_concurrency: Option<u32>,
}

impl Provider {
    pub fn has_credential(&self) -> bool {
        !self.credential_blob.trim().is_empty()
    }
}

/**
 * \brief 每千 token 的计费费率。
 * \details 同时存在 input/output 时按分项计费，否则退化为 blended。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostRates {
    pub input_per_1k: Option<f64>,
    pub output_per_1k: Option<f64>,
    pub blended_per_1k: Option<f64>,
}

/**
 * \brief 厂商托管的具体模型。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: i64,
    pub provider_id: i64,
    /** \brief 展示名称 */
    pub name: String,
    /** \brief 线上请求使用的模型标识 */
    pub model_identifier: String,
    pub is_active: bool,
    pub rates: CostRates,
}

/**
 * \brief 带版本的提示词模板。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub is_active: bool,
    pub body: String,
}

/**
 * \brief 调用参数。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CallParameters {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/**
 * \brief 逻辑功能与 {Provider, Model, 参数} 的绑定。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    pub id: i64,
    pub provider_id: i64,
    pub model_id: i64,
    /** \brief 为空表示默认配置 */
    pub prompt_template_id: Option<i64>,
    pub is_active: bool,
    pub parameters: CallParameters,
    /** \brief 毫秒时间戳，用于多条命中时取最新 */
    pub updated_at: i64,
}

/**
 * \brief 调用日志，写入后不可修改。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: i64,
    pub function_name: String,
    pub provider_id: Option<i64>,
    pub model_id: Option<i64>,
    pub prompt_template_id: Option<i64>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: Role,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/**
 * \brief 与厂商无关的请求形态。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/**
 * \brief 与厂商无关的响应形态。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedResult {
    pub content: String,
    pub usage: Usage,
}

/**
 * \brief 调用方入参（callLLM）。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallRequest {
    pub function_name: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    /** \brief 模板占位符取值 */
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /** \brief 固定使用某个模板版本；缺省时按 function_name 查找激活版本 */
    #[serde(default)]
    pub prompt_template_id: Option<i64>,
}

/**
 * \brief 调用方出参。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallResponse {
    pub content: String,
    pub usage: Usage,
    pub provider: String,
    pub model: String,
    pub cost: f64,
    pub latency_ms: u64,
    pub interaction_id: i64,
}
