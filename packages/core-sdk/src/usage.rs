use std::sync::Arc;

use serde::Serialize;

use crate::error::{LlmError, Result};
use crate::models::{CostRates, Usage};
use crate::telemetry;

/**
 * \brief 按每千 token 费率计算费用。
 * \details 分项费率齐全时分别计费；否则按 blended 费率计总 token；都没有则为 0。
 */
pub fn compute_cost(rates: &CostRates, usage: &Usage) -> f64 {
    match (rates.input_per_1k, rates.output_per_1k) {
        (Some(input), Some(output)) => {
            (usage.input_tokens as f64 / 1000.0) * input
                + (usage.output_tokens as f64 / 1000.0) * output
        }
        _ => rates
            .blended_per_1k
            .map(|rate| (usage.total() as f64 / 1000.0) * rate)
            .unwrap_or(0.0),
    }
}

/**
 * \brief 待写入的调用日志。
 */
#[derive(Debug, Clone)]
pub struct InteractionRecord {
    pub function_name: String,
    pub provider_id: Option<i64>,
    pub model_id: Option<i64>,
    pub prompt_template_id: Option<i64>,
    pub usage: Usage,
    pub cost: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

/**
 * \brief 按模型聚合的用量。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ModelUsageSummary {
    pub model_id: Option<i64>,
    pub model_identifier: Option<String>,
    pub calls: u64,
    pub failures: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/**
 * \brief 只追加的调用日志存储。
 */
pub trait InteractionLog: Send + Sync {
    fn append(&self, record: &InteractionRecord) -> Result<i64>;
}

/**
 * \brief 调用归属信息（解析失败时部分字段为空）。
 */
#[derive(Debug, Clone, Default)]
pub struct CallScope {
    pub function_name: String,
    pub provider_id: Option<i64>,
    pub model_id: Option<i64>,
    pub prompt_template_id: Option<i64>,
    pub rates: CostRates,
}

/**
 * \brief 用量记录器：每次调用无论成败都写一条 Interaction。
 */
#[derive(Clone)]
pub struct UsageRecorder {
    log: Arc<dyn InteractionLog>,
}

impl UsageRecorder {
    pub fn new(log: Arc<dyn InteractionLog>) -> Self {
        Self { log }
    }

    /**
     * \brief 记录成功调用，返回 (interaction_id, cost)。
     */
    pub fn record_success(&self, scope: &CallScope, usage: Usage, latency_ms: u64) -> Result<(i64, f64)> {
        let cost = compute_cost(&scope.rates, &usage);
        let id = self.record(scope, usage, cost, latency_ms, None)?;
        Ok((id, cost))
    }

    /**
     * \brief 记录失败调用，用量与费用均为 0，错误信息保留原文。
     */
    pub fn record_failure(&self, scope: &CallScope, latency_ms: u64, error: &LlmError) -> Result<i64> {
        self.record(scope, Usage::default(), 0.0, latency_ms, Some(error))
    }

    fn record(
        &self,
        scope: &CallScope,
        usage: Usage,
        cost: f64,
        latency_ms: u64,
        error: Option<&LlmError>,
    ) -> Result<i64> {
        let record = InteractionRecord {
            function_name: scope.function_name.clone(),
            provider_id: scope.provider_id,
            model_id: scope.model_id,
            prompt_template_id: scope.prompt_template_id,
            usage,
            cost,
            latency_ms,
            success: error.is_none(),
            error_kind: error.map(|e| e.code().to_string()),
            error_message: error.map(failure_message),
        };
        let id = self.log.append(&record)?;
        telemetry::log_event(
            "usage.record",
            &format!(
                "interaction={} function={} model={:?} success={} in={} out={} cost={:.6} latency_ms={}",
                id,
                record.function_name,
                record.model_id,
                record.success,
                usage.input_tokens,
                usage.output_tokens,
                cost,
                latency_ms
            ),
        );
        Ok(id)
    }
}

/** \brief ProviderRejected 只保留厂商原始响应体，便于运维直接看到拒绝原因。 */
fn failure_message(error: &LlmError) -> String {
    match error {
        LlmError::ProviderRejected { body, .. } => body.clone(),
        other => other.to_string(),
    }
}
