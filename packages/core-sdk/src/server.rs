use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::LlmError;
use crate::llm::{LlmService, ModelVerification};
use crate::models::{CallRequest, CallResponse, Interaction};
use crate::usage::ModelUsageSummary;
use crate::{db, telemetry};

type ApiError = (StatusCode, String);

/**
 * \brief 构造路由，便于测试直接驱动。
 */
pub fn router(service: Arc<LlmService>) -> Router {
    Router::new()
        .route("/api/llm/call", post(call_llm))
        .route("/api/interactions", get(list_interactions))
        .route("/api/usage/summary", get(usage_summary))
        .route("/api/providers/{id}/credential", put(set_credential))
        .route("/api/providers/{id}/models", get(verify_models))
        .route("/api/health", get(health_check))
        .with_state(service)
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:8787"
 */
pub async fn run(addr: &str, service: Arc<LlmService>) -> Result<()> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Deserialize, Debug)]
struct InteractionQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize, Debug)]
struct CredentialInput {
    api_key: String,
}

/**
 * \brief 调用方入口：执行一次编排调用。
 */
async fn call_llm(
    State(service): State<Arc<LlmService>>,
    Json(payload): Json<CallRequest>,
) -> Result<Json<CallResponse>, ApiError> {
    if payload.function_name.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "function_name is required".to_string()));
    }
    let response = service.call_llm(payload).await.map_err(llm_err)?;
    Ok(Json(response))
}

/**
 * \brief 最近的调用日志，默认 50 条，最多 500 条。
 */
async fn list_interactions(
    State(service): State<Arc<LlmService>>,
    Query(q): Query<InteractionQuery>,
) -> Result<Json<Vec<Interaction>>, ApiError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let rows = service
        .store()
        .with_conn(|c| db::list_interactions(c, limit))
        .map_err(internal_err)?;
    Ok(Json(rows))
}

async fn usage_summary(
    State(service): State<Arc<LlmService>>,
) -> Result<Json<Vec<ModelUsageSummary>>, ApiError> {
    let rows = service
        .store()
        .with_conn(db::usage_summary)
        .map_err(internal_err)?;
    Ok(Json(rows))
}

/**
 * \brief 更新 Provider 凭据；明文只在请求体中出现，落库前加密。
 */
async fn set_credential(
    State(service): State<Arc<LlmService>>,
    Path(id): Path<i64>,
    Json(payload): Json<CredentialInput>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if payload.api_key.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "api_key is required".to_string()));
    }
    service
        .store_credential(id, &payload.api_key)
        .map_err(llm_err)?;
    telemetry::log_event("server.credential", &format!("provider_id={}", id));
    Ok(Json(json!({"ok": true, "provider_id": id})))
}

async fn verify_models(
    State(service): State<Arc<LlmService>>,
    Path(id): Path<i64>,
) -> Result<Json<ModelVerification>, ApiError> {
    let report = service.verify_models(id).await.map_err(llm_err)?;
    Ok(Json(report))
}

/**
 * \brief 健康检查：确认数据库可读并汇报 Provider 数量。
 */
async fn health_check(
    State(service): State<Arc<LlmService>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (providers, telemetry_enabled) = service
        .store()
        .with_conn(|c| {
            let providers = db::list_providers(c)?;
            let enabled = db::get_telemetry_enabled(c)?;
            Ok((providers, enabled))
        })
        .map_err(internal_err)?;
    let ready = providers
        .iter()
        .filter(|p| p.is_active && p.has_credential())
        .count();
    Ok(Json(json!({
        "ok": true,
        "providers": providers.len(),
        "ready_providers": ready,
        "telemetry_enabled": telemetry_enabled
    })))
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/** \brief 错误类别映射为状态码，正文为 `{"error": code, "message": ..}`。 */
fn llm_err(e: LlmError) -> ApiError {
    let status = match &e {
        LlmError::NoConfigurationAvailable(_) => StatusCode::NOT_FOUND,
        LlmError::ConfigurationInvalid(_) | LlmError::UnresolvedPlaceholders(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        LlmError::ProviderRejected { .. }
        | LlmError::TransportError(_)
        | LlmError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
        LlmError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        LlmError::DecryptionFailed | LlmError::MissingSecret(_) | LlmError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let body = json!({"error": e.code(), "message": e.to_string()});
    (status, body.to_string())
}
