use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::adapters::{auth_scheme_for, AuthScheme, ProviderAdapter, WireRequest};
use crate::error::{ConfigInvariant, LlmError, Result};
use crate::models::{NormalizedRequest, NormalizedResult, Provider};
use crate::telemetry;

/**
 * \brief 执行器参数。
 */
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /** \brief 网络层失败（连接重置、超时）的最大重试次数 */
    pub max_retries: u32,
    /** \brief 首次重试前的等待时间，之后按 2 倍递增 */
    pub backoff_base: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff_base: Duration::from_millis(250),
        }
    }
}

/**
 * \brief 一次 Dispatching 的结果；重试对外只体现为一组延迟/结果。
 */
#[derive(Debug)]
pub struct Dispatch {
    pub result: Result<NormalizedResult>,
    pub latency_ms: u64,
    pub attempts: u32,
}

/**
 * \brief 请求执行器：持有 HTTP 客户端，负责超时、重试与错误分类。
 */
pub struct RequestExecutor {
    client: reqwest::Client,
    config: ExecutorConfig,
    limits: Mutex<HashMap<i64, (u32, Arc<Semaphore>)>>,
}

impl RequestExecutor {
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| LlmError::TransportError(e.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: ExecutorConfig) -> Self {
        Self {
            client,
            config,
            limits: Mutex::new(HashMap::new()),
        }
    }

    /**
     * \brief 发送请求并解析结果。
     * \param timeout 单次尝试的截止时间，超时会丢弃在途请求。
     */
    pub async fn execute(
        &self,
        adapter: &dyn ProviderAdapter,
        provider: &Provider,
        api_key: &str,
        request: &NormalizedRequest,
        timeout: Duration,
    ) -> Dispatch {
        let scheme = match scheme_for(adapter, provider) {
            Ok(s) => s,
            Err(e) => {
                return Dispatch {
                    result: Err(e),
                    latency_ms: 0,
                    attempts: 0,
                }
            }
        };
        let wire = adapter.build_request(request);
        let url = format!("{}{}", provider.base_url.trim_end_matches('/'), wire.path);

        let started = Instant::now();
        let _permit = match self.acquire(provider, timeout).await {
            Ok(permit) => permit,
            Err(e) => {
                tracing::warn!(provider = %provider.name, "no concurrency slot before deadline");
                return Dispatch {
                    result: Err(e),
                    latency_ms: started.elapsed().as_millis() as u64,
                    attempts: 0,
                };
            }
        };
        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let outcome = self
                .attempt(adapter, scheme, &url, api_key, &wire, timeout)
                .await;
            match outcome {
                Err(err) if err.is_retryable() && attempts <= self.config.max_retries => {
                    let wait = self.config.backoff_base * 2u32.saturating_pow(attempts - 1);
                    tracing::warn!(
                        provider = %provider.name,
                        attempt = attempts,
                        error = %err,
                        "retrying after network failure"
                    );
                    tokio::time::sleep(wait).await;
                }
                other => break other,
            }
        };

        Dispatch {
            result,
            latency_ms: started.elapsed().as_millis() as u64,
            attempts,
        }
    }

    async fn attempt(
        &self,
        adapter: &dyn ProviderAdapter,
        scheme: &AuthScheme,
        url: &str,
        api_key: &str,
        wire: &WireRequest,
        timeout: Duration,
    ) -> Result<NormalizedResult> {
        let timeout_ms = timeout.as_millis() as u64;
        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(scheme.header, scheme.header_value(api_key));
        for (name, value) in &wire.headers {
            builder = builder.header(*name, value.as_str());
        }
        let call = async {
            let resp = builder
                .json(&wire.body)
                .send()
                .await
                .map_err(|e| map_reqwest(e, timeout_ms))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|e| map_reqwest(e, timeout_ms))?;
            if !status.is_success() {
                let kind = adapter.classify_error(status.as_u16(), &text);
                telemetry::log_error(
                    "executor.rejected",
                    &format!("{} -> {} ({}): {}", url, status, kind, text),
                );
                return Err(LlmError::ProviderRejected {
                    status: status.as_u16(),
                    kind,
                    body: text,
                });
            }
            let v: Value = serde_json::from_str(&text)
                .map_err(|e| LlmError::MalformedResponse(format!("{}: {}", e, text)))?;
            adapter.parse_response(&v)
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(timeout_ms)),
        }
    }

    /**
     * \brief 列出厂商当前接受的模型标识，用于排查过期标识。
     */
    pub async fn list_models(
        &self,
        adapter: &dyn ProviderAdapter,
        provider: &Provider,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let scheme = scheme_for(adapter, provider)?;
        let timeout_ms = timeout.as_millis() as u64;
        let url = format!(
            "{}{}",
            provider.base_url.trim_end_matches('/'),
            adapter.models_path()
        );
        let mut builder = self
            .client
            .get(&url)
            .header(scheme.header, scheme.header_value(api_key));
        for (name, value) in adapter.extra_headers() {
            builder = builder.header(name, value);
        }
        let call = async {
            let resp = builder.send().await.map_err(|e| map_reqwest(e, timeout_ms))?;
            let status = resp.status();
            let text = resp.text().await.map_err(|e| map_reqwest(e, timeout_ms))?;
            if !status.is_success() {
                return Err(LlmError::ProviderRejected {
                    status: status.as_u16(),
                    kind: adapter.classify_error(status.as_u16(), &text),
                    body: text,
                });
            }
            let v: Value = serde_json::from_str(&text)
                .map_err(|e| LlmError::MalformedResponse(format!("{}: {}", e, text)))?;
            adapter.parse_model_list(&v)
        };
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(timeout_ms)),
        }
    }

    /**
     * \brief 按 Provider.max_concurrency 限制同一厂商的在途请求数。
     * \details 排队等待与单次尝试共用同一个截止时间；未设上限时不排队。
     */
    async fn acquire(&self, provider: &Provider, timeout: Duration) -> Result<Option<OwnedSemaphorePermit>> {
        let Some(semaphore) = self.semaphore_for(provider) else {
            return Ok(None);
        };
        match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(permit) => Ok(permit.ok()),
            Err(_) => Err(LlmError::Timeout(timeout.as_millis() as u64)),
        }
    }

    /** \brief 上限变化时原地调整许可数，在途请求仍计入同一个信号量。 */
    fn semaphore_for(&self, provider: &Provider) -> Option<Arc<Semaphore>> {
        let limit = provider.max_concurrency.filter(|n| *n > 0)?;
        let mut limits = self.limits.lock().ok()?;
        let entry = limits
            .entry(provider.id)
            .or_insert_with(|| (limit, Arc::new(Semaphore::new(limit as usize))));
        if entry.0 != limit {
            resize(&entry.1, entry.0, limit);
            entry.0 = limit;
        }
        Some(entry.1.clone())
    }
}

/**
 * \brief 扩容直接补许可；缩容先收回空闲许可，不足部分等在途请求归还后再收回。
 */
fn resize(semaphore: &Arc<Semaphore>, from: u32, to: u32) {
    if to > from {
        semaphore.add_permits((to - from) as usize);
        return;
    }
    let shrink = (from - to) as usize;
    let debt = shrink - semaphore.forget_permits(shrink);
    if debt > 0 {
        let semaphore = semaphore.clone();
        tokio::spawn(async move {
            if let Ok(permits) = semaphore.acquire_many_owned(debt as u32).await {
                permits.forget();
            }
        });
    }
}

fn scheme_for(adapter: &dyn ProviderAdapter, provider: &Provider) -> Result<&'static AuthScheme> {
    auth_scheme_for(adapter.kind()).ok_or_else(|| {
        LlmError::ConfigurationInvalid(ConfigInvariant::NoAdapterRegistered {
            provider: provider.name.clone(),
            kind: adapter.kind().to_string(),
        })
    })
}

fn map_reqwest(err: reqwest::Error, timeout_ms: u64) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(timeout_ms)
    } else {
        LlmError::TransportError(err.to_string())
    }
}
