/*!
 * \brief 调用编排
 * \details `call_llm` 串起整个流程：解析配置 → 渲染模板 → 解密凭据 → 发送请求 → 记录用量。
 * 任一环节失败都会先写入一条失败的 Interaction，再把错误原样返回给调用方。
 */

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::adapters::AdapterRegistry;
use crate::config::Settings;
use crate::db::{self, Store};
use crate::error::{ConfigInvariant, LlmError, Result};
use crate::executor::{ExecutorConfig, RequestExecutor};
use crate::models::{CallRequest, CallResponse, Message, NormalizedRequest, NormalizedResult};
use crate::prompt::{self, PlaceholderPolicy};
use crate::resolver::{ConfigurationResolver, ResolvedCall};
use crate::telemetry;
use crate::usage::{compute_cost, CallScope, UsageRecorder};
use crate::vault::CredentialVault;

/** \brief 成功调用未能写入日志时返回的 interaction_id。 */
pub const UNRECORDED_INTERACTION: i64 = 0;

/**
 * \brief 单次调用所处阶段；重试发生在 Dispatching 内部，不单独体现。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Resolving,
    Rendering,
    Dispatching,
    Succeeded,
    Failed,
    Recorded,
}

impl CallPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Resolving => "resolving",
            CallPhase::Rendering => "rendering",
            CallPhase::Dispatching => "dispatching",
            CallPhase::Succeeded => "succeeded",
            CallPhase::Failed => "failed",
            CallPhase::Recorded => "recorded",
        }
    }

    /** \brief 合法的下一阶段。 */
    pub fn can_advance_to(&self, next: CallPhase) -> bool {
        use CallPhase::*;
        matches!(
            (self, next),
            (Resolving, Rendering)
                | (Rendering, Dispatching)
                | (Dispatching, Succeeded)
                | (Resolving | Rendering | Dispatching, Failed)
                | (Succeeded | Failed, Recorded)
        )
    }
}

/**
 * \brief 服务参数。
 */
#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    pub timeout: Duration,
    pub executor: ExecutorConfig,
    pub placeholder_policy: PlaceholderPolicy,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            executor: ExecutorConfig::default(),
            placeholder_policy: PlaceholderPolicy::default(),
        }
    }
}

impl From<&Settings> for ServiceOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            timeout: settings.http_timeout,
            executor: ExecutorConfig {
                max_retries: settings.max_retries,
                ..ExecutorConfig::default()
            },
            placeholder_policy: settings.placeholder_policy,
        }
    }
}

/**
 * \brief 凭据批量升级结果。
 */
#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationReport {
    pub upgraded: Vec<String>,
    pub unchanged: usize,
    pub failed: Vec<String>,
}

/**
 * \brief 已登记模型标识与厂商实际可用列表的比对结果。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ModelCheck {
    pub model_id: i64,
    pub model_identifier: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelVerification {
    pub provider: String,
    pub available: Vec<String>,
    pub models: Vec<ModelCheck>,
}

/** \brief 一次调用在各阶段积累的结果。 */
struct Dispatched {
    resolved: ResolvedCall,
    result: NormalizedResult,
    latency_ms: u64,
}

struct Failure {
    error: LlmError,
    latency_ms: u64,
}

impl From<LlmError> for Failure {
    fn from(error: LlmError) -> Self {
        Self {
            error,
            latency_ms: 0,
        }
    }
}

/**
 * \brief LLM 编排服务，调用方唯一入口。
 */
pub struct LlmService {
    store: Arc<Store>,
    resolver: ConfigurationResolver,
    vault: Arc<CredentialVault>,
    registry: Arc<AdapterRegistry>,
    executor: RequestExecutor,
    recorder: UsageRecorder,
    options: ServiceOptions,
}

impl LlmService {
    /**
     * \brief 按进程设置打开数据库并构造服务。
     */
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let store = Arc::new(Store::open(&settings.db_path)?);
        let vault = CredentialVault::new(&settings.credential_secret);
        Self::new(store, vault, ServiceOptions::from(settings))
    }

    pub fn new(store: Arc<Store>, vault: CredentialVault, options: ServiceOptions) -> Result<Self> {
        Self::with_registry(store, vault, AdapterRegistry::with_defaults(), options)
    }

    pub fn with_registry(
        store: Arc<Store>,
        vault: CredentialVault,
        registry: AdapterRegistry,
        options: ServiceOptions,
    ) -> Result<Self> {
        let registry = Arc::new(registry);
        Ok(Self {
            resolver: ConfigurationResolver::new(store.clone(), registry.clone()),
            recorder: UsageRecorder::new(store.clone()),
            executor: RequestExecutor::new(options.executor)?,
            vault: Arc::new(vault),
            registry,
            store,
            options,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    /**
     * \brief 发起一次 LLM 调用。
     * \details 成功与失败都恰好写入一条 Interaction。写日志失败时：调用失败则返回调用本身的错误；
     * 调用成功则仍返回结果，`interaction_id` 为 0（不对应任何记录）。
     */
    pub async fn call_llm(&self, request: CallRequest) -> Result<CallResponse> {
        let mut scope = CallScope {
            function_name: request.function_name.clone(),
            ..CallScope::default()
        };
        let mut phase = CallPhase::Resolving;

        match self.run(&request, &mut scope, &mut phase).await {
            Ok(done) => {
                advance(&scope, &mut phase, CallPhase::Succeeded);
                let usage = done.result.usage;
                let (interaction_id, cost) =
                    match self.recorder.record_success(&scope, usage, done.latency_ms) {
                        Ok(recorded) => {
                            advance(&scope, &mut phase, CallPhase::Recorded);
                            recorded
                        }
                        Err(e) => {
                            telemetry::log_error(
                                "llm.record",
                                &format!("function={} error={}", scope.function_name, e),
                            );
                            (UNRECORDED_INTERACTION, compute_cost(&scope.rates, &usage))
                        }
                    };
                Ok(CallResponse {
                    content: done.result.content,
                    usage,
                    provider: done.resolved.provider.name,
                    model: done.resolved.model.model_identifier,
                    cost,
                    latency_ms: done.latency_ms,
                    interaction_id,
                })
            }
            Err(failure) => {
                advance(&scope, &mut phase, CallPhase::Failed);
                telemetry::log_error(
                    "llm.call",
                    &format!(
                        "function={} kind={} error={}",
                        scope.function_name,
                        failure.error.code(),
                        failure.error
                    ),
                );
                match self
                    .recorder
                    .record_failure(&scope, failure.latency_ms, &failure.error)
                {
                    Ok(_) => advance(&scope, &mut phase, CallPhase::Recorded),
                    Err(e) => telemetry::log_error("llm.record", &e.to_string()),
                }
                Err(failure.error)
            }
        }
    }

    async fn run(
        &self,
        request: &CallRequest,
        scope: &mut CallScope,
        phase: &mut CallPhase,
    ) -> std::result::Result<Dispatched, Failure> {
        let resolved = match request.prompt_template_id {
            Some(id) => self.resolver.resolve_template_with_scope(id, scope)?,
            None => self
                .resolver
                .resolve_with_scope(&request.function_name, scope)?,
        };

        advance(scope, phase, CallPhase::Rendering);
        let system_prompt = match &resolved.prompt_template {
            Some(t) => Some(prompt::render_checked(
                &t.body,
                &request.variables,
                self.options.placeholder_policy,
            )?),
            None => None,
        };
        let messages = compose_messages(system_prompt, &request.messages);

        let api_key = self.vault.reveal(&resolved.provider.credential_blob)?;
        let adapter = self.registry.get(&resolved.provider.kind).ok_or_else(|| {
            LlmError::ConfigurationInvalid(ConfigInvariant::NoAdapterRegistered {
                provider: resolved.provider.name.clone(),
                kind: resolved.provider.kind.clone(),
            })
        })?;
        let normalized = NormalizedRequest {
            model: resolved.model.model_identifier.clone(),
            messages,
            temperature: request.temperature.or(resolved.parameters.temperature),
            max_tokens: request.max_tokens.or(resolved.parameters.max_tokens),
        };

        advance(scope, phase, CallPhase::Dispatching);
        let dispatch = self
            .executor
            .execute(
                adapter.as_ref(),
                &resolved.provider,
                &api_key,
                &normalized,
                self.options.timeout,
            )
            .await;
        match dispatch.result {
            Ok(result) => Ok(Dispatched {
                resolved,
                result,
                latency_ms: dispatch.latency_ms,
            }),
            Err(error) => Err(Failure {
                error,
                latency_ms: dispatch.latency_ms,
            }),
        }
    }

    /**
     * \brief 加密并保存 Provider 的 API Key。
     */
    pub fn store_credential(&self, provider_id: i64, api_key: &str) -> Result<()> {
        let exists = self
            .store
            .with_conn(|c| db::get_provider_by_id(c, provider_id))?
            .is_some();
        if !exists {
            return Err(LlmError::ConfigurationInvalid(ConfigInvariant::ProviderMissing {
                provider_id,
            }));
        }
        let blob = self.vault.store(provider_id, api_key.trim())?;
        self.store
            .with_conn(|c| db::set_provider_credential(c, provider_id, &blob))?;
        telemetry::log_event("vault.store", &format!("provider_id={}", provider_id));
        Ok(())
    }

    /**
     * \brief 把明文或旧方案的凭据重新加密为当前方案。
     */
    pub fn rotate_credentials(&self) -> Result<RotationReport> {
        let providers = self.store.with_conn(db::list_providers)?;
        let mut report = RotationReport::default();
        for provider in providers {
            if !CredentialVault::needs_upgrade(&provider.credential_blob) {
                report.unchanged += 1;
                continue;
            }
            let resealed = self
                .vault
                .reveal(&provider.credential_blob)
                .and_then(|plain| self.vault.store(provider.id, &plain));
            match resealed {
                Ok(blob) => {
                    self.store
                        .with_conn(|c| db::set_provider_credential(c, provider.id, &blob))?;
                    report.upgraded.push(provider.name);
                }
                Err(e) => {
                    telemetry::log_error(
                        "vault.rotate",
                        &format!("provider={} error={}", provider.name, e),
                    );
                    report.failed.push(provider.name);
                }
            }
        }
        telemetry::log_event(
            "vault.rotate",
            &format!(
                "upgraded={} unchanged={} failed={}",
                report.upgraded.len(),
                report.unchanged,
                report.failed.len()
            ),
        );
        Ok(report)
    }

    /**
     * \brief 拉取厂商模型列表，并核对已登记的模型标识是否仍然可用。
     */
    pub async fn verify_models(&self, provider_id: i64) -> Result<ModelVerification> {
        let (provider, models) = self.store.with_conn(|c| {
            let provider = db::get_provider_by_id(c, provider_id)?;
            let models = db::list_models_for_provider(c, provider_id)?;
            Ok((provider, models))
        })?;
        let provider = provider.ok_or(LlmError::ConfigurationInvalid(
            ConfigInvariant::ProviderMissing { provider_id },
        ))?;
        if !provider.has_credential() {
            return Err(LlmError::ConfigurationInvalid(
                ConfigInvariant::ProviderWithoutCredential {
                    provider: provider.name,
                },
            ));
        }
        let adapter = self.registry.get(&provider.kind).ok_or_else(|| {
            LlmError::ConfigurationInvalid(ConfigInvariant::NoAdapterRegistered {
                provider: provider.name.clone(),
                kind: provider.kind.clone(),
            })
        })?;
        let api_key = self.vault.reveal(&provider.credential_blob)?;
        let available = self
            .executor
            .list_models(adapter.as_ref(), &provider, &api_key, self.options.timeout)
            .await?;

        let models = models
            .into_iter()
            .map(|m| ModelCheck {
                available: available.iter().any(|id| id == &m.model_identifier),
                model_id: m.id,
                model_identifier: m.model_identifier,
            })
            .collect();
        Ok(ModelVerification {
            provider: provider.name,
            available,
            models,
        })
    }
}

/**
 * \brief 推进调用阶段；非法跳转视为编排逻辑错误。
 */
fn advance(scope: &CallScope, phase: &mut CallPhase, next: CallPhase) {
    debug_assert!(
        phase.can_advance_to(next),
        "illegal call phase transition {:?} -> {:?}",
        phase,
        next
    );
    tracing::debug!(
        function = %scope.function_name,
        from = phase.as_str(),
        to = next.as_str(),
        "call phase"
    );
    *phase = next;
}

/**
 * \brief 渲染后的模板作为首条 system 消息，调用方消息按原顺序跟随。
 */
fn compose_messages(system_prompt: Option<String>, caller: &[Message]) -> Vec<Message> {
    let mut messages = Vec::with_capacity(caller.len() + 1);
    if let Some(text) = system_prompt.filter(|t| !t.trim().is_empty()) {
        messages.push(Message::system(text));
    }
    messages.extend(caller.iter().cloned());
    messages
}
