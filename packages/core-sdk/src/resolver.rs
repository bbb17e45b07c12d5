use std::sync::Arc;

use crate::adapters::AdapterRegistry;
use crate::error::{ConfigInvariant, LlmError, Result};
use crate::models::{CallParameters, Configuration, Model, PromptTemplate, Provider};
use crate::usage::CallScope;

/**
 * \brief 配置存储的只读视图，由调用方注入。
 */
pub trait ConfigurationStore: Send + Sync {
    fn active_prompt_template(&self, name: &str) -> Result<Option<PromptTemplate>>;
    fn prompt_template(&self, id: i64) -> Result<Option<PromptTemplate>>;
    /** \brief `None` 查询默认配置；多条命中时返回最近更新的一条。 */
    fn active_configuration(&self, prompt_template_id: Option<i64>) -> Result<Option<Configuration>>;
    fn provider(&self, id: i64) -> Result<Option<Provider>>;
    fn model(&self, id: i64) -> Result<Option<Model>>;
}

/**
 * \brief 一次调用所需的完整配置。
 */
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub configuration_id: i64,
    pub provider: Provider,
    pub model: Model,
    pub prompt_template: Option<PromptTemplate>,
    pub parameters: CallParameters,
}

/**
 * \brief 配置解析器：逻辑功能名 → {Provider, Model, PromptTemplate, 参数}。
 */
#[derive(Clone)]
pub struct ConfigurationResolver {
    store: Arc<dyn ConfigurationStore>,
    registry: Arc<AdapterRegistry>,
}

impl ConfigurationResolver {
    pub fn new(store: Arc<dyn ConfigurationStore>, registry: Arc<AdapterRegistry>) -> Self {
        Self { store, registry }
    }

    pub fn resolve(&self, function_name: &str) -> Result<ResolvedCall> {
        let mut scope = CallScope::default();
        self.resolve_with_scope(function_name, &mut scope)
    }

    /**
     * \brief 按显式模板主键解析（不走名称查找），模板必须存在且处于激活状态。
     */
    pub fn resolve_template(&self, prompt_template_id: i64) -> Result<ResolvedCall> {
        let mut scope = CallScope::default();
        self.resolve_template_with_scope(prompt_template_id, &mut scope)
    }

    pub fn resolve_template_with_scope(
        &self,
        prompt_template_id: i64,
        scope: &mut CallScope,
    ) -> Result<ResolvedCall> {
        let template = self.store.prompt_template(prompt_template_id)?.ok_or(
            LlmError::ConfigurationInvalid(ConfigInvariant::TemplateMissing {
                template_id: prompt_template_id,
            }),
        )?;
        scope.prompt_template_id = Some(template.id);
        if !template.is_active {
            return Err(LlmError::ConfigurationInvalid(
                ConfigInvariant::TemplateInactive {
                    template: template.name,
                    version: template.version,
                },
            ));
        }
        let label = template.name.clone();
        self.finish(&label, Some(template), scope)
    }

    /**
     * \brief 解析并在过程中填充调用归属，解析失败时调用方仍可据此记录日志。
     */
    pub fn resolve_with_scope(&self, function_name: &str, scope: &mut CallScope) -> Result<ResolvedCall> {
        let template = self.store.active_prompt_template(function_name)?;
        self.finish(function_name, template, scope)
    }

    fn finish(
        &self,
        function_name: &str,
        template: Option<PromptTemplate>,
        scope: &mut CallScope,
    ) -> Result<ResolvedCall> {
        scope.prompt_template_id = template.as_ref().map(|t| t.id);

        let bound = match &template {
            Some(t) => self.store.active_configuration(Some(t.id))?,
            None => None,
        };
        let configuration = match bound {
            Some(c) => c,
            None => self
                .store
                .active_configuration(None)?
                .ok_or_else(|| LlmError::NoConfigurationAvailable(function_name.to_string()))?,
        };
        scope.provider_id = Some(configuration.provider_id);
        scope.model_id = Some(configuration.model_id);

        let (provider, model) = self.validate(&configuration)?;
        scope.rates = model.rates;

        tracing::debug!(
            function = function_name,
            configuration = configuration.id,
            provider = %provider.name,
            model = %model.model_identifier,
            "configuration resolved"
        );
        Ok(ResolvedCall {
            configuration_id: configuration.id,
            provider,
            model,
            prompt_template: template,
            parameters: configuration.parameters,
        })
    }

    fn validate(&self, configuration: &Configuration) -> Result<(Provider, Model)> {
        let invalid = |inv: ConfigInvariant| LlmError::ConfigurationInvalid(inv);

        let provider = self
            .store
            .provider(configuration.provider_id)?
            .ok_or_else(|| {
                invalid(ConfigInvariant::ProviderMissing {
                    provider_id: configuration.provider_id,
                })
            })?;
        if !provider.is_active {
            return Err(invalid(ConfigInvariant::ProviderInactive {
                provider: provider.name,
            }));
        }
        if !provider.has_credential() {
            return Err(invalid(ConfigInvariant::ProviderWithoutCredential {
                provider: provider.name,
            }));
        }

        let model = self.store.model(configuration.model_id)?.ok_or_else(|| {
            invalid(ConfigInvariant::ModelMissing {
                model_id: configuration.model_id,
            })
        })?;
        if !model.is_active {
            return Err(invalid(ConfigInvariant::ModelInactive { model: model.name }));
        }
        if model.provider_id != provider.id {
            return Err(invalid(ConfigInvariant::ModelProviderMismatch {
                model: model.name,
                provider: provider.name,
            }));
        }
        if model.model_identifier.trim().is_empty() {
            return Err(invalid(ConfigInvariant::BlankModelIdentifier { model: model.name }));
        }
        if self.registry.get(&provider.kind).is_none() {
            return Err(invalid(ConfigInvariant::NoAdapterRegistered {
                kind: provider.kind.clone(),
                provider: provider.name,
            }));
        }
        Ok((provider, model))
    }
}
