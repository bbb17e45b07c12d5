use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use debate_core_sdk::config::Settings;
use debate_core_sdk::models::{CallParameters, CallRequest, CostRates, Message};
use debate_core_sdk::{db, server, telemetry, LlmService};

/**
 * \brief 辩论应用 LLM 编排层的运维命令行。
 */
#[derive(Parser, Debug)]
#[command(name = "debate", version, about = "Debate LLM orchestration admin")]
struct Cli {
    /** \brief 日志详细程度（-v info, -vv debug, -vvv trace） */
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /** \brief 覆盖 DEBATE_DB_PATH */
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 创建数据库表并设置文件日志开关。
     */
    Init {
        #[arg(long, default_value_t = false)]
        enable_telemetry: bool,
    },

    #[command(subcommand)]
    Provider(ProviderCommand),

    #[command(subcommand)]
    Model(ModelCommand),

    #[command(subcommand)]
    Template(TemplateCommand),

    #[command(subcommand)]
    Config(ConfigCommand),

    /**
     * \brief 加密保存 Provider 的 API Key。
     */
    SetKey {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        api_key: String,
    },

    /**
     * \brief 把明文与旧方案凭据重新加密为当前方案。
     */
    RotateCredentials,

    /**
     * \brief 按功能名发起一次调用。
     */
    Call {
        #[arg(long)]
        function: String,
        /** \brief 用户消息，可重复 */
        #[arg(long = "message", short = 'm')]
        messages: Vec<String>,
        /** \brief 模板变量 KEY=VALUE，可重复 */
        #[arg(long = "var")]
        vars: Vec<String>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
        /** \brief 固定使用某个模板版本（必须处于激活状态） */
        #[arg(long)]
        template_id: Option<i64>,
    },

    /**
     * \brief 核对已登记的模型标识是否仍被厂商接受。
     */
    VerifyModels {
        #[arg(long)]
        provider: String,
    },

    /**
     * \brief 按模型汇总用量，并列出最近的调用。
     */
    Usage {
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },

    /**
     * \brief 启动本地 HTTP 服务。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:8787")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum ProviderCommand {
    Add {
        #[arg(long)]
        name: String,
        /** \brief 适配器类型，缺省与名称相同 */
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        max_concurrency: Option<u32>,
        #[arg(long)]
        api_key: Option<String>,
    },
    List,
}

#[derive(Subcommand, Debug)]
enum ModelCommand {
    Add {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        identifier: String,
        #[command(flatten)]
        rates: RateArgs,
    },
}

#[derive(Args, Debug)]
struct RateArgs {
    /** \brief 每千输入 token 费用 */
    #[arg(long)]
    input_rate: Option<f64>,
    #[arg(long)]
    output_rate: Option<f64>,
    #[arg(long)]
    blended_rate: Option<f64>,
}

#[derive(Subcommand, Debug)]
enum TemplateCommand {
    Add {
        #[arg(long)]
        name: String,
        #[command(flatten)]
        body: BodyArgs,
    },
    /**
     * \brief 修改模板内容，生成新版本并把激活配置迁移过去。
     */
    Edit {
        #[arg(long)]
        id: i64,
        #[command(flatten)]
        body: BodyArgs,
    },
}

#[derive(Args, Debug)]
struct BodyArgs {
    #[arg(long, conflicts_with = "file")]
    body: Option<String>,
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Add {
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model_id: i64,
        /** \brief 绑定的模板主键；省略则为默认配置 */
        #[arg(long)]
        template_id: Option<i64>,
        #[arg(long)]
        temperature: Option<f32>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    List,
}

fn verbosity_filter(verbose: u8) -> EnvFilter {
    match verbose {
        0 => EnvFilter::new("warn"),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    }
}

fn init_tracing(verbose: u8) {
    tracing_subscriber::fmt()
        .with_env_filter(verbosity_filter(verbose))
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut settings = Settings::from_env().context("load settings failed")?;
    if let Some(path) = cli.db {
        settings.db_path = path;
    }
    tracing::debug!(
        db = %settings.db_path.display(),
        timeout_ms = settings.http_timeout.as_millis() as u64,
        max_retries = settings.max_retries,
        "settings loaded"
    );
    let service = LlmService::from_settings(&settings).context("open database failed")?;
    let store = service.store().clone();
    let telemetry_enabled = store.with_conn(db::get_telemetry_enabled).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    match cli.command {
        Commands::Init { enable_telemetry } => {
            store
                .with_conn(|c| db::set_telemetry_enabled(c, enable_telemetry))
                .context("save telemetry failed")?;
            telemetry::set_enabled(enable_telemetry);
            println!(
                "Initialized {} (telemetry={})",
                settings.db_path.display(),
                enable_telemetry
            );
        }
        Commands::Provider(ProviderCommand::Add {
            name,
            kind,
            base_url,
            max_concurrency,
            api_key,
        }) => {
            let kind = kind.unwrap_or_else(|| name.to_ascii_lowercase());
            let provider_id = store
                .with_conn(|c| db::insert_provider(c, &name, &kind, &base_url, max_concurrency))
                .context("save provider failed")?;
            if let Some(key) = api_key {
                service
                    .store_credential(provider_id, &key)
                    .context("save credential failed")?;
            }
            println!("Saved provider id={} (name={} | {} | {})", provider_id, name, kind, base_url);
        }
        Commands::Provider(ProviderCommand::List) => {
            let providers = store.with_conn(db::list_providers)?;
            for p in providers {
                println!(
                    "{:>4}  {:<16} {:<18} {:<40} active={} key={}",
                    p.id,
                    p.name,
                    p.kind,
                    p.base_url,
                    p.is_active,
                    if p.has_credential() { "set" } else { "missing" }
                );
            }
        }
        Commands::Model(ModelCommand::Add {
            provider,
            name,
            identifier,
            rates,
        }) => {
            let provider_id = provider_id_by_name(&service, &provider)?;
            let rates = CostRates {
                input_per_1k: rates.input_rate,
                output_per_1k: rates.output_rate,
                blended_per_1k: rates.blended_rate,
            };
            let model_id = store
                .with_conn(|c| db::insert_model(c, provider_id, &name, &identifier, rates))
                .context("save model failed")?;
            println!("Saved model id={} ({} -> {})", model_id, name, identifier);
        }
        Commands::Template(TemplateCommand::Add { name, body }) => {
            let body = read_body(body)?;
            let id = store
                .with_conn(|c| db::insert_prompt_template(c, &name, &body))
                .context("save template failed")?;
            let version = store
                .with_conn(|c| db::get_prompt_template_by_id(c, id))?
                .map(|t| t.version)
                .unwrap_or(1);
            println!("Saved template id={} ({} v{})", id, name, version);
        }
        Commands::Template(TemplateCommand::Edit { id, body }) => {
            let body = read_body(body)?;
            let new_id = store
                .with_conn(|c| db::update_prompt_template_content(c, id, &body))
                .context("update template failed")?;
            if new_id == id {
                println!("Template id={} unchanged", id);
            } else {
                println!("Template id={} superseded by id={}", id, new_id);
            }
        }
        Commands::Config(ConfigCommand::Add {
            provider,
            model_id,
            template_id,
            temperature,
            max_tokens,
        }) => {
            let provider_id = provider_id_by_name(&service, &provider)?;
            let params = CallParameters {
                temperature,
                max_tokens,
            };
            let id = store
                .with_conn(|c| db::insert_configuration(c, provider_id, model_id, template_id, params))
                .context("save configuration failed")?;
            println!(
                "Saved configuration id={} (template={})",
                id,
                template_id.map(|t| t.to_string()).unwrap_or_else(|| "default".into())
            );
        }
        Commands::Config(ConfigCommand::List) => {
            for cfg in store.with_conn(db::list_configurations)? {
                println!(
                    "{:>4}  provider={} model={} template={:?} active={} temperature={:?} max_tokens={:?}",
                    cfg.id,
                    cfg.provider_id,
                    cfg.model_id,
                    cfg.prompt_template_id,
                    cfg.is_active,
                    cfg.parameters.temperature,
                    cfg.parameters.max_tokens
                );
            }
        }
        Commands::SetKey { provider, api_key } => {
            let provider_id = provider_id_by_name(&service, &provider)?;
            service
                .store_credential(provider_id, &api_key)
                .context("save credential failed")?;
            println!("Credential stored for {}", provider);
        }
        Commands::RotateCredentials => {
            let report = service.rotate_credentials()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.failed.is_empty() {
                bail!("{} credential(s) could not be decoded", report.failed.len());
            }
        }
        Commands::Call {
            function,
            messages,
            vars,
            temperature,
            max_tokens,
            template_id,
        } => {
            let request = CallRequest {
                function_name: function,
                messages: messages.into_iter().map(Message::user).collect(),
                variables: parse_vars(&vars)?,
                temperature,
                max_tokens,
                prompt_template_id: template_id,
            };
            tracing::info!(
                function = %request.function_name,
                template_id = ?request.prompt_template_id,
                messages = request.messages.len(),
                "dispatching call"
            );
            let response = service.call_llm(request).await?;
            println!("{}", response.content);
            eprintln!(
                "[{} / {}] in={} out={} cost={:.6} latency={}ms interaction={}",
                response.provider,
                response.model,
                response.usage.input_tokens,
                response.usage.output_tokens,
                response.cost,
                response.latency_ms,
                response.interaction_id
            );
        }
        Commands::VerifyModels { provider } => {
            let provider_id = provider_id_by_name(&service, &provider)?;
            let report = service.verify_models(provider_id).await?;
            for m in &report.models {
                println!(
                    "{:>4}  {:<40} {}",
                    m.model_id,
                    m.model_identifier,
                    if m.available { "ok" } else { "NOT AVAILABLE" }
                );
            }
            println!("{} identifiers offered by {}", report.available.len(), report.provider);
        }
        Commands::Usage { recent } => {
            let summary = store.with_conn(db::usage_summary)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if recent > 0 {
                let rows = store.with_conn(|c| db::list_interactions(c, recent))?;
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
        }
        Commands::Serve { addr } => {
            tracing::info!(%addr, db = %settings.db_path.display(), "starting server");
            server::run(&addr, Arc::new(service)).await?;
        }
    }

    Ok(())
}

fn provider_id_by_name(service: &LlmService, name: &str) -> Result<i64> {
    service
        .store()
        .with_conn(|c| db::get_provider_by_name(c, name))?
        .map(|p| p.id)
        .ok_or_else(|| anyhow!("unknown provider `{}`, run: debate provider add --name ...", name))
}

fn read_body(args: BodyArgs) -> Result<String> {
    match (args.body, args.file) {
        (Some(body), _) => Ok(body),
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("read template file {}", path.display())),
        (None, None) => bail!("either --body or --file is required"),
    }
}

fn parse_vars(vars: &[String]) -> Result<HashMap<String, String>> {
    vars.iter()
        .map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| anyhow!("variable `{}` must look like KEY=VALUE", kv))
        })
        .collect()
}
