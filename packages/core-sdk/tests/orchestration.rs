use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use debate_core_sdk::db::{self, Store};
use debate_core_sdk::error::{ConfigInvariant, ErrorKind, LlmError};
use debate_core_sdk::executor::ExecutorConfig;
use debate_core_sdk::llm::{LlmService, ServiceOptions, UNRECORDED_INTERACTION};
use debate_core_sdk::models::{CallParameters, CallRequest, CostRates, Message};
use debate_core_sdk::prompt::PlaceholderPolicy;
use debate_core_sdk::vault::CredentialVault;

struct Harness {
    service: LlmService,
    provider_id: i64,
}

fn options(timeout: Duration) -> ServiceOptions {
    ServiceOptions {
        timeout,
        executor: ExecutorConfig {
            max_retries: 1,
            backoff_base: Duration::from_millis(10),
        },
        placeholder_policy: PlaceholderPolicy::PassThrough,
    }
}

/** \brief 建一个 Provider + Model + 模板 + 绑定配置，凭据经保险箱写入。 */
fn harness(kind: &str, base_url: &str, api_key: &str, timeout: Duration) -> Harness {
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let provider_id = store
        .with_conn(|c| {
            let pid = db::insert_provider(c, kind, kind, base_url, None)?;
            let mid = db::insert_model(
                c,
                pid,
                "Debate model",
                "debate-model-1",
                CostRates {
                    input_per_1k: Some(3.0),
                    output_per_1k: Some(15.0),
                    blended_per_1k: None,
                },
            )?;
            let tid = db::insert_prompt_template(
                c,
                "moderator",
                "Eres el moderador del debate sobre {TOPIC}.",
            )?;
            db::insert_configuration(
                c,
                pid,
                mid,
                Some(tid),
                CallParameters {
                    temperature: Some(0.4),
                    max_tokens: Some(300),
                },
            )?;
            Ok(pid)
        })
        .expect("seed");
    let service = LlmService::new(store, CredentialVault::new("integration-secret"), options(timeout))
        .expect("service");
    if !api_key.is_empty() {
        service.store_credential(provider_id, api_key).expect("credential");
    }
    Harness {
        service,
        provider_id,
    }
}

fn request() -> CallRequest {
    let mut variables = HashMap::new();
    variables.insert("TOPIC".to_string(), "energía nuclear".to_string());
    CallRequest {
        function_name: "moderator".into(),
        messages: vec![Message::user("Abre el debate.")],
        variables,
        ..CallRequest::default()
    }
}

fn interactions(h: &Harness) -> Vec<debate_core_sdk::models::Interaction> {
    h.service
        .store()
        .with_conn(|c| db::list_interactions(c, 100))
        .expect("interactions")
}

#[tokio::test]
async fn openai_call_succeeds_and_records_cost() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-proj-abc"))
        .and(|req: &Request| {
            let body: Value = match serde_json::from_slice(&req.body) {
                Ok(v) => v,
                Err(_) => return false,
            };
            body["model"] == "debate-model-1"
                && body["messages"][0]["role"] == "system"
                && body["messages"][0]["content"]
                    == "Eres el moderador del debate sobre energía nuclear."
                && body["messages"][1]["content"] == "Abre el debate."
                && body["max_tokens"] == 300
        })
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "Bienvenidos al debate."}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 50}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness("openai", &server.uri(), "sk-proj-abc", Duration::from_secs(5));
    let response = h.service.call_llm(request()).await.expect("call");

    assert_eq!(response.content, "Bienvenidos al debate.");
    assert_eq!(response.usage.input_tokens, 100);
    assert_eq!(response.usage.output_tokens, 50);
    assert_eq!(response.model, "debate-model-1");
    assert!((response.cost - 1.05).abs() < 1e-9);

    let rows = interactions(&h);
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);
    assert_eq!(rows[0].id, response.interaction_id);
    assert_eq!(rows[0].provider_id, Some(h.provider_id));
    assert!((rows[0].cost - 1.05).abs() < 1e-9);
    assert_eq!(rows[0].function_name, "moderator");
}

#[tokio::test]
async fn anthropic_call_sends_version_header_and_system_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("x-api-key", "sk-ant-xyz"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(|req: &Request| {
            let body: Value = match serde_json::from_slice(&req.body) {
                Ok(v) => v,
                Err(_) => return false,
            };
            body["system"] == "Eres el moderador del debate sobre energía nuclear."
                && body["messages"].as_array().map(|m| m.len()) == Some(1)
                && body["messages"][0]["role"] == "user"
        })
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "content": [{"type": "text", "text": "Adelante."}],
            "usage": {"input_tokens": 40, "output_tokens": 2}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness("anthropic", &server.uri(), "sk-ant-xyz", Duration::from_secs(5));
    let response = h.service.call_llm(request()).await.expect("call");
    assert_eq!(response.content, "Adelante.");
    assert_eq!(response.provider, "anthropic");
}

#[tokio::test]
async fn provider_rejection_keeps_literal_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid model"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness("openai", &server.uri(), "sk-abc", Duration::from_secs(5));
    let err = h.service.call_llm(request()).await.unwrap_err();
    assert_eq!(
        err,
        LlmError::ProviderRejected {
            status: 400,
            kind: ErrorKind::InvalidModel,
            body: r#"{"error":"invalid model"}"#.into(),
        }
    );

    let rows = interactions(&h);
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].success);
    assert_eq!(rows[0].input_tokens, 0);
    assert_eq!(rows[0].cost, 0.0);
    assert_eq!(rows[0].error_kind.as_deref(), Some("provider_rejected"));
    assert_eq!(rows[0].error_message.as_deref(), Some(r#"{"error":"invalid model"}"#));
}

#[tokio::test]
async fn server_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream overloaded"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness("openai", &server.uri(), "sk-abc", Duration::from_secs(5));
    let err = h.service.call_llm(request()).await.unwrap_err();
    assert!(matches!(
        err,
        LlmError::ProviderRejected {
            status: 503,
            kind: ErrorKind::Overloaded,
            ..
        }
    ));
    assert_eq!(interactions(&h).len(), 1);
}

#[tokio::test]
async fn timeout_is_raised_and_logged_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(3))
                .set_body_json(json!({"choices": [{"message": {"content": "tarde"}}]})),
        )
        .mount(&server)
        .await;

    let h = harness("openai", &server.uri(), "sk-abc", Duration::from_millis(200));
    let err = h.service.call_llm(request()).await.unwrap_err();
    assert_eq!(err, LlmError::Timeout(200));

    let rows = interactions(&h);
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].success);
    assert_eq!(rows[0].error_kind.as_deref(), Some("timeout"));
    assert!(rows[0].latency_ms >= 400);
    assert!(rows[0].latency_ms < 3000);
}

#[tokio::test]
async fn timeout_is_retried_once_before_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_secs(3))
                .set_body_json(json!({"choices": [{"message": {"content": "tarde"}}]})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "a tiempo"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        })))
        .mount(&server)
        .await;

    let h = harness("openai", &server.uri(), "sk-abc", Duration::from_millis(300));
    let response = h.service.call_llm(request()).await.expect("retried call");
    assert_eq!(response.content, "a tiempo");
    assert!(response.latency_ms >= 300);

    let rows = interactions(&h);
    assert_eq!(rows.len(), 1);
    assert!(rows[0].success);
}

#[tokio::test]
async fn empty_credential_never_reaches_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness("openai", &server.uri(), "", Duration::from_secs(5));
    let err = h.service.call_llm(request()).await.unwrap_err();
    assert_eq!(
        err,
        LlmError::ConfigurationInvalid(ConfigInvariant::ProviderWithoutCredential {
            provider: "openai".into()
        })
    );
    let rows = interactions(&h);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].error_kind.as_deref(), Some("configuration_invalid"));
}

#[tokio::test]
async fn corrupted_credential_fails_decryption() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness("openai", &server.uri(), "", Duration::from_secs(5));
    h.service
        .store()
        .with_conn(|c| db::set_provider_credential(c, h.provider_id, "v2:AAAAAAAAAAAAAAAAAAAAAAAAAAAA"))
        .expect("tamper");
    let err = h.service.call_llm(request()).await.unwrap_err();
    assert_eq!(err, LlmError::DecryptionFailed);
    assert_eq!(interactions(&h).len(), 1);
}

#[tokio::test]
async fn template_edit_rebinds_configuration_to_new_version() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(|req: &Request| {
            serde_json::from_slice::<Value>(&req.body)
                .map(|b| b["messages"][0]["content"] == "Modera con rigor: energía nuclear")
                .unwrap_or(false)
        })
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "ok"}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness("openai", &server.uri(), "sk-abc", Duration::from_secs(5));
    let new_id = h
        .service
        .store()
        .with_conn(|c| {
            let current = db::find_active_prompt_template(c, "moderator")?
                .ok_or_else(|| anyhow::anyhow!("template missing"))?;
            db::update_prompt_template_content(c, current.id, "Modera con rigor: {TOPIC}")
        })
        .expect("edit");

    let response = h.service.call_llm(request()).await.expect("call");
    assert_eq!(response.content, "ok");
    let rows = interactions(&h);
    assert_eq!(rows[0].prompt_template_id, Some(new_id));
    assert_eq!(rows[0].input_tokens + rows[0].output_tokens, 0);
}

#[tokio::test]
async fn unrecorded_success_still_returns_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "Bienvenidos."}}],
            "usage": {"prompt_tokens": 100, "completion_tokens": 50}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness("openai", &server.uri(), "sk-abc", Duration::from_secs(5));
    h.service
        .store()
        .with_conn(|c| {
            c.execute_batch("DROP TABLE interactions")?;
            Ok(())
        })
        .expect("drop log table");

    let response = h.service.call_llm(request()).await.expect("call");
    assert_eq!(response.content, "Bienvenidos.");
    assert_eq!(response.interaction_id, UNRECORDED_INTERACTION);
    assert!((response.cost - 1.05).abs() < 1e-9);
}
