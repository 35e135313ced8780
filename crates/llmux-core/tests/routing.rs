use std::sync::Arc;

use llmux_core::metrics::format_metrics_table;
use llmux_core::{
    GenerateOptions, LlmuxConfig, MetricsCollector, ProviderError, StaticSecretResolver,
    build_registry, build_registry_with_metrics,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn ollama_server(reply: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": reply,
            "done": true,
            "prompt_eval_count": 4,
            "eval_count": 2
        })))
        .mount(&server)
        .await;
    server
}

async fn broken_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "models": [] })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/generate"))
        .respond_with(ResponseTemplate::new(500).set_body_string("CUDA out of memory"))
        .mount(&server)
        .await;
    server
}

fn config(text: &str) -> LlmuxConfig {
    match LlmuxConfig::from_toml_str(text) {
        Ok(c) => c,
        Err(e) => panic!("bad config: {e}"),
    }
}

#[tokio::test]
async fn configured_fallback_fails_over_to_healthy_backend() {
    let bad = broken_server().await;
    let good = ollama_server("recovered").await;
    let cfg = config(&format!(
        r#"
default = "chain"

[providers.gpu]
type = "ollama"
base_url = "{}"

[providers.cpu]
type = "ollama"
base_url = "{}"

[strategies.chain]
type = "fallback"
members = ["gpu", "cpu"]
"#,
        bad.uri(),
        good.uri()
    ));

    let registry = build_registry(&cfg, &StaticSecretResolver::new()).unwrap();
    let provider = registry.get_default().unwrap();
    assert_eq!(provider.provider_name(), "fallback");

    let resp = provider
        .generate("hi", &GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.content, "recovered");
    assert_eq!(bad.received_requests().await.unwrap().len(), 2); // probe + generate
}

#[tokio::test]
async fn configured_committee_votes_across_backends() {
    let a = ollama_server("Paris").await;
    let b = ollama_server("Paris").await;
    let c = ollama_server("Lyon").await;
    let cfg = config(&format!(
        r#"
[providers.a]
type = "ollama"
base_url = "{}"

[providers.b]
type = "ollama"
base_url = "{}"

[providers.c]
type = "ollama"
base_url = "{}"

[strategies.panel]
type = "committee"
members = ["a", "b", "c"]
"#,
        a.uri(),
        b.uri(),
        c.uri()
    ));

    let metrics = Arc::new(MetricsCollector::new());
    let registry =
        build_registry_with_metrics(&cfg, &StaticSecretResolver::new(), Some(metrics.clone()))
            .unwrap();
    let panel = registry.get("panel").unwrap();
    let resp = panel
        .generate("Capital of France?", &GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.content, "Paris");
    assert_eq!(resp.total_tokens(), 18);

    let summary = metrics.metrics(None);
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].provider, "ollama");
    assert_eq!(summary[0].total_requests, 3);
    assert!(format_metrics_table(&summary).contains("| ollama |"));
}

#[tokio::test]
async fn committee_judge_only_applies_when_registered() {
    let a = ollama_server("Paris").await;
    let b = ollama_server("Paris").await;
    let oracle = ollama_server("Paris, France").await;
    let text = |enabled: bool| {
        format!(
            r#"
[providers.a]
type = "ollama"
base_url = "{}"

[providers.b]
type = "ollama"
base_url = "{}"

[providers.oracle]
type = "ollama"
base_url = "{}"
enabled = {}

[strategies.panel]
type = "committee"
members = ["a", "b"]
judge = "oracle"
"#,
            a.uri(),
            b.uri(),
            oracle.uri(),
            enabled
        )
    };

    let judged = build_registry(&config(&text(true)), &StaticSecretResolver::new()).unwrap();
    let resp = judged
        .get("panel")
        .unwrap()
        .generate("Capital of France?", &GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.content, "Paris, France");

    let voted = build_registry(&config(&text(false)), &StaticSecretResolver::new()).unwrap();
    assert!(!voted.contains("oracle"));
    let resp = voted
        .get("panel")
        .unwrap()
        .generate("Capital of France?", &GenerateOptions::default())
        .await
        .unwrap();
    assert_eq!(resp.content, "Paris");
}

#[tokio::test]
async fn round_robin_spreads_across_backends() {
    let one = ollama_server("one").await;
    let two = ollama_server("two").await;
    let cfg = config(&format!(
        r#"
[providers.one]
type = "ollama"
base_url = "{}"

[providers.two]
type = "ollama"
base_url = "{}"

[strategies.pool]
type = "round_robin"
members = ["one", "two"]
"#,
        one.uri(),
        two.uri()
    ));

    let registry = build_registry(&cfg, &StaticSecretResolver::new()).unwrap();
    let pool = registry.get("pool").unwrap();
    let mut replies = Vec::new();
    for _ in 0..4 {
        replies.push(
            pool.generate("hi", &GenerateOptions::default())
                .await
                .unwrap()
                .content,
        );
    }
    assert_eq!(replies, vec!["one", "two", "one", "two"]);
}

#[tokio::test]
async fn registry_list_reports_live_status() {
    let up = ollama_server("x").await;
    let cfg = config(&format!(
        r#"
[providers.ollama]
type = "ollama"
base_url = "{}"

[providers.offline]
type = "ollama"
base_url = "http://127.0.0.1:1"
"#,
        up.uri()
    ));

    let registry = build_registry(&cfg, &StaticSecretResolver::new()).unwrap();
    let statuses = registry.list().await;
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].id, "offline");
    assert!(!statuses[0].available);
    assert_eq!(statuses[1].id, "ollama");
    assert!(statuses[1].available);
}

#[tokio::test]
async fn exhausted_chain_reports_every_failure() {
    let bad = broken_server().await;
    let cfg = config(&format!(
        r#"
[providers.gpu]
type = "ollama"
base_url = "{}"

[providers.offline]
type = "ollama"
base_url = "http://127.0.0.1:1"

[strategies.chain]
type = "fallback"
members = ["gpu", "offline"]
"#,
        bad.uri()
    ));

    let registry = build_registry(&cfg, &StaticSecretResolver::new()).unwrap();
    let err = registry
        .get("chain")
        .unwrap()
        .generate("hi", &GenerateOptions::default())
        .await
        .unwrap_err();
    match err {
        ProviderError::AllProvidersFailed { failures } => {
            assert_eq!(failures.len(), 2);
            assert!(failures[0].contains("CUDA out of memory"));
            assert!(failures[1].contains("unavailable"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
