//! HTTP surface: health, caller identification, SSE chat stream, search and
//! delete, against a server bound to an ephemeral port.

use async_trait::async_trait;
use std::sync::Arc;
use tempfile::TempDir;

use doctalk::app::Services;
use doctalk::config::parse_config;
use doctalk::embedding::Embedder;
use doctalk::llm::{Script, ScriptedModel};
use doctalk::models::{ChatSession, DocumentStatus, Plan, SessionScope, User};
use doctalk::ocr::DisabledOcr;
use doctalk::server::{router, USER_HEADER};
use doctalk::store::{AccountStore, ChatStore};

struct ConstantEmbedder;

#[async_trait]
impl Embedder for ConstantEmbedder {
    fn model_name(&self) -> &str {
        "constant"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }
}

const NOTES: &str = "# Release notes\n\n\
The new release ships offline sync for mobile clients and reduces cold start time by half. \
Administrators can now export audit logs as CSV from the settings page.\n";

struct TestServer {
    _tmp: TempDir,
    base: String,
    services: Arc<Services>,
    document_id: String,
}

async fn start(scripts: Vec<Script>) -> TestServer {
    let tmp = TempDir::new().unwrap();
    let config = parse_config(&format!(
        "[db]\npath = \"{root}/doctalk.sqlite\"\n[storage]\nroot = \"{root}/objects\"\n\
         [retrieval]\nmin_chunk_text_len = 20\n[embedding]\nbatch_delay_ms = 0\n",
        root = tmp.path().display()
    ))
    .unwrap();
    let services = Arc::new(
        Services::open_with(
            &config,
            Arc::new(ConstantEmbedder),
            Arc::new(ScriptedModel::new(scripts)),
            Arc::new(DisabledOcr),
        )
        .await
        .unwrap(),
    );

    services
        .store
        .create_user(&User {
            id: "u1".into(),
            plan: Plan::Free,
            credits_balance: 5_000,
            monthly_credits_granted_at: Some(chrono::Utc::now()),
        })
        .await
        .unwrap();
    let doc = services
        .ingest
        .upload(Some("u1"), "notes.md", None, NOTES.as_bytes())
        .await
        .unwrap();
    let doc = services.ingest.process(&doc.id).await.unwrap();
    assert_eq!(doc.status, DocumentStatus::Ready, "{:?}", doc.error_msg);
    services
        .store
        .create_session(&ChatSession {
            id: "s1".into(),
            user_id: Some("u1".into()),
            scope: SessionScope::Document(doc.id.clone()),
            title: None,
        })
        .await
        .unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let app = router(services.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        _tmp: tmp,
        base,
        services,
        document_id: doc.id,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_version() {
    let server = start(vec![]).await;
    let body: serde_json::Value = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test(flavor = "multi_thread")]
async fn chat_streams_sse_events() {
    let server = start(vec![Script::answer(&["Offline sync [1]", " ships."], 700, 30)]).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/sessions/s1/chat", server.base))
        .header(USER_HEADER, "u1")
        .json(&serde_json::json!({ "message": "What ships in the release?" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    let body = resp.text().await.unwrap();

    assert!(body.starts_with("event: token\ndata: "));
    assert!(body.contains("event: citation\ndata: {"));
    assert!(body.contains("\"ref_index\":1"));
    assert!(body.trim_end().rsplit("\n\n").next().unwrap().starts_with("event: done"));
    assert!(body.ends_with("\n\n"));
    assert!(server.services.ledger.balance("u1").await.unwrap() < 5_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn in_stream_failures_arrive_as_error_events() {
    let server = start(vec![]).await;
    let body = reqwest::Client::new()
        .post(format!("{}/sessions/missing/chat", server.base))
        .header(USER_HEADER, "u1")
        .json(&serde_json::json!({ "message": "hello" }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.starts_with("event: error\n"));
    assert!(body.contains("SESSION_NOT_FOUND"));
}

#[tokio::test(flavor = "multi_thread")]
async fn requests_without_caller_are_rejected() {
    let server = start(vec![]).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/sessions/s1/chat", server.base))
        .json(&serde_json::json!({ "message": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test(flavor = "multi_thread")]
async fn search_and_delete_document() {
    let server = start(vec![]).await;
    let client = reqwest::Client::new();
    let search_url = format!("{}/documents/{}/search", server.base, server.document_id);

    let resp = client
        .post(&search_url)
        .header(USER_HEADER, "u1")
        .json(&serde_json::json!({ "query": "audit logs", "top_k": 2 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let results = body["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert!(results[0]["text"].as_str().unwrap().contains("audit logs"));

    let resp = client
        .post(&search_url)
        .header(USER_HEADER, "u1")
        .json(&serde_json::json!({ "query": "audit logs", "top_k": u64::MAX }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(&search_url)
        .header(USER_HEADER, "u1")
        .json(&serde_json::json!({ "query": "  " }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .post(&search_url)
        .header(USER_HEADER, "intruder")
        .json(&serde_json::json!({ "query": "audit" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let delete_url = format!("{}/documents/{}", server.base, server.document_id);
    let resp = client
        .delete(&delete_url)
        .header(USER_HEADER, "u1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["deleted"], server.document_id.as_str());
    assert_eq!(body["cleanup_queued"], 0);

    let resp = client
        .delete(&delete_url)
        .header(USER_HEADER, "u1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
