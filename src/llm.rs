//! Token-streaming chat model abstraction.
//!
//! A [`ChatModel`] returns a channel of [`StreamItem`]s: zero or more
//! `Delta`s followed by exactly one `Finished`. An `Err` item or a channel
//! that closes before `Finished` means the stream failed.
//!
//! Implementations:
//! - **[`OpenAiChatModel`]**: OpenAI-compatible `/chat/completions` with
//!   `stream: true`, parsed from `data:` lines until `[DONE]`.
//! - **[`DisabledModel`]**: refuses every request.
//! - **[`ScriptedModel`]**: replays canned answers; used by tests and demos.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::models::TokenUsage;
use crate::profiles::ModelProfile;

const STREAM_BUFFER: usize = 64;
const MAX_CONNECT_RETRIES: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<LlmMessage>,
    pub profile: ModelProfile,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Delta(String),
    Finished {
        usage: Option<TokenUsage>,
        finish_reason: Option<String>,
    },
}

impl StreamItem {
    pub fn finished(usage: Option<TokenUsage>, finish_reason: Option<&str>) -> Self {
        StreamItem::Finished {
            usage,
            finish_reason: finish_reason.map(str::to_string),
        }
    }
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<StreamItem>>>;
}

/// Create the [`ChatModel`] named by `llm.provider`.
pub fn create_chat_model(config: &LlmConfig) -> Result<Box<dyn ChatModel>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledModel)),
        "openai" => Ok(Box::new(OpenAiChatModel::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

// ============ Disabled Provider ============

pub struct DisabledModel;

#[async_trait]
impl ChatModel for DisabledModel {
    async fn stream(&self, _request: ChatRequest) -> Result<mpsc::Receiver<Result<StreamItem>>> {
        bail!("LLM provider is disabled")
    }
}

// ============ OpenAI-compatible Provider ============

pub struct OpenAiChatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiChatModel {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))?;
        // A whole-request timeout would cut long answers mid-stream, so only
        // connecting and the gap between chunks are bounded.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
        })
    }

    fn request_body(request: &ChatRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.profile.temperature,
            "max_tokens": request.profile.max_tokens,
            "stream": true,
        });
        if request.profile.supports_stream_options {
            body["stream_options"] = serde_json::json!({ "include_usage": true });
        }
        body
    }

    /// Opens the stream, retrying 429/5xx/network failures. Nothing has been
    /// streamed yet at this point, so retrying cannot duplicate output.
    async fn connect(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let mut last_err = None;
        for attempt in 0..=MAX_CONNECT_RETRIES {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tracing::debug!(attempt, ?delay, "retrying chat completion request");
                tokio::time::sleep(delay).await;
            }
            match self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(body)
                .send()
                .await
            {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(anyhow::anyhow!("LLM API error {}: {}", status, text));
                        continue;
                    }
                    bail!("LLM API error {}: {}", status, text);
                }
                Err(e) => last_err = Some(e.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("LLM request failed after retries")))
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn stream(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<StreamItem>>> {
        let body = Self::request_body(&request);
        let mut response = self.connect(&body).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let mut decoder = SseDecoder::default();
            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                match decoder.push(&chunk) {
                    Ok(deltas) => {
                        for delta in deltas {
                            if tx.send(Ok(StreamItem::Delta(delta))).await.is_err() {
                                tracing::debug!("chat stream receiver dropped");
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
                if decoder.is_done() {
                    break;
                }
            }
            let _ = tx.send(Ok(decoder.finish())).await;
        });

        Ok(rx)
    }
}

/// Incremental parser for an OpenAI-style SSE body. Bytes are buffered
/// until a full line is available so multi-byte characters split across
/// network chunks survive.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    usage: Option<TokenUsage>,
    finish_reason: Option<String>,
    done: bool,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        self.buf.extend_from_slice(bytes);
        let mut deltas = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if self.done {
                continue;
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(delta) = self.handle_line(line.trim())? {
                deltas.push(delta);
            }
        }
        Ok(deltas)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn finish(self) -> StreamItem {
        StreamItem::Finished {
            usage: self.usage,
            finish_reason: self.finish_reason,
        }
    }

    fn handle_line(&mut self, line: &str) -> Result<Option<String>> {
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(None);
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }
        let json: serde_json::Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable stream line");
                return Ok(None);
            }
        };
        if let Some(err) = json.get("error") {
            let message = err["message"].as_str().unwrap_or("unknown provider error");
            bail!("LLM stream error: {}", message);
        }
        if let Some(usage) = json.get("usage").filter(|u| !u.is_null()) {
            self.usage = Some(TokenUsage {
                prompt_tokens: usage["prompt_tokens"].as_i64().unwrap_or(0),
                completion_tokens: usage["completion_tokens"].as_i64().unwrap_or(0),
            });
        }
        if let Some(reason) = json["choices"][0]["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }
        Ok(json["choices"][0]["delta"]["content"]
            .as_str()
            .filter(|c| !c.is_empty())
            .map(str::to_string))
    }
}

// ============ Scripted Provider ============

/// One canned answer for [`ScriptedModel`].
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub deltas: Vec<String>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    /// Fail after emitting this many deltas.
    pub fail_after: Option<usize>,
    /// Pause before each delta.
    pub delay: Duration,
}

impl Script {
    pub fn answer(deltas: &[&str], prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            usage: Some(TokenUsage {
                prompt_tokens,
                completion_tokens,
            }),
            finish_reason: Some("stop".to_string()),
            ..Default::default()
        }
    }

    pub fn truncated(mut self) -> Self {
        self.finish_reason = Some("length".to_string());
        self
    }

    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Replays scripts in order, one per request, and records every request.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn stream(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<StreamItem>>> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let script = self
            .scripts
            .lock()
            .map_err(|_| anyhow::anyhow!("script lock poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted answer left"))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            for (i, delta) in script.deltas.into_iter().enumerate() {
                if script.fail_after == Some(i) {
                    let _ = tx.send(Err(anyhow::anyhow!("scripted failure"))).await;
                    return;
                }
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                if tx.send(Ok(StreamItem::Delta(delta))).await.is_err() {
                    return;
                }
            }
            if script.fail_after.is_some() {
                let _ = tx.send(Err(anyhow::anyhow!("scripted failure"))).await;
                return;
            }
            let _ = tx
                .send(Ok(StreamItem::Finished {
                    usage: script.usage,
                    finish_reason: script.finish_reason,
                }))
                .await;
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_reads_deltas_usage_and_done() {
        let mut dec = SseDecoder::default();
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            ": keep-alive\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"length\"}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":3}}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
        );
        let deltas = dec.push(body.as_bytes()).unwrap();
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert!(dec.is_done());
        assert_eq!(
            dec.finish(),
            StreamItem::finished(
                Some(TokenUsage {
                    prompt_tokens: 12,
                    completion_tokens: 3
                }),
                Some("length")
            )
        );
    }

    #[test]
    fn decoder_handles_split_utf8_and_partial_lines() {
        let mut dec = SseDecoder::default();
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"毛利\"}}]}\n".as_bytes();
        let split = line.len() - 8;
        assert!(dec.push(&line[..split]).unwrap().is_empty());
        assert_eq!(dec.push(&line[split..]).unwrap(), vec!["毛利"]);
    }

    #[test]
    fn decoder_surfaces_provider_errors() {
        let mut dec = SseDecoder::default();
        let err = dec
            .push(b"data: {\"error\":{\"message\":\"overloaded\"}}\n")
            .unwrap_err();
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn request_body_respects_profile() {
        let mut profile = ModelProfile::default();
        let request = ChatRequest {
            model: "m".into(),
            messages: vec![LlmMessage::system("s")],
            profile,
        };
        let body = OpenAiChatModel::request_body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 2048);
        assert!(body.get("stream_options").is_none());

        profile.supports_stream_options = true;
        let body = OpenAiChatModel::request_body(&ChatRequest { profile, ..request });
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    /// Serves an SSE completion whose chunks arrive 400ms apart, so the
    /// whole body takes longer than the configured one-second timeout.
    async fn slow_completion_server() -> String {
        use axum::{body::Body, routing::post, Router};

        let chunks = vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"one \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"two \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"three\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ];
        let app = Router::new().route(
            "/chat/completions",
            post(move || {
                let chunks = chunks.clone();
                async move {
                    let stream = futures::stream::unfold(chunks.into_iter(), |mut it| async move {
                        let chunk = it.next()?;
                        tokio::time::sleep(Duration::from_millis(400)).await;
                        Some((Ok::<_, std::convert::Infallible>(chunk), it))
                    });
                    Body::from_stream(stream)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        base
    }

    #[tokio::test]
    async fn long_streams_outlast_the_idle_timeout() {
        std::env::set_var("DOCTALK_SLOW_STREAM_KEY", "test-key");
        let config = LlmConfig {
            provider: "openai".into(),
            base_url: slow_completion_server().await,
            api_key_env: "DOCTALK_SLOW_STREAM_KEY".into(),
            timeout_secs: 1,
            ..LlmConfig::default()
        };
        let model = OpenAiChatModel::new(&config).unwrap();
        let mut rx = model
            .stream(ChatRequest {
                model: "m".into(),
                messages: vec![LlmMessage::system("s")],
                profile: ModelProfile::default(),
            })
            .await
            .unwrap();

        let mut text = String::new();
        let mut finished = None;
        while let Some(item) = rx.recv().await {
            match item.unwrap() {
                StreamItem::Delta(d) => text.push_str(&d),
                StreamItem::Finished { finish_reason, .. } => finished = finish_reason,
            }
        }
        assert_eq!(text, "one two three");
        assert_eq!(finished.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn scripted_model_replays_and_fails() {
        let model = ScriptedModel::new(vec![
            Script::answer(&["a", "b"], 10, 2),
            Script::answer(&["x", "y"], 1, 1).failing_after(1),
        ]);
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![],
            profile: ModelProfile::default(),
        };

        let mut rx = model.stream(req.clone()).await.unwrap();
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item.unwrap());
        }
        assert_eq!(items.len(), 3);
        assert!(matches!(items[2], StreamItem::Finished { .. }));

        let mut rx = model.stream(req.clone()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), StreamItem::Delta("x".into()));
        assert!(rx.recv().await.unwrap().is_err());

        assert!(model.stream(req).await.is_err());
        assert_eq!(model.requests().len(), 3);
    }

    #[tokio::test]
    async fn disabled_model_refuses() {
        let req = ChatRequest {
            model: "m".into(),
            messages: vec![],
            profile: ModelProfile::default(),
        };
        assert!(DisabledModel.stream(req).await.is_err());
    }
}
