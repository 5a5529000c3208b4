//! Chat turn orchestration.
//!
//! A turn runs as a producer task that writes [`ChatEvent`]s into a bounded
//! channel; the transport drains it. Stage order:
//!
//! 1. resolve session scope and custom instructions
//! 2. resolve mode, gate by plan
//! 3. pre-debit the estimated cost
//! 4. persist the user message, auto-title the session
//! 5. load recent history
//! 6. retrieve fragments
//! 7. build the prompt
//! 8. stream the answer through the [`CitationParser`], pinging on silence
//! 9. persist, reconcile, record usage, emit `done`
//!
//! Any failure after step 3 and before the answer is persisted refunds the
//! pre-debit exactly. A dropped receiver stops the producer at its next
//! send.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::chunk::estimate_tokens;
use crate::citation::{CitationParser, FragmentSet, ParseEvent};
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::events::ChatEvent;
use crate::ledger::{CreditLedger, Reconciliation, REASON_CHAT, REF_CHAT_TURN};
use crate::llm::{ChatModel, ChatRequest, LlmMessage, StreamItem};
use crate::models::{
    ChatSession, Citation, LedgerEntry, Message, RetrievedFragment, Role, SessionScope, TokenUsage,
    UsageRecord,
};
use crate::profiles::{calculate_cost, profile_for, Mode, ModelProfile};
use crate::prompt::{build_continuation_messages, build_messages, build_system_prompt, PromptInput};
use crate::retrieval::Retriever;
use crate::store::{new_id, now_millis, ChatStore, DocumentStore};

/// Tokens reserved for rules, history and formatting in the pre-debit
/// estimate.
const PROMPT_OVERHEAD_TOKENS: usize = 600;
const TITLE_CHARS: usize = 50;

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    pub mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContinueRequest {
    pub session_id: String,
    pub user_id: String,
    pub message_id: String,
    pub mode: Option<String>,
}

/// Why a turn stopped early.
enum Abort {
    Failed(ChatError),
    Disconnected,
}

impl From<ChatError> for Abort {
    fn from(e: ChatError) -> Self {
        Abort::Failed(e)
    }
}

struct Disconnected;

impl From<Disconnected> for Abort {
    fn from(_: Disconnected) -> Self {
        Abort::Disconnected
    }
}

struct EventSink {
    tx: mpsc::Sender<ChatEvent>,
}

impl EventSink {
    async fn send(&self, event: ChatEvent) -> Result<(), Disconnected> {
        self.tx.send(event).await.map_err(|_| Disconnected)
    }
}

/// What the model produced for one stream.
struct StreamedAnswer {
    text: String,
    citations: Vec<Citation>,
    usage: TokenUsage,
    truncated: bool,
}

/// Model, multiplier and estimate for one paid turn.
struct Pricing {
    model: String,
    profile: ModelProfile,
    multiplier: f64,
    estimate: i64,
}

pub struct ChatOrchestrator {
    chats: Arc<dyn ChatStore>,
    documents: Arc<dyn DocumentStore>,
    retriever: Arc<Retriever>,
    ledger: Arc<CreditLedger>,
    model: Arc<dyn ChatModel>,
    config: ChatConfig,
    heartbeat: Duration,
}

impl ChatOrchestrator {
    pub fn new(
        chats: Arc<dyn ChatStore>,
        documents: Arc<dyn DocumentStore>,
        retriever: Arc<Retriever>,
        ledger: Arc<CreditLedger>,
        model: Arc<dyn ChatModel>,
        config: ChatConfig,
    ) -> Self {
        let heartbeat = Duration::from_secs(config.heartbeat_secs.max(1));
        Self {
            chats,
            documents,
            retriever,
            ledger,
            model,
            config,
            heartbeat,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Start a turn. Events arrive on the returned receiver; dropping it
    /// cancels the turn.
    pub fn chat(self: &Arc<Self>, request: TurnRequest) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let sink = EventSink { tx };
            let outcome = this.run_turn(&request, &sink).await;
            finish(&sink, outcome, &request.session_id).await;
        });
        rx
    }

    /// Continue a truncated assistant message in place.
    pub fn continue_message(self: &Arc<Self>, request: ContinueRequest) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let sink = EventSink { tx };
            let outcome = this.run_continuation(&request, &sink).await;
            finish(&sink, outcome, &request.session_id).await;
        });
        rx
    }

    async fn run_turn(&self, req: &TurnRequest, sink: &EventSink) -> Result<(), Abort> {
        if req.message.trim().is_empty() {
            return Err(ChatError::BadRequest("message is empty".into()).into());
        }
        let session = self.load_session(&req.session_id, &req.user_id).await?;
        let custom_instructions = self.custom_instructions(&session.scope).await;
        let multi = session.scope.is_multi();
        let top_k = self.retriever.default_top_k(multi);

        let mode = self.resolve_mode(req.mode.as_deref(), &req.user_id).await?;
        let prompt_estimate =
            estimate_tokens(&req.message) + top_k * self.config.fragment_chars / 4 + PROMPT_OVERHEAD_TOKENS;
        let pricing = self.pricing(mode, prompt_estimate);

        let assistant_id = new_id();
        let pre_debit = self
            .pre_debit(&req.user_id, &pricing, &assistant_id)
            .await?;

        let user_message = Message {
            id: new_id(),
            session_id: session.id.clone(),
            role: Role::User,
            content: req.message.clone(),
            citations: Vec::new(),
            prompt_tokens: None,
            output_tokens: None,
            continuation_count: 0,
            created_at: now_millis(),
        };
        if let Err(e) = self.chats.append_message(&user_message).await {
            self.refund(&pre_debit).await;
            return Err(ChatError::Persist(e.to_string()).into());
        }
        if session.title.is_none() {
            let title: String = req.message.trim().chars().take(TITLE_CHARS).collect();
            if let Err(e) = self.chats.set_session_title(&session.id, &title).await {
                tracing::warn!(session_id = %session.id, error = %e, "failed to set session title");
            }
        }

        let history = match self
            .chats
            .recent_messages(&session.id, self.config.history_turns * 2 + 1)
            .await
        {
            Ok(mut msgs) => {
                msgs.retain(|m| m.id != user_message.id);
                msgs
            }
            Err(e) => {
                self.refund(&pre_debit).await;
                return Err(ChatError::Internal(e.to_string()).into());
            }
        };

        let fragments = match self
            .retriever
            .search(&req.message, &session.scope.document_ids(), top_k, multi)
            .await
        {
            Ok(f) => FragmentSet::sequential(f),
            Err(e) => {
                tracing::warn!(session_id = %session.id, error = %e, "retrieval failed");
                self.refund(&pre_debit).await;
                return Err(ChatError::Retrieval(e.to_string()).into());
            }
        };

        let system = build_system_prompt(&PromptInput {
            fragments: &fragments,
            model: &pricing.model,
            is_collection: multi,
            custom_instructions: custom_instructions.as_deref(),
            fragment_chars: self.config.fragment_chars,
        });
        let messages = build_messages(system, &history, &req.message);
        let parser = CitationParser::new(&fragments, self.config.snippet_chars);

        let answer = self
            .stream_paid(&pricing, messages, parser, &pre_debit, sink)
            .await?;

        let message = Message {
            id: assistant_id,
            session_id: session.id.clone(),
            role: Role::Assistant,
            content: answer.text.clone(),
            citations: answer.citations.clone(),
            prompt_tokens: Some(answer.usage.prompt_tokens),
            output_tokens: Some(answer.usage.completion_tokens),
            continuation_count: 0,
            created_at: now_millis(),
        };
        if let Err(e) = self.chats.append_message(&message).await {
            tracing::error!(session_id = %session.id, error = %e, "failed to persist answer; pre-debit kept");
            return Err(ChatError::Persist(e.to_string()).into());
        }

        self.settle(&req.user_id, &message.id, &pricing, &pre_debit, &answer, sink)
            .await?;
        self.complete(&message, answer.truncated, sink).await
    }

    async fn run_continuation(&self, req: &ContinueRequest, sink: &EventSink) -> Result<(), Abort> {
        let session = self.load_session(&req.session_id, &req.user_id).await?;
        let mut message = match self.chats.get_message(&req.message_id).await {
            Ok(Some(m)) if m.session_id == session.id && m.role == Role::Assistant => m,
            Ok(_) => {
                return Err(
                    ChatError::BadRequest(format!("message not found: {}", req.message_id)).into(),
                )
            }
            Err(e) => return Err(ChatError::Internal(e.to_string()).into()),
        };
        if message.continuation_count >= self.config.max_continuations {
            return Err(ChatError::ContinuationLimit(self.config.max_continuations).into());
        }

        let custom_instructions = self.custom_instructions(&session.scope).await;
        let multi = session.scope.is_multi();
        let mode = self.resolve_mode(req.mode.as_deref(), &req.user_id).await?;
        let fragments = self.fragments_from_citations(&message.citations).await;

        let fragment_tokens: usize = fragments
            .iter()
            .map(|(_, f)| estimate_tokens(&f.text).min(self.config.fragment_chars / 4))
            .sum();
        let prompt_estimate =
            estimate_tokens(&message.content) + fragment_tokens + PROMPT_OVERHEAD_TOKENS;
        let pricing = self.pricing(mode, prompt_estimate);

        let turn_ref = format!("{}:{}", message.id, message.continuation_count + 1);
        let pre_debit = self.pre_debit(&req.user_id, &pricing, &turn_ref).await?;

        let history = match self
            .chats
            .recent_messages(&session.id, self.config.history_turns * 2 + 2)
            .await
        {
            Ok(msgs) => match msgs.iter().position(|m| m.id == message.id) {
                Some(pos) => msgs[..pos].to_vec(),
                None => msgs,
            },
            Err(e) => {
                self.refund(&pre_debit).await;
                return Err(ChatError::Internal(e.to_string()).into());
            }
        };

        let system = build_system_prompt(&PromptInput {
            fragments: &fragments,
            model: &pricing.model,
            is_collection: multi,
            custom_instructions: custom_instructions.as_deref(),
            fragment_chars: self.config.fragment_chars,
        });
        let messages = build_continuation_messages(system, &history, &message.content);
        let offset = message.content.chars().count();
        let parser = CitationParser::with_offset(&fragments, self.config.snippet_chars, offset);

        let answer = self
            .stream_paid(&pricing, messages, parser, &pre_debit, sink)
            .await?;

        let expected_count = message.continuation_count;
        message.content.push_str(&answer.text);
        message.citations.extend(answer.citations.iter().cloned());
        message.prompt_tokens = Some(message.prompt_tokens.unwrap_or(0) + answer.usage.prompt_tokens);
        message.output_tokens =
            Some(message.output_tokens.unwrap_or(0) + answer.usage.completion_tokens);
        message.continuation_count += 1;
        match self.chats.update_message(&message, expected_count).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(message_id = %message.id, "message was continued concurrently; refunding");
                self.refund(&pre_debit).await;
                return Err(ChatError::ContinuationLimit(self.config.max_continuations).into());
            }
            Err(e) => {
                tracing::error!(message_id = %message.id, error = %e, "failed to persist continuation; pre-debit kept");
                return Err(ChatError::Persist(e.to_string()).into());
            }
        }

        self.settle(&req.user_id, &message.id, &pricing, &pre_debit, &answer, sink)
            .await?;
        self.complete(&message, answer.truncated, sink).await
    }

    async fn load_session(&self, session_id: &str, user_id: &str) -> Result<ChatSession, ChatError> {
        let session = self
            .chats
            .get_session(session_id)
            .await
            .map_err(|e| ChatError::Internal(e.to_string()))?
            .ok_or_else(|| ChatError::SessionNotFound(session_id.to_string()))?;
        match &session.user_id {
            Some(owner) if owner != user_id => Err(ChatError::SessionNotFound(session_id.to_string())),
            _ => Ok(session),
        }
    }

    /// Instructions attached to a single-document session's document.
    async fn custom_instructions(&self, scope: &SessionScope) -> Option<String> {
        let SessionScope::Document(document_id) = scope else {
            return None;
        };
        match self.documents.get_document(document_id).await {
            Ok(doc) => doc.and_then(|d| d.custom_instructions),
            Err(e) => {
                tracing::warn!(document_id = %document_id, error = %e, "failed to load custom instructions");
                None
            }
        }
    }

    /// Mode defaults to balanced. Premium modes need a paid plan, and the
    /// monthly allowance is topped up before the balance check.
    async fn resolve_mode(&self, requested: Option<&str>, user_id: &str) -> Result<Mode, ChatError> {
        let mode = match requested {
            None => Mode::Balanced,
            Some(s) => Mode::parse(s).ok_or_else(|| ChatError::BadRequest(format!("unknown mode: {}", s)))?,
        };
        let user = self.ledger.user(user_id).await?;
        if !mode.allowed_for(user.plan) {
            return Err(ChatError::ModeNotAllowed(mode.as_str().to_string()));
        }
        if let Err(e) = self.ledger.ensure_monthly_credits(user_id).await {
            tracing::warn!(user_id, error = %e, "monthly allowance check failed");
        }
        Ok(mode)
    }

    fn pricing(&self, mode: Mode, prompt_estimate: usize) -> Pricing {
        let model = mode.model().as_str().to_string();
        let profile = profile_for(&model);
        let multiplier = mode.multiplier(self.ledger.config());
        let estimate = calculate_cost(
            prompt_estimate as i64,
            i64::from(profile.max_tokens),
            &model,
            multiplier,
        );
        Pricing {
            model,
            profile,
            multiplier,
            estimate,
        }
    }

    async fn pre_debit(&self, user_id: &str, pricing: &Pricing, ref_id: &str) -> Result<LedgerEntry, ChatError> {
        let balance = self.ledger.balance(user_id).await?;
        if balance < self.ledger.config().min_balance_for_chat {
            return Err(ChatError::InsufficientCredits);
        }
        let entry = self
            .ledger
            .debit(user_id, pricing.estimate, REASON_CHAT, Some(REF_CHAT_TURN), Some(ref_id))
            .await?;
        tracing::debug!(user_id, cost = pricing.estimate, model = %pricing.model, "pre-debited chat turn");
        Ok(entry)
    }

    async fn refund(&self, pre_debit: &LedgerEntry) {
        if let Err(e) = self.ledger.refund(&pre_debit.id).await {
            tracing::warn!(entry_id = %pre_debit.id, user_id = %pre_debit.user_id, error = %e, "refund of pre-debit failed");
        }
    }

    /// Stream the model answer, refunding the pre-debit if the model fails
    /// or, when configured, if the client goes away.
    async fn stream_paid(
        &self,
        pricing: &Pricing,
        messages: Vec<LlmMessage>,
        parser: CitationParser,
        pre_debit: &LedgerEntry,
        sink: &EventSink,
    ) -> Result<StreamedAnswer, Abort> {
        let prompt_tokens: usize = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        let request = ChatRequest {
            model: pricing.model.clone(),
            messages,
            profile: pricing.profile,
        };
        match self.stream_answer(request, parser, prompt_tokens, sink).await {
            Ok(answer) => Ok(answer),
            Err(Abort::Failed(e)) => {
                tracing::warn!(user_id = %pre_debit.user_id, error = %e, "model stream failed");
                self.refund(pre_debit).await;
                Err(Abort::Failed(e))
            }
            Err(Abort::Disconnected) => {
                if self.config.refund_on_disconnect {
                    tracing::info!(user_id = %pre_debit.user_id, "client disconnected; refunding pre-debit");
                    self.refund(pre_debit).await;
                } else {
                    tracing::warn!(user_id = %pre_debit.user_id, "client disconnected; pre-debit kept");
                }
                Err(Abort::Disconnected)
            }
        }
    }

    async fn stream_answer(
        &self,
        request: ChatRequest,
        mut parser: CitationParser,
        prompt_tokens_estimate: usize,
        sink: &EventSink,
    ) -> Result<StreamedAnswer, Abort> {
        let mut rx = self
            .model
            .stream(request)
            .await
            .map_err(|e| ChatError::Llm(e.to_string()))?;

        let mut text = String::new();
        let mut citations = Vec::new();

        loop {
            let item = match tokio::time::timeout(self.heartbeat, rx.recv()).await {
                Err(_) => {
                    sink.send(ChatEvent::Ping).await?;
                    continue;
                }
                Ok(None) => {
                    return Err(ChatError::Llm("model stream ended before completion".into()).into())
                }
                Ok(Some(Err(e))) => return Err(ChatError::Llm(e.to_string()).into()),
                Ok(Some(Ok(item))) => item,
            };
            match item {
                StreamItem::Delta(delta) => {
                    for event in parser.feed(&delta) {
                        forward(event, &mut text, &mut citations, sink).await?;
                    }
                }
                StreamItem::Finished {
                    usage,
                    finish_reason,
                } => {
                    for event in parser.flush() {
                        forward(event, &mut text, &mut citations, sink).await?;
                    }
                    let usage = usage.unwrap_or(TokenUsage {
                        prompt_tokens: prompt_tokens_estimate as i64,
                        completion_tokens: estimate_tokens(&text) as i64,
                    });
                    let truncated = matches!(finish_reason.as_deref(), Some("length" | "max_tokens"));
                    return Ok(StreamedAnswer {
                        text,
                        citations,
                        usage,
                        truncated,
                    });
                }
            }
        }
    }

    /// Reconcile against the real cost and record usage. Accounting trouble
    /// becomes a `warn` event; the answer stands.
    async fn settle(
        &self,
        user_id: &str,
        message_id: &str,
        pricing: &Pricing,
        pre_debit: &LedgerEntry,
        answer: &StreamedAnswer,
        sink: &EventSink,
    ) -> Result<(), Abort> {
        let actual = calculate_cost(
            answer.usage.prompt_tokens,
            answer.usage.completion_tokens,
            &pricing.model,
            pricing.multiplier,
        );
        let outcome = self
            .ledger
            .reconcile(user_id, &pre_debit.id, pricing.estimate, actual)
            .await;
        tracing::info!(
            user_id,
            message_id,
            estimate = pricing.estimate,
            cost = actual,
            outcome = ?outcome,
            "chat turn settled"
        );
        if let Reconciliation::Failed { reason, .. } = outcome {
            sink.send(ChatEvent::warn(&ChatError::Accounting(reason))).await?;
        }

        let usage = UsageRecord {
            user_id: user_id.to_string(),
            message_id: Some(message_id.to_string()),
            model: pricing.model.clone(),
            prompt_tokens: answer.usage.prompt_tokens,
            completion_tokens: answer.usage.completion_tokens,
            cost_credits: actual,
        };
        if let Err(e) = self.ledger.record_usage(&usage).await {
            tracing::warn!(user_id, message_id, error = %e, "failed to record usage");
        }
        Ok(())
    }

    async fn complete(&self, message: &Message, truncated: bool, sink: &EventSink) -> Result<(), Abort> {
        if truncated {
            sink.send(ChatEvent::max_tokens()).await?;
        }
        sink.send(ChatEvent::Done {
            message_id: message.id.clone(),
            citations_count: message.citations.len(),
            can_continue: truncated && message.continuation_count < self.config.max_continuations,
            continuation_count: message.continuation_count,
        })
        .await?;
        Ok(())
    }

    /// Rebuild the fragment set of the original turn from its citations,
    /// keeping the original numbering. Chunk bodies are reloaded when they
    /// still exist; otherwise the stored snippet stands in.
    async fn fragments_from_citations(&self, citations: &[Citation]) -> FragmentSet {
        let ids: Vec<String> = citations.iter().map(|c| c.chunk_id.clone()).collect();
        let chunks = match self.documents.get_chunks(&ids).await {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::warn!(error = %e, "failed to reload cited chunks; using snippets");
                Vec::new()
            }
        };
        let entries = citations
            .iter()
            .map(|c| {
                let chunk = chunks.iter().find(|ch| ch.id == c.chunk_id);
                let fragment = RetrievedFragment {
                    chunk_id: c.chunk_id.clone(),
                    text: chunk
                        .map(|ch| ch.text.clone())
                        .unwrap_or_else(|| c.text_snippet.clone()),
                    page: c.page,
                    bboxes: chunk.map(|ch| ch.bboxes.clone()).unwrap_or_else(|| c.bboxes.clone()),
                    similarity_score: 0.0,
                    section_title: chunk.and_then(|ch| ch.section_title.clone()),
                    document_id: c.document_id.clone(),
                    document_filename: c.document_filename.clone(),
                };
                (c.ref_index, fragment)
            })
            .collect();
        FragmentSet::numbered(entries)
    }
}

async fn forward(
    event: ParseEvent,
    text: &mut String,
    citations: &mut Vec<Citation>,
    sink: &EventSink,
) -> Result<(), Disconnected> {
    match event {
        ParseEvent::Text(t) => {
            text.push_str(&t);
            sink.send(ChatEvent::Token { text: t }).await
        }
        ParseEvent::Citation(c) => {
            citations.push(c.clone());
            sink.send(ChatEvent::Citation(c)).await
        }
    }
}

async fn finish(sink: &EventSink, outcome: Result<(), Abort>, session_id: &str) {
    match outcome {
        Ok(()) => {}
        Err(Abort::Failed(e)) => {
            tracing::info!(session_id, code = e.code(), error = %e, "chat turn failed");
            let _ = sink.send(ChatEvent::error(&e)).await;
        }
        Err(Abort::Disconnected) => {
            tracing::info!(session_id, "chat turn cancelled by client");
        }
    }
}
