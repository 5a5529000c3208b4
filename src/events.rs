//! Server-sent events produced by a chat turn.
//!
//! Each event renders as `event: <name>\ndata: <json>\n\n`. Exactly one
//! terminal event (`done` or `error`) closes a turn.

use serde_json::{json, Value};

use crate::error::ChatError;
use crate::models::Citation;

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Token {
        text: String,
    },
    Citation(Citation),
    Ping,
    Truncated {
        reason: String,
    },
    Warn {
        code: String,
        message: String,
    },
    Error {
        code: String,
        message: String,
    },
    Done {
        message_id: String,
        citations_count: usize,
        can_continue: bool,
        continuation_count: i64,
    },
}

impl ChatEvent {
    pub fn token(text: impl Into<String>) -> Self {
        ChatEvent::Token { text: text.into() }
    }

    pub fn error(err: &ChatError) -> Self {
        ChatEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn warn(err: &ChatError) -> Self {
        ChatEvent::Warn {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }

    pub fn max_tokens() -> Self {
        ChatEvent::Truncated {
            reason: "max_tokens".to_string(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChatEvent::Token { .. } => "token",
            ChatEvent::Citation(_) => "citation",
            ChatEvent::Ping => "ping",
            ChatEvent::Truncated { .. } => "truncated",
            ChatEvent::Warn { .. } => "warn",
            ChatEvent::Error { .. } => "error",
            ChatEvent::Done { .. } => "done",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            ChatEvent::Token { text } => json!({ "text": text }),
            ChatEvent::Citation(c) => serde_json::to_value(c).unwrap_or(Value::Null),
            ChatEvent::Ping => json!({}),
            ChatEvent::Truncated { reason } => json!({ "reason": reason }),
            ChatEvent::Warn { code, message } | ChatEvent::Error { code, message } => {
                json!({ "code": code, "message": message })
            }
            ChatEvent::Done {
                message_id,
                citations_count,
                can_continue,
                continuation_count,
            } => json!({
                "message_id": message_id,
                "citations_count": citations_count,
                "can_continue": can_continue,
                "continuation_count": continuation_count,
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChatEvent::Error { .. } | ChatEvent::Done { .. })
    }

    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }
}
