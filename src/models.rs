//! Core data models used throughout doctalk.
//!
//! These types represent the pages, chunks, fragments and accounting records
//! that flow through ingestion, retrieval and chat.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One positioned line of text on a page. Coordinates are in points with a
/// top-left origin.
#[derive(Debug, Clone, PartialEq)]
pub struct TextBlock {
    pub text: String,
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    pub font_size: f32,
}

/// A page as produced by an extractor. Immutable once built.
#[derive(Debug, Clone)]
pub struct Page {
    /// 1-based.
    pub page_number: u32,
    pub width: f32,
    pub height: f32,
    pub rotation: i32,
    pub blocks: Vec<TextBlock>,
    /// Title supplied by the format itself (slide title, sheet name).
    pub section_title: Option<String>,
}

impl Page {
    pub fn char_count(&self) -> usize {
        self.blocks.iter().map(|b| b.text.chars().count()).sum()
    }

    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A text block that survived header/footer removal.
#[derive(Debug, Clone)]
pub struct CleanBlock {
    pub page_number: u32,
    pub text: String,
    pub bbox: (f32, f32, f32, f32),
    pub font_size: f32,
}

/// Bounding box normalized to `[0,1]` with a top-left origin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub page: u32,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// A retrieval-sized span of document text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub token_count: i64,
    pub page_start: u32,
    pub page_end: u32,
    pub bboxes: Vec<BBox>,
    pub section_title: Option<String>,
    pub vector_id: Option<String>,
}

/// A chunk selected for one query.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedFragment {
    pub chunk_id: String,
    pub text: String,
    pub page: u32,
    pub bboxes: Vec<BBox>,
    pub similarity_score: f32,
    pub section_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_filename: Option<String>,
}

/// Inline reference resolved from an `[n]` marker in an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub ref_index: u32,
    pub chunk_id: String,
    pub page: u32,
    pub bboxes: Vec<BBox>,
    pub text_snippet: String,
    pub offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_filename: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Uploading,
    Parsing,
    Embedding,
    Ready,
    Error,
    Deleting,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploading => "uploading",
            DocumentStatus::Parsing => "parsing",
            DocumentStatus::Embedding => "embedding",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Error => "error",
            DocumentStatus::Deleting => "deleting",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "uploading" => DocumentStatus::Uploading,
            "parsing" => DocumentStatus::Parsing,
            "embedding" => DocumentStatus::Embedding,
            "ready" => DocumentStatus::Ready,
            "error" => DocumentStatus::Error,
            "deleting" => DocumentStatus::Deleting,
            other => anyhow::bail!("unknown document status: {}", other),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub user_id: Option<String>,
    pub filename: String,
    pub content_type: String,
    pub storage_key: String,
    pub status: DocumentStatus,
    pub error_msg: Option<String>,
    pub page_count: i64,
    pub pages_parsed: i64,
    pub chunks_total: i64,
    pub chunks_indexed: i64,
    pub custom_instructions: Option<String>,
    pub is_demo: bool,
    /// Set once the document has been re-dispatched after a restart.
    pub recovery_attempted: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Plan {
    Free,
    Plus,
    Pro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Plus => "plus",
            Plan::Pro => "pro",
        }
    }

    /// Unknown plan names fall back to `Free`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "plus" => Plan::Plus,
            "pro" => Plan::Pro,
            _ => Plan::Free,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub plan: Plan,
    pub credits_balance: i64,
    pub monthly_credits_granted_at: Option<DateTime<Utc>>,
}

/// What a chat session is grounded on.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionScope {
    Document(String),
    Collection {
        collection_id: String,
        document_ids: Vec<String>,
    },
}

impl SessionScope {
    pub fn document_ids(&self) -> Vec<String> {
        match self {
            SessionScope::Document(id) => vec![id.clone()],
            SessionScope::Collection { document_ids, .. } => document_ids.clone(),
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, SessionScope::Collection { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: String,
    pub user_id: Option<String>,
    pub scope: SessionScope,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "assistant" {
            Role::Assistant
        } else {
            Role::User
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub citations: Vec<Citation>,
    pub prompt_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub continuation_count: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub id: String,
    pub user_id: String,
    pub delta: i64,
    pub balance_after: i64,
    pub reason: String,
    pub ref_type: Option<String>,
    pub ref_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub user_id: String,
    pub message_id: Option<String>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost_credits: i64,
}

/// Token usage reported by the model provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in ["uploading", "parsing", "embedding", "ready", "error", "deleting"] {
            let status: DocumentStatus = s.parse().unwrap();
            assert_eq!(status.as_str(), s);
        }
        assert!("bogus".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn plan_parse_defaults_to_free() {
        assert_eq!(Plan::parse("PRO"), Plan::Pro);
        assert_eq!(Plan::parse("enterprise"), Plan::Free);
        assert!(Plan::Plus > Plan::Free);
    }

    #[test]
    fn citation_omits_missing_document_fields() {
        let c = Citation {
            ref_index: 1,
            chunk_id: "c1".into(),
            page: 2,
            bboxes: vec![],
            text_snippet: "snip".into(),
            offset: 7,
            document_id: None,
            document_filename: None,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert!(json.get("document_id").is_none());
        assert_eq!(json["offset"], 7);
    }
}
