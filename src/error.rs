//! Error taxonomy for the ingestion, accounting and chat paths.
//!
//! Store and collaborator traits return `anyhow::Result`; the services wrap
//! those failures into the typed errors below so callers can branch on kind.

use thiserror::Error;

/// Extraction failure for a single document. Never panics; the pipeline
/// marks the document as errored.
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),

    #[error("text decoding failed: {0}")]
    Text(String),
}

/// Terminal parse failure. Surfaced as document status `error`.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("could not read document bytes: {0}")]
    Load(String),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("document appears to be scanned and has no usable text layer")]
    Scanned,

    #[error("document produced no text")]
    Empty,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("insufficient credits: balance is below {required}")]
    InsufficientCredits { required: i64 },

    #[error("credit amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("ledger entry not found: {0}")]
    EntryNotFound(String),

    #[error("unknown external reference type: {0}")]
    UnknownRefType(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Failure of a chat turn. Each variant maps to one wire code.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("insufficient credits")]
    InsufficientCredits,

    #[error("mode '{0}' requires a Plus or Pro plan")]
    ModeNotAllowed(String),

    #[error("retrieval failed: {0}")]
    Retrieval(String),

    #[error("model call failed: {0}")]
    Llm(String),

    #[error("failed to persist answer: {0}")]
    Persist(String),

    #[error("accounting discrepancy: {0}")]
    Accounting(String),

    #[error("continuation limit of {0} reached")]
    ContinuationLimit(i64),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            ChatError::InsufficientCredits => "INSUFFICIENT_CREDITS",
            ChatError::ModeNotAllowed(_) => "MODE_NOT_ALLOWED",
            ChatError::Retrieval(_) => "RETRIEVAL_ERROR",
            ChatError::Llm(_) => "LLM_ERROR",
            ChatError::Persist(_) => "PERSIST_FAILED",
            ChatError::Accounting(_) => "ACCOUNTING_ERROR",
            ChatError::ContinuationLimit(_) => "CONTINUATION_LIMIT",
            ChatError::BadRequest(_) => "BAD_REQUEST",
            ChatError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<LedgerError> for ChatError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::InsufficientCredits { .. } => ChatError::InsufficientCredits,
            LedgerError::UserNotFound(id) => ChatError::BadRequest(format!("unknown user: {}", id)),
            other => ChatError::Accounting(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_errors_map_to_wire_codes() {
        assert_eq!(ChatError::SessionNotFound("s".into()).code(), "SESSION_NOT_FOUND");
        assert_eq!(ChatError::ContinuationLimit(3).code(), "CONTINUATION_LIMIT");
        assert_eq!(ChatError::Llm("boom".into()).code(), "LLM_ERROR");
    }

    #[test]
    fn insufficient_credits_converts_to_chat_error() {
        let e: ChatError = LedgerError::InsufficientCredits { required: 40 }.into();
        assert_eq!(e.code(), "INSUFFICIENT_CREDITS");
    }
}
