//! Persistence interfaces consumed by the services.
//!
//! Three traits split the relational surface by concern:
//!
//! | Trait | Used by |
//! |-------|---------|
//! | [`DocumentStore`] | ingestion, retrieval, teardown |
//! | [`ChatStore`] | chat orchestrator |
//! | [`AccountStore`] | credit ledger |
//!
//! [`SqliteStore`] implements all three over one pool; [`MemoryStore`] is a
//! lock-guarded in-process version for tests.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{
    ChatSession, Chunk, Document, DocumentStatus, LedgerEntry, Message, Page, UsageRecord, User,
};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<()>;
    async fn get_document(&self, id: &str) -> Result<Option<Document>>;
    /// Overwrite status, counters and flags.
    async fn update_document(&self, doc: &Document) -> Result<()>;
    async fn replace_pages(&self, document_id: &str, pages: &[Page]) -> Result<()>;
    /// Delete every existing chunk of the document, then insert `chunks`.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;
    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;
    /// Chunks by id in no particular order. Unknown ids are skipped.
    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>>;
    /// Pairs of `(chunk_id, vector_id)`.
    async fn set_vector_ids(&self, ids: &[(String, String)]) -> Result<()>;
    async fn documents_with_status(&self, statuses: &[DocumentStatus]) -> Result<Vec<Document>>;
    /// Remove messages, sessions, collection links, chunks, pages and the
    /// document row in one transaction.
    async fn delete_document_cascade(&self, document_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self, session: &ChatSession) -> Result<()>;
    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>>;
    async fn set_session_title(&self, id: &str, title: &str) -> Result<()>;
    async fn create_collection(
        &self,
        id: &str,
        user_id: Option<&str>,
        name: &str,
        document_ids: &[String],
    ) -> Result<()>;
    async fn append_message(&self, message: &Message) -> Result<()>;
    /// Overwrite content, citations, usage and continuation count, but only
    /// while the stored continuation count is still `expected_count`.
    /// Returns false when another writer updated the message first.
    async fn update_message(&self, message: &Message, expected_count: i64) -> Result<bool>;
    async fn get_message(&self, id: &str) -> Result<Option<Message>>;
    /// The last `limit` messages of a session, oldest first.
    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn create_user(&self, user: &User) -> Result<()>;
    async fn get_user(&self, id: &str) -> Result<Option<User>>;

    /// Conditional decrement: applies only when the balance covers
    /// `amount`, and appends the matching ledger entry atomically. `None`
    /// when the balance is short or the user is unknown.
    async fn debit(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        ref_type: Option<&str>,
        ref_id: Option<&str>,
    ) -> Result<Option<LedgerEntry>>;

    /// Unconditional increment with a ledger entry. `None` when the
    /// `(user, ref_type, ref_id)` triple was already applied.
    async fn credit(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        ref_type: Option<&str>,
        ref_id: Option<&str>,
    ) -> Result<Option<LedgerEntry>>;

    /// Undo a ledger entry: restore its delta and delete it, atomically.
    /// Returns false if the entry does not exist.
    async fn revert_entry(&self, entry_id: &str) -> Result<bool>;

    async fn has_entry_since(
        &self,
        user_id: &str,
        reason: &str,
        since: DateTime<Utc>,
    ) -> Result<bool>;

    async fn set_monthly_granted_at(&self, user_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Claim the monthly grant period: moves `monthly_credits_granted_at` to
    /// `now` only if it is unset or at or before `due_before`, and in the
    /// same transaction credits `amount` (when positive) with a ledger
    /// entry. Returns false when another caller already claimed the period.
    async fn claim_monthly_grant(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        due_before: DateTime<Utc>,
        amount: i64,
        reason: &str,
    ) -> Result<bool>;

    /// Ledger entries oldest first.
    async fn ledger(&self, user_id: &str) -> Result<Vec<LedgerEntry>>;

    async fn record_usage(&self, usage: &UsageRecord) -> Result<()>;
}

/// Object ids are UUID v4 strings.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
