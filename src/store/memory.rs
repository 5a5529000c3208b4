use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{new_id, AccountStore, ChatStore, DocumentStore};
use crate::models::{
    ChatSession, Chunk, Document, DocumentStatus, LedgerEntry, Message, Page, SessionScope,
    UsageRecord, User,
};

#[derive(Default)]
struct State {
    documents: HashMap<String, Document>,
    pages: HashMap<String, Vec<Page>>,
    chunks: HashMap<String, Vec<Chunk>>,
    collections: HashMap<String, Vec<String>>,
    sessions: HashMap<String, ChatSession>,
    messages: Vec<Message>,
    users: HashMap<String, User>,
    ledger: Vec<LedgerEntry>,
    usage: Vec<UsageRecord>,
}

/// In-process store for tests. One mutex guards all tables, so every
/// operation is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.lock().map(|s| s.usage.clone()).unwrap_or_default()
    }

    pub fn page_count(&self, document_id: &str) -> usize {
        self.lock()
            .map(|s| s.pages.get(document_id).map(|p| p.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

fn is_idempotent_ref(ref_type: Option<&str>) -> bool {
    ref_type
        .map(|t| crate::migrate::IDEMPOTENT_REF_TYPES.contains(&t))
        .unwrap_or(false)
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        self.lock()?.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.lock()?.documents.get(id).cloned())
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(existing) = state.documents.get_mut(&doc.id) {
            *existing = doc.clone();
        }
        Ok(())
    }

    async fn replace_pages(&self, document_id: &str, pages: &[Page]) -> Result<()> {
        self.lock()?
            .pages
            .insert(document_id.to_string(), pages.to_vec());
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.lock()?
            .chunks
            .insert(document_id.to_string(), chunks.to_vec());
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        Ok(self
            .lock()?
            .chunks
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let state = self.lock()?;
        Ok(state
            .chunks
            .values()
            .flatten()
            .filter(|c| wanted.contains(c.id.as_str()))
            .cloned()
            .collect())
    }

    async fn set_vector_ids(&self, ids: &[(String, String)]) -> Result<()> {
        let map: HashMap<&str, &str> = ids
            .iter()
            .map(|(c, v)| (c.as_str(), v.as_str()))
            .collect();
        let mut state = self.lock()?;
        for chunk in state.chunks.values_mut().flatten() {
            if let Some(v) = map.get(chunk.id.as_str()) {
                chunk.vector_id = Some(v.to_string());
            }
        }
        Ok(())
    }

    async fn documents_with_status(&self, statuses: &[DocumentStatus]) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .lock()?
            .documents
            .values()
            .filter(|d| statuses.contains(&d.status))
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.created_at);
        Ok(docs)
    }

    async fn delete_document_cascade(&self, document_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        let session_ids: HashSet<String> = state
            .sessions
            .values()
            .filter(|s| s.scope == SessionScope::Document(document_id.to_string()))
            .map(|s| s.id.clone())
            .collect();
        state.messages.retain(|m| !session_ids.contains(&m.session_id));
        state.sessions.retain(|id, _| !session_ids.contains(id));
        for docs in state.collections.values_mut() {
            docs.retain(|d| d != document_id);
        }
        state.chunks.remove(document_id);
        state.pages.remove(document_id);
        state.documents.remove(document_id);
        Ok(())
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_session(&self, session: &ChatSession) -> Result<()> {
        self.lock()?
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        let state = self.lock()?;
        Ok(state.sessions.get(id).cloned().map(|mut s| {
            if let SessionScope::Collection {
                collection_id,
                document_ids,
            } = &mut s.scope
            {
                *document_ids = state
                    .collections
                    .get(collection_id.as_str())
                    .cloned()
                    .unwrap_or_default();
            }
            s
        }))
    }

    async fn set_session_title(&self, id: &str, title: &str) -> Result<()> {
        if let Some(s) = self.lock()?.sessions.get_mut(id) {
            s.title = Some(title.to_string());
        }
        Ok(())
    }

    async fn create_collection(
        &self,
        id: &str,
        _user_id: Option<&str>,
        _name: &str,
        document_ids: &[String],
    ) -> Result<()> {
        let mut docs = document_ids.to_vec();
        docs.sort();
        docs.dedup();
        self.lock()?.collections.insert(id.to_string(), docs);
        Ok(())
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        self.lock()?.messages.push(message.clone());
        Ok(())
    }

    async fn update_message(&self, message: &Message, expected_count: i64) -> Result<bool> {
        let mut state = self.lock()?;
        match state
            .messages
            .iter_mut()
            .find(|m| m.id == message.id && m.continuation_count == expected_count)
        {
            Some(m) => {
                *m = message.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        Ok(self.lock()?.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let state = self.lock()?;
        let all: Vec<&Message> = state
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .collect();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).cloned().collect())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn create_user(&self, user: &User) -> Result<()> {
        self.lock()?.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        Ok(self.lock()?.users.get(id).cloned())
    }

    async fn debit(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        ref_type: Option<&str>,
        ref_id: Option<&str>,
    ) -> Result<Option<LedgerEntry>> {
        let mut state = self.lock()?;
        let Some(user) = state.users.get_mut(user_id) else {
            return Ok(None);
        };
        if user.credits_balance < amount {
            return Ok(None);
        }
        user.credits_balance -= amount;
        let entry = LedgerEntry {
            id: new_id(),
            user_id: user_id.to_string(),
            delta: -amount,
            balance_after: user.credits_balance,
            reason: reason.to_string(),
            ref_type: ref_type.map(str::to_string),
            ref_id: ref_id.map(str::to_string),
            created_at: Utc::now(),
        };
        state.ledger.push(entry.clone());
        Ok(Some(entry))
    }

    async fn credit(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        ref_type: Option<&str>,
        ref_id: Option<&str>,
    ) -> Result<Option<LedgerEntry>> {
        let mut state = self.lock()?;
        if is_idempotent_ref(ref_type)
            && state.ledger.iter().any(|e| {
                e.user_id == user_id && e.ref_type.as_deref() == ref_type && e.ref_id.as_deref() == ref_id
            })
        {
            return Ok(None);
        }
        let Some(user) = state.users.get_mut(user_id) else {
            anyhow::bail!("user not found: {}", user_id);
        };
        user.credits_balance += amount;
        let entry = LedgerEntry {
            id: new_id(),
            user_id: user_id.to_string(),
            delta: amount,
            balance_after: user.credits_balance,
            reason: reason.to_string(),
            ref_type: ref_type.map(str::to_string),
            ref_id: ref_id.map(str::to_string),
            created_at: Utc::now(),
        };
        state.ledger.push(entry.clone());
        Ok(Some(entry))
    }

    async fn revert_entry(&self, entry_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(pos) = state.ledger.iter().position(|e| e.id == entry_id) else {
            return Ok(false);
        };
        let entry = state.ledger.remove(pos);
        if let Some(user) = state.users.get_mut(&entry.user_id) {
            user.credits_balance -= entry.delta;
        }
        Ok(true)
    }

    async fn has_entry_since(
        &self,
        user_id: &str,
        reason: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .lock()?
            .ledger
            .iter()
            .any(|e| e.user_id == user_id && e.reason == reason && e.created_at >= since))
    }

    async fn set_monthly_granted_at(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(user) = self.lock()?.users.get_mut(user_id) {
            user.monthly_credits_granted_at = Some(at);
        }
        Ok(())
    }

    async fn claim_monthly_grant(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        due_before: DateTime<Utc>,
        amount: i64,
        reason: &str,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(user) = state.users.get_mut(user_id) else {
            return Ok(false);
        };
        if user
            .monthly_credits_granted_at
            .is_some_and(|last| last > due_before)
        {
            return Ok(false);
        }
        user.monthly_credits_granted_at = Some(now);
        if amount <= 0 {
            return Ok(true);
        }
        user.credits_balance += amount;
        let entry = LedgerEntry {
            id: new_id(),
            user_id: user_id.to_string(),
            delta: amount,
            balance_after: user.credits_balance,
            reason: reason.to_string(),
            ref_type: None,
            ref_id: None,
            created_at: now,
        };
        state.ledger.push(entry);
        Ok(true)
    }

    async fn ledger(&self, user_id: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .lock()?
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn record_usage(&self, usage: &UsageRecord) -> Result<()> {
        self.lock()?.usage.push(usage.clone());
        Ok(())
    }
}
