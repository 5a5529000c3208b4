use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::{new_id, now_millis, AccountStore, ChatStore, DocumentStore};
use crate::models::{
    BBox, ChatSession, Chunk, Citation, Document, DocumentStatus, LedgerEntry, Message, Page, Plan,
    Role, SessionScope, UsageRecord, User,
};

/// All three store traits over one SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    Ok(Document {
        id: row.get("id"),
        user_id: row.get("user_id"),
        filename: row.get("filename"),
        content_type: row.get("content_type"),
        storage_key: row.get("storage_key"),
        status: status.parse()?,
        error_msg: row.get("error_msg"),
        page_count: row.get("page_count"),
        pages_parsed: row.get("pages_parsed"),
        chunks_total: row.get("chunks_total"),
        chunks_indexed: row.get("chunks_indexed"),
        custom_instructions: row.get("custom_instructions"),
        is_demo: row.get::<i64, _>("is_demo") != 0,
        recovery_attempted: row.get::<i64, _>("recovery_attempted") != 0,
        created_at: row.get("created_at"),
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let bboxes: String = row.get("bboxes");
    let bboxes: Vec<BBox> =
        serde_json::from_str(&bboxes).with_context(|| "Invalid bboxes JSON in chunks table")?;
    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        text: row.get("text"),
        token_count: row.get("token_count"),
        page_start: row.get::<i64, _>("page_start") as u32,
        page_end: row.get::<i64, _>("page_end") as u32,
        bboxes,
        section_title: row.get("section_title"),
        vector_id: row.get("vector_id"),
    })
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let role: String = row.get("role");
    let citations: String = row.get("citations");
    let citations: Vec<Citation> = serde_json::from_str(&citations)
        .with_context(|| "Invalid citations JSON in messages table")?;
    Ok(Message {
        id: row.get("id"),
        session_id: row.get("session_id"),
        role: Role::parse(&role),
        content: row.get("content"),
        citations,
        prompt_tokens: row.get("prompt_tokens"),
        output_tokens: row.get("output_tokens"),
        continuation_count: row.get("continuation_count"),
        created_at: row.get("created_at"),
    })
}

fn row_to_ledger(row: &SqliteRow) -> LedgerEntry {
    LedgerEntry {
        id: row.get("id"),
        user_id: row.get("user_id"),
        delta: row.get("delta"),
        balance_after: row.get("balance_after"),
        reason: row.get("reason"),
        ref_type: row.get("ref_type"),
        ref_id: row.get("ref_id"),
        created_at: millis_to_datetime(row.get("created_at")),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, user_id, filename, content_type, storage_key, status, error_msg,
                page_count, pages_parsed, chunks_total, chunks_indexed, custom_instructions, is_demo,
                recovery_attempted, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.user_id)
        .bind(&doc.filename)
        .bind(&doc.content_type)
        .bind(&doc.storage_key)
        .bind(doc.status.as_str())
        .bind(&doc.error_msg)
        .bind(doc.page_count)
        .bind(doc.pages_parsed)
        .bind(doc.chunks_total)
        .bind(doc.chunks_indexed)
        .bind(&doc.custom_instructions)
        .bind(doc.is_demo as i64)
        .bind(doc.recovery_attempted as i64)
        .bind(doc.created_at)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents SET status = ?, error_msg = ?, page_count = ?, pages_parsed = ?,
                chunks_total = ?, chunks_indexed = ?, custom_instructions = ?,
                recovery_attempted = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(doc.status.as_str())
        .bind(&doc.error_msg)
        .bind(doc.page_count)
        .bind(doc.pages_parsed)
        .bind(doc.chunks_total)
        .bind(doc.chunks_indexed)
        .bind(&doc.custom_instructions)
        .bind(doc.recovery_attempted as i64)
        .bind(now_millis())
        .bind(&doc.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_pages(&self, document_id: &str, pages: &[Page]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pages WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for page in pages {
            sqlx::query(
                r#"
                INSERT INTO pages (id, document_id, page_number, width_pt, height_pt, rotation, text, section_title)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(new_id())
            .bind(document_id)
            .bind(page.page_number as i64)
            .bind(page.width as f64)
            .bind(page.height as f64)
            .bind(page.rotation as i64)
            .bind(page.text())
            .bind(&page.section_title)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_index, text, token_count, page_start,
                    page_end, bboxes, section_title, vector_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(&chunk.text)
            .bind(chunk.token_count)
            .bind(chunk.page_start as i64)
            .bind(chunk.page_end as i64)
            .bind(serde_json::to_string(&chunk.bboxes)?)
            .bind(&chunk.section_title)
            .bind(&chunk.vector_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn get_chunks(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM chunks WHERE id IN ({})",
            placeholders(ids.len())
        );
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn set_vector_ids(&self, ids: &[(String, String)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (chunk_id, vector_id) in ids {
            sqlx::query("UPDATE chunks SET vector_id = ? WHERE id = ?")
                .bind(vector_id)
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn documents_with_status(&self, statuses: &[DocumentStatus]) -> Result<Vec<Document>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM documents WHERE status IN ({}) ORDER BY created_at",
            placeholders(statuses.len())
        );
        let mut q = sqlx::query(&sql);
        for s in statuses {
            q = q.bind(s.as_str());
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_document).collect()
    }

    async fn delete_document_cascade(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM messages WHERE session_id IN (SELECT id FROM sessions WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM sessions WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collection_documents WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pages WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_session(&self, session: &ChatSession) -> Result<()> {
        let (document_id, collection_id) = match &session.scope {
            SessionScope::Document(id) => (Some(id.clone()), None),
            SessionScope::Collection { collection_id, .. } => (None, Some(collection_id.clone())),
        };
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO sessions (id, user_id, document_id, collection_id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(document_id)
        .bind(collection_id)
        .bind(&session.title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        let Some(row) = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let document_id: Option<String> = row.get("document_id");
        let collection_id: Option<String> = row.get("collection_id");
        let scope = match (document_id, collection_id) {
            (Some(doc), _) => SessionScope::Document(doc),
            (None, Some(collection_id)) => {
                let document_ids: Vec<String> = sqlx::query_scalar(
                    "SELECT document_id FROM collection_documents WHERE collection_id = ? ORDER BY document_id",
                )
                .bind(&collection_id)
                .fetch_all(&self.pool)
                .await?;
                SessionScope::Collection {
                    collection_id,
                    document_ids,
                }
            }
            (None, None) => anyhow::bail!("session {} has neither document nor collection", id),
        };

        Ok(Some(ChatSession {
            id: row.get("id"),
            user_id: row.get("user_id"),
            scope,
            title: row.get("title"),
        }))
    }

    async fn set_session_title(&self, id: &str, title: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_collection(
        &self,
        id: &str,
        user_id: Option<&str>,
        name: &str,
        document_ids: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO collections (id, user_id, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(user_id)
            .bind(name)
            .bind(now_millis())
            .execute(&mut *tx)
            .await?;
        for doc in document_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO collection_documents (collection_id, document_id) VALUES (?, ?)",
            )
            .bind(id)
            .bind(doc)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn append_message(&self, message: &Message) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, role, content, citations, prompt_tokens,
                output_tokens, continuation_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(serde_json::to_string(&message.citations)?)
        .bind(message.prompt_tokens)
        .bind(message.output_tokens)
        .bind(message.continuation_count)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_message(&self, message: &Message, expected_count: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE messages SET content = ?, citations = ?, prompt_tokens = ?, output_tokens = ?,
                continuation_count = ?
            WHERE id = ? AND continuation_count = ?
            "#,
        )
        .bind(&message.content)
        .bind(serde_json::to_string(&message.citations)?)
        .bind(message.prompt_tokens)
        .bind(message.output_tokens)
        .bind(message.continuation_count)
        .bind(&message.id)
        .bind(expected_count)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn recent_messages(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut messages = rows.iter().map(row_to_message).collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, plan, credits_balance, monthly_credits_granted_at, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(user.plan.as_str())
        .bind(user.credits_balance)
        .bind(user.monthly_credits_granted_at.map(|t| t.timestamp_millis()))
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| {
            let plan: String = row.get("plan");
            let granted: Option<i64> = row.get("monthly_credits_granted_at");
            User {
                id: row.get("id"),
                plan: Plan::parse(&plan),
                credits_balance: row.get("credits_balance"),
                monthly_credits_granted_at: granted.map(millis_to_datetime),
            }
        }))
    }

    async fn debit(
        &self,
        user_id: &str,
        amount: i64,
        reason: &str,
        ref_type: Option<&str>,
        ref_id: Option<&str>,
    ) -> Result<Option<LedgerEntry>> {
        let mut tx = self.pool.begin().await?;
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET credits_balance = credits_balance - ? \
             WHERE id = ? AND credits_balance >= ? RETURNING credits_balance",
        )
        .bind(amount)
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance_after) = balance else {
            tx.rollback().await?;
            return Ok(None);
        };

        let entry = LedgerEntry {
            id: new_id(),
            user_id: user_id.to_string(),
            delta: -amount,
            balance_after,
            reason: reason.to_string(),
            ref_type: ref_type.map(str::to_string),
            ref_id: ref_id.map(str::to_string),
            created_at: Utc::now(),
        };
        insert_ledger(&mut tx, &entry).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET credits_balance = credits_balance + ? WHERE id = ? RETURNING credits_balance",
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance_after) = balance else {
            tx.rollback().await?;
            anyhow::bail!("user not found: {}", user_id);
        };

        let entry = LedgerEntry {
            id: new_id(),
            user_id: user_id.to_string(),
            delta: amount,
            balance_after,
            reason: reason.to_string(),
            ref_type: ref_type.map(str::to_string),
            ref_id: ref_id.map(str::to_string),
            created_at: Utc::now(),
        };
        match insert_ledger(&mut tx, &entry).await {
            Ok(()) => {}
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit().await?;
        Ok(Some(entry))
    }

    async fn revert_entry(&self, entry_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed: Option<(String, i64)> =
            sqlx::query_as("DELETE FROM credit_ledger WHERE id = ? RETURNING user_id, delta")
                .bind(entry_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((user_id, delta)) = removed else {
            tx.rollback().await?;
            return Ok(false);
        };
        sqlx::query("UPDATE users SET credits_balance = credits_balance - ? WHERE id = ?")
            .bind(delta)
            .bind(&user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn has_entry_since(
        &self,
        user_id: &str,
        reason: &str,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM credit_ledger WHERE user_id = ? AND reason = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(reason)
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn set_monthly_granted_at(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE users SET monthly_credits_granted_at = ? WHERE id = ?")
            .bind(at.timestamp_millis())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
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
        let amount = amount.max(0);
        let mut tx = self.pool.begin().await?;
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE users SET monthly_credits_granted_at = ?, credits_balance = credits_balance + ? \
             WHERE id = ? AND (monthly_credits_granted_at IS NULL OR monthly_credits_granted_at <= ?) \
             RETURNING credits_balance",
        )
        .bind(now.timestamp_millis())
        .bind(amount)
        .bind(user_id)
        .bind(due_before.timestamp_millis())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance_after) = balance else {
            tx.rollback().await?;
            return Ok(false);
        };

        if amount > 0 {
            let entry = LedgerEntry {
                id: new_id(),
                user_id: user_id.to_string(),
                delta: amount,
                balance_after,
                reason: reason.to_string(),
                ref_type: None,
                ref_id: None,
                created_at: now,
            };
            insert_ledger(&mut tx, &entry).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn ledger(&self, user_id: &str) -> Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM credit_ledger WHERE user_id = ? ORDER BY created_at, rowid",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_ledger).collect())
    }

    async fn record_usage(&self, usage: &UsageRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_records (id, user_id, message_id, model, prompt_tokens,
                completion_tokens, total_tokens, cost_credits, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(new_id())
        .bind(&usage.user_id)
        .bind(&usage.message_id)
        .bind(&usage.model)
        .bind(usage.prompt_tokens)
        .bind(usage.completion_tokens)
        .bind(usage.prompt_tokens + usage.completion_tokens)
        .bind(usage.cost_credits)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn insert_ledger(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    entry: &LedgerEntry,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO credit_ledger (id, user_id, delta, balance_after, reason, ref_type, ref_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.user_id)
    .bind(entry.delta)
    .bind(entry.balance_after)
    .bind(&entry.reason)
    .bind(&entry.ref_type)
    .bind(&entry.ref_id)
    .bind(entry.created_at.timestamp_millis())
    .execute(&mut **tx)
    .await?;
    Ok(())
}
