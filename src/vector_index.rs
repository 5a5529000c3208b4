//! Nearest-neighbour index over chunk vectors.
//!
//! The index is keyed by chunk id and carries the owning document id so
//! queries can be restricted to a single document or a collection.
//! [`SqliteVectorIndex`] stores vectors as BLOBs in `chunk_vectors` and scans
//! them with cosine similarity; [`InMemoryVectorIndex`] does the same in a
//! `RwLock`ed map for tests.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub page_start: u32,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace points by chunk id.
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()>;

    /// Top `limit` points by similarity, restricted to `document_ids`.
    async fn query(
        &self,
        vector: &[f32],
        document_ids: &[String],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>>;

    async fn delete_document(&self, document_id: &str) -> Result<()>;
}

fn rank(mut scored: Vec<ScoredPoint>, limit: usize) -> Vec<ScoredPoint> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored.truncate(limit);
    scored
}

pub struct SqliteVectorIndex {
    pool: SqlitePool,
    model: String,
}

impl SqliteVectorIndex {
    pub fn new(pool: SqlitePool, model: impl Into<String>) -> Self {
        Self {
            pool,
            model: model.into(),
        }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for p in points {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, document_id, chunk_index, page_start, model, dims, embedding, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    chunk_index = excluded.chunk_index,
                    page_start = excluded.page_start,
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    created_at = excluded.created_at
                "#,
            )
            .bind(&p.chunk_id)
            .bind(&p.document_id)
            .bind(p.chunk_index)
            .bind(p.page_start as i64)
            .bind(&self.model)
            .bind(p.vector.len() as i64)
            .bind(vec_to_blob(&p.vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        document_ids: &[String],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        if document_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; document_ids.len()].join(", ");
        let sql = format!(
            "SELECT chunk_id, document_id, embedding FROM chunk_vectors WHERE document_id IN ({})",
            placeholders
        );
        let mut q = sqlx::query(&sql);
        for id in document_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let scored = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                ScoredPoint {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    score: cosine_similarity(vector, &blob_to_vec(&blob)),
                }
            })
            .collect();
        Ok(rank(scored, limit))
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryVectorIndex {
    points: RwLock<HashMap<String, VectorPoint>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(&self, points: &[VectorPoint]) -> Result<()> {
        let mut map = self
            .points
            .write()
            .map_err(|_| anyhow::anyhow!("vector index lock poisoned"))?;
        for p in points {
            map.insert(p.chunk_id.clone(), p.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        document_ids: &[String],
        limit: usize,
    ) -> Result<Vec<ScoredPoint>> {
        let map = self
            .points
            .read()
            .map_err(|_| anyhow::anyhow!("vector index lock poisoned"))?;
        let scored = map
            .values()
            .filter(|p| document_ids.contains(&p.document_id))
            .map(|p| ScoredPoint {
                chunk_id: p.chunk_id.clone(),
                document_id: p.document_id.clone(),
                score: cosine_similarity(vector, &p.vector),
            })
            .collect();
        Ok(rank(scored, limit))
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        let mut map = self
            .points
            .write()
            .map_err(|_| anyhow::anyhow!("vector index lock poisoned"))?;
        map.retain(|_, p| p.document_id != document_id);
        Ok(())
    }
}
