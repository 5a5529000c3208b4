//! Query-time fragment selection.
//!
//! Over-fetches `top_k × overfetch` candidates from the vector index, loads
//! the chunk bodies, re-sorts by similarity, drops short boilerplate
//! chunks and keeps the first `top_k` survivors.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::{embed_query, Embedder};
use crate::models::{Chunk, RetrievedFragment};
use crate::store::DocumentStore;
use crate::vector_index::VectorIndex;

/// Upper bound on fragments returned by one search.
pub const MAX_TOP_K: usize = 50;

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn DocumentStore>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        store: Arc<dyn DocumentStore>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            store,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Default `top_k` for a single document or a collection.
    pub fn default_top_k(&self, multi: bool) -> usize {
        if multi {
            self.config.multi_doc_top_k
        } else {
            self.config.top_k
        }
    }

    /// Fragments for `query` within `document_ids`, best first. With
    /// `multi`, each fragment is labelled with its document id and filename.
    /// `top_k` is clamped to [`MAX_TOP_K`].
    pub async fn search(
        &self,
        query: &str,
        document_ids: &[String],
        top_k: usize,
        multi: bool,
    ) -> Result<Vec<RetrievedFragment>> {
        if query.trim().is_empty() || document_ids.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let top_k = top_k.min(MAX_TOP_K);
        let vector = embed_query(self.embedder.as_ref(), query).await?;
        let fetch = top_k.saturating_mul(self.config.overfetch.max(1));
        let hits = self.index.query(&vector, document_ids, fetch).await?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let scores: HashMap<String, f32> = hits
            .iter()
            .map(|h| (h.chunk_id.clone(), h.score))
            .collect();
        let ids: Vec<String> = hits.into_iter().map(|h| h.chunk_id).collect();
        let mut chunks = self.store.get_chunks(&ids).await?;
        chunks.sort_by(|a, b| {
            let sa = scores.get(&a.id).copied().unwrap_or(0.0);
            let sb = scores.get(&b.id).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut seen = HashSet::new();
        let selected: Vec<Chunk> = chunks
            .into_iter()
            .filter(|c| c.text.trim().chars().count() >= self.config.min_chunk_text_len)
            .filter(|c| seen.insert(c.id.clone()))
            .take(top_k)
            .collect();

        let filenames = if multi {
            self.filenames(&selected).await?
        } else {
            HashMap::new()
        };

        let fragments: Vec<RetrievedFragment> = selected
            .into_iter()
            .map(|c| {
                let similarity_score = scores.get(&c.id).copied().unwrap_or(0.0);
                let (document_id, document_filename) = if multi {
                    let name = filenames.get(&c.document_id).cloned();
                    (Some(c.document_id.clone()), name)
                } else {
                    (None, None)
                };
                RetrievedFragment {
                    chunk_id: c.id,
                    text: c.text,
                    page: c.page_start,
                    bboxes: c.bboxes,
                    similarity_score,
                    section_title: c.section_title,
                    document_id,
                    document_filename,
                }
            })
            .collect();

        tracing::debug!(
            documents = document_ids.len(),
            fetched = ids.len(),
            returned = fragments.len(),
            "retrieval complete"
        );
        Ok(fragments)
    }

    async fn filenames(&self, chunks: &[Chunk]) -> Result<HashMap<String, String>> {
        let mut names = HashMap::new();
        for chunk in chunks {
            if names.contains_key(&chunk.document_id) {
                continue;
            }
            if let Some(doc) = self.store.get_document(&chunk.document_id).await? {
                names.insert(doc.id, doc.filename);
            }
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::vector_index::{InMemoryVectorIndex, VectorPoint};
    use async_trait::async_trait;

    /// Maps every text to the same direction so similarity is driven by the
    /// stored vectors alone.
    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn chunk(doc: &str, i: i64, text: String) -> Chunk {
        Chunk {
            id: format!("{doc}-c{i}"),
            document_id: doc.into(),
            chunk_index: i,
            text,
            token_count: 10,
            page_start: (i + 1) as u32,
            page_end: (i + 1) as u32,
            bboxes: vec![],
            section_title: None,
            vector_id: None,
        }
    }

    async fn setup(long_indices: &[i64]) -> (Retriever, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(InMemoryVectorIndex::new());
        let mut chunks = Vec::new();
        let mut points = Vec::new();
        for i in 0..20 {
            let text = if long_indices.contains(&i) {
                format!("chunk {i} ") + &"substantive text ".repeat(20)
            } else {
                format!("page {i}")
            };
            chunks.push(chunk("d1", i, text));
            // Higher index, closer to the query direction.
            let angle = (20 - i) as f32 * 0.05;
            points.push(VectorPoint {
                chunk_id: format!("d1-c{i}"),
                document_id: "d1".into(),
                chunk_index: i,
                page_start: (i + 1) as u32,
                vector: vec![angle.cos(), angle.sin()],
            });
        }
        store.replace_chunks("d1", &chunks).await.unwrap();
        index.upsert(&points).await.unwrap();
        let retriever = Retriever::new(
            Arc::new(FixedEmbedder),
            index,
            store.clone(),
            RetrievalConfig::default(),
        );
        (retriever, store)
    }

    #[tokio::test]
    async fn short_chunks_are_filtered_even_below_top_k() {
        let (retriever, _) = setup(&[17, 18, 19]).await;
        let frags = retriever
            .search("question", &["d1".to_string()], 5, false)
            .await
            .unwrap();
        assert_eq!(frags.len(), 3);
        let ids: Vec<&str> = frags.iter().map(|f| f.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["d1-c19", "d1-c18", "d1-c17"]);
        assert!(frags[0].similarity_score >= frags[1].similarity_score);
        assert!(frags.iter().all(|f| f.document_id.is_none()));
    }

    #[tokio::test]
    async fn candidates_outside_overfetch_window_are_not_seen() {
        // Only the best 15 (5 × 3) candidates are fetched; chunk 0 is the worst.
        let (retriever, _) = setup(&[0]).await;
        let frags = retriever
            .search("question", &["d1".to_string()], 5, false)
            .await
            .unwrap();
        assert!(frags.is_empty());
    }

    #[tokio::test]
    async fn missing_chunk_bodies_are_dropped() {
        let (retriever, store) = setup(&[18, 19]).await;
        let remaining: Vec<Chunk> = store
            .list_chunks("d1")
            .await
            .unwrap()
            .into_iter()
            .filter(|c| c.id != "d1-c19")
            .collect();
        store.replace_chunks("d1", &remaining).await.unwrap();
        let frags = retriever
            .search("question", &["d1".to_string()], 5, false)
            .await
            .unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].chunk_id, "d1-c18");
    }

    #[tokio::test]
    async fn multi_mode_labels_documents() {
        use crate::models::{Document, DocumentStatus};
        let (retriever, store) = setup(&[19]).await;
        store
            .insert_document(&Document {
                id: "d1".into(),
                user_id: None,
                filename: "annual.pdf".into(),
                content_type: "application/pdf".into(),
                storage_key: "k".into(),
                status: DocumentStatus::Ready,
                error_msg: None,
                page_count: 20,
                pages_parsed: 20,
                chunks_total: 20,
                chunks_indexed: 20,
                custom_instructions: None,
                is_demo: false,
                recovery_attempted: false,
                created_at: 0,
            })
            .await
            .unwrap();
        let frags = retriever
            .search("question", &["d1".to_string()], 8, true)
            .await
            .unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].document_id.as_deref(), Some("d1"));
        assert_eq!(frags[0].document_filename.as_deref(), Some("annual.pdf"));
    }

    #[tokio::test]
    async fn oversized_top_k_is_clamped() {
        let all: Vec<i64> = (0..20).collect();
        let (retriever, _) = setup(&all).await;
        let frags = retriever
            .search("question", &["d1".to_string()], usize::MAX, false)
            .await
            .unwrap();
        assert_eq!(frags.len(), 20);
        assert_eq!(frags[0].chunk_id, "d1-c19");
    }

    #[tokio::test]
    async fn empty_scope_or_query_returns_nothing() {
        let (retriever, _) = setup(&[19]).await;
        assert!(retriever.search("q", &[], 5, false).await.unwrap().is_empty());
        assert!(retriever
            .search("  ", &["d1".to_string()], 5, false)
            .await
            .unwrap()
            .is_empty());
    }
}
