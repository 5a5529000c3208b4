//! Document ingestion pipeline.
//!
//! Coordinates the full flow for one document: object store → extraction →
//! scanned check (+OCR) → pages → chunking → embedding → vector index.
//! Progress is written back to the document row after each stage so a
//! restart can tell where a document stopped.
//!
//! Status transitions: `parsing` → `embedding` → `ready`, or `error` with a
//! message from any stage. Documents found in `parsing` or `embedding` at
//! startup are re-dispatched once by [`IngestPipeline::recover_stuck`].

use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::{chunk_pages, is_scanned};
use crate::config::{ChunkingConfig, Config};
use crate::embedding::Embedder;
use crate::error::{ExtractError, ParseError};
use crate::extract::{extract_format, DocFormat};
use crate::models::{Chunk, Document, DocumentStatus, Page};
use crate::ocr::OcrEngine;
use crate::storage::{storage_key, ObjectStore};
use crate::store::{new_id, now_millis, DocumentStore};
use crate::vector_index::{VectorIndex, VectorPoint};

/// Outcome of [`IngestPipeline::recover_stuck`].
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub redispatched: Vec<String>,
    pub failed: Vec<String>,
}

pub struct IngestPipeline {
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    ocr: Arc<dyn OcrEngine>,
    chunking: ChunkingConfig,
    batch_size: usize,
    batch_delay: Duration,
}

impl IngestPipeline {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        ocr: Arc<dyn OcrEngine>,
        config: &Config,
    ) -> Self {
        Self {
            documents,
            objects,
            embedder,
            index,
            ocr,
            chunking: config.chunking.clone(),
            batch_size: config.embedding.batch_size.max(1),
            batch_delay: Duration::from_millis(config.embedding.batch_delay_ms),
        }
    }

    /// Store the bytes and create the document row in `parsing`.
    pub async fn upload(
        &self,
        user_id: Option<&str>,
        filename: &str,
        content_type: Option<&str>,
        bytes: &[u8],
    ) -> Result<Document> {
        let format = DocFormat::detect(content_type.unwrap_or(""), filename)
            .ok_or_else(|| {
                ExtractError::UnsupportedContentType(
                    content_type.unwrap_or(filename).to_string(),
                )
            })?;
        let id = new_id();
        let key = storage_key(&id, filename);
        self.objects.put(&key, bytes).await?;

        let doc = Document {
            id,
            user_id: user_id.map(str::to_string),
            filename: filename.to_string(),
            content_type: format.mime().to_string(),
            storage_key: key,
            status: DocumentStatus::Parsing,
            error_msg: None,
            page_count: 0,
            pages_parsed: 0,
            chunks_total: 0,
            chunks_indexed: 0,
            custom_instructions: None,
            is_demo: false,
            recovery_attempted: false,
            created_at: now_millis(),
        };
        self.documents.insert_document(&doc).await?;
        tracing::info!(document_id = %doc.id, filename, bytes = bytes.len(), "document uploaded");
        Ok(doc)
    }

    /// Upload and process a file from disk.
    pub async fn ingest_file(&self, user_id: Option<&str>, path: &Path) -> Result<Document> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("document");
        let doc = self.upload(user_id, filename, None, &bytes).await?;
        self.process(&doc.id).await
    }

    /// Run the pipeline for one document. Stage failures are recorded on
    /// the document (status `error`); the returned row reflects the final
    /// state. `Err` only when the document cannot be loaded or updated.
    pub async fn process(&self, document_id: &str) -> Result<Document> {
        let Some(mut doc) = self.documents.get_document(document_id).await? else {
            bail!("document not found: {}", document_id);
        };
        match self.run(&mut doc).await {
            Ok(()) => {
                doc.status = DocumentStatus::Ready;
                doc.error_msg = None;
                self.documents.update_document(&doc).await?;
                tracing::info!(
                    document_id = %doc.id,
                    pages = doc.page_count,
                    chunks = doc.chunks_total,
                    "document ready"
                );
            }
            Err(e) => {
                tracing::warn!(document_id = %doc.id, error = %e, "document processing failed");
                doc.status = DocumentStatus::Error;
                doc.error_msg = Some(e.to_string());
                self.documents.update_document(&doc).await?;
            }
        }
        Ok(doc)
    }

    async fn run(&self, doc: &mut Document) -> Result<()> {
        doc.status = DocumentStatus::Parsing;
        self.documents.update_document(doc).await?;

        let bytes = self
            .objects
            .get(&doc.storage_key)
            .await
            .map_err(|e| ParseError::Load(e.to_string()))?;
        let pages = self.parse(doc, bytes).await?;

        self.documents.replace_pages(&doc.id, &pages).await?;
        doc.pages_parsed = pages.len() as i64;
        self.documents.update_document(doc).await?;

        let chunks = chunk_pages(&doc.id, &pages, &self.chunking);
        if chunks.is_empty() {
            return Err(ParseError::Empty.into());
        }
        self.documents.replace_chunks(&doc.id, &chunks).await?;
        doc.chunks_total = chunks.len() as i64;
        doc.chunks_indexed = 0;
        doc.status = DocumentStatus::Embedding;
        self.documents.update_document(doc).await?;

        self.embed_chunks(doc, &chunks).await
    }

    /// Extract pages, falling back to OCR for scanned PDFs.
    async fn parse(&self, doc: &mut Document, bytes: Vec<u8>) -> Result<Vec<Page>, ParseError> {
        let format = DocFormat::detect(&doc.content_type, &doc.filename)
            .ok_or_else(|| ExtractError::UnsupportedContentType(doc.content_type.clone()))?;
        let split = self.chunking.page_split_chars;
        let (bytes, extracted) = tokio::task::spawn_blocking(move || {
            let extracted = extract_format(&bytes, format, split);
            (bytes, extracted)
        })
        .await
        .map_err(|e| ParseError::Load(format!("extraction task failed: {}", e)))?;
        let pages = extracted?;
        doc.page_count = pages.len() as i64;

        if format != DocFormat::Pdf || !is_scanned(&pages, &self.chunking) {
            return Ok(pages);
        }

        tracing::info!(document_id = %doc.id, pages = pages.len(), "scanned PDF; trying OCR");
        let recognized = self
            .ocr
            .recognize(&bytes)
            .await
            .map_err(|e| ParseError::Load(format!("OCR failed: {}", e)))?;
        let chars: usize = recognized.iter().map(|p| p.char_count()).sum();
        if chars < self.chunking.low_text_chars {
            return Err(ParseError::Scanned);
        }
        doc.page_count = recognized.len() as i64;
        Ok(recognized)
    }

    /// Embed in fixed-size batches with a pause between batches. Old
    /// vectors for the document are dropped first.
    async fn embed_chunks(&self, doc: &mut Document, chunks: &[Chunk]) -> Result<()> {
        self.index.delete_document(&doc.id).await?;

        let batches: Vec<&[Chunk]> = chunks.chunks(self.batch_size).collect();
        let total = batches.len();
        for (i, batch) in batches.into_iter().enumerate() {
            if i > 0 && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                bail!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                );
            }

            let points: Vec<VectorPoint> = batch
                .iter()
                .zip(vectors)
                .map(|(c, vector)| VectorPoint {
                    chunk_id: c.id.clone(),
                    document_id: c.document_id.clone(),
                    chunk_index: c.chunk_index,
                    page_start: c.page_start,
                    vector,
                })
                .collect();
            self.index.upsert(&points).await?;

            let ids: Vec<(String, String)> = batch
                .iter()
                .map(|c| (c.id.clone(), c.id.clone()))
                .collect();
            self.documents.set_vector_ids(&ids).await?;

            doc.chunks_indexed += batch.len() as i64;
            self.documents.update_document(doc).await?;
            tracing::debug!(
                document_id = %doc.id,
                batch = i + 1,
                batches = total,
                indexed = doc.chunks_indexed,
                "embedded batch"
            );
        }
        Ok(())
    }

    /// Re-dispatch documents left mid-pipeline by a restart. Each document
    /// gets one retry; a second interruption marks it as errored.
    pub async fn recover_stuck(&self) -> Result<RecoveryReport> {
        let stuck = self
            .documents
            .documents_with_status(&[DocumentStatus::Parsing, DocumentStatus::Embedding])
            .await?;
        let mut report = RecoveryReport::default();

        for mut doc in stuck {
            if doc.recovery_attempted {
                tracing::warn!(document_id = %doc.id, status = %doc.status, "document stuck after recovery; giving up");
                doc.status = DocumentStatus::Error;
                doc.error_msg = Some("processing was interrupted twice".to_string());
                self.documents.update_document(&doc).await?;
                report.failed.push(doc.id);
                continue;
            }
            tracing::info!(document_id = %doc.id, status = %doc.status, "re-dispatching stuck document");
            doc.recovery_attempted = true;
            self.documents.update_document(&doc).await?;
            let processed = self.process(&doc.id).await?;
            if processed.status == DocumentStatus::Ready {
                report.redispatched.push(processed.id);
            } else {
                report.failed.push(processed.id);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::DisabledOcr;
    use crate::storage::MemoryObjectStore;
    use crate::store::MemoryStore;
    use crate::vector_index::InMemoryVectorIndex;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> usize {
            3
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0, 0.5])
                .collect())
        }
    }

    struct Setup {
        pipeline: IngestPipeline,
        store: Arc<MemoryStore>,
        index: Arc<InMemoryVectorIndex>,
        embedder: Arc<CountingEmbedder>,
    }

    fn setup(batch_size: usize, embedder_enabled: bool) -> Setup {
        let store = Arc::new(MemoryStore::new());
        let index = Arc::new(InMemoryVectorIndex::new());
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let mut config = crate::config::parse_config("[db]\npath = \"unused.sqlite\"\n").unwrap();
        config.embedding.batch_size = batch_size;
        config.embedding.batch_delay_ms = 0;
        let embed: Arc<dyn Embedder> = if embedder_enabled {
            embedder.clone() as Arc<dyn Embedder>
        } else {
            Arc::new(crate::embedding::DisabledEmbedder)
        };
        let pipeline = IngestPipeline::new(
            store.clone(),
            Arc::new(MemoryObjectStore::new()),
            embed,
            index.clone(),
            Arc::new(DisabledOcr),
            &config,
        );
        Setup {
            pipeline,
            store,
            index,
            embedder,
        }
    }

    fn long_markdown() -> String {
        let mut md = String::from("# Annual Report\n\n");
        for i in 0..40 {
            md.push_str(&format!(
                "Paragraph {i} explains how revenue and margins developed over the fiscal year. \
                 The company expanded into new markets and improved operating efficiency.\n\n"
            ));
        }
        md
    }

    #[tokio::test]
    async fn markdown_document_becomes_ready() {
        let s = setup(4, true);
        let doc = s
            .pipeline
            .upload(Some("u1"), "report.md", None, long_markdown().as_bytes())
            .await
            .unwrap();
        assert_eq!(doc.status, DocumentStatus::Parsing);
        assert_eq!(doc.content_type, "text/markdown");

        let doc = s.pipeline.process(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready, "{:?}", doc.error_msg);
        assert!(doc.chunks_total > 1);
        assert_eq!(doc.chunks_indexed, doc.chunks_total);
        assert_eq!(doc.pages_parsed, doc.page_count);
        assert_eq!(s.index.len() as i64, doc.chunks_total);

        let expected_batches = (doc.chunks_total as usize).div_ceil(4);
        assert_eq!(s.embedder.calls.load(Ordering::SeqCst), expected_batches);

        let chunks = s.store.list_chunks(&doc.id).await.unwrap();
        assert!(chunks.iter().all(|c| c.vector_id.as_deref() == Some(c.id.as_str())));
        assert_eq!(s.store.page_count(&doc.id) as i64, doc.page_count);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn embedding_failure_marks_error() {
        let s = setup(8, false);
        let doc = s
            .pipeline
            .upload(None, "notes.txt", Some("text/plain"), long_markdown().as_bytes())
            .await
            .unwrap();
        let doc = s.pipeline.process(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Error);
        assert!(doc.error_msg.unwrap().contains("disabled"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrupt_pdf_marks_error() {
        let s = setup(8, true);
        let doc = s
            .pipeline
            .upload(None, "broken.pdf", Some("application/pdf"), b"%PDF-1.4 garbage")
            .await
            .unwrap();
        let doc = s.pipeline.process(&doc.id).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Error);
        assert!(doc.error_msg.is_some());
    }

    #[tokio::test]
    async fn unsupported_upload_is_rejected() {
        let s = setup(8, true);
        assert!(s
            .pipeline
            .upload(None, "image.png", Some("image/png"), b"\x89PNG")
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stuck_documents_are_redispatched_once() {
        let s = setup(8, true);
        let first = s
            .pipeline
            .upload(None, "a.md", None, long_markdown().as_bytes())
            .await
            .unwrap();
        let mut second = s
            .pipeline
            .upload(None, "b.md", None, long_markdown().as_bytes())
            .await
            .unwrap();
        second.status = DocumentStatus::Embedding;
        second.recovery_attempted = true;
        s.store.update_document(&second).await.unwrap();

        let report = s.pipeline.recover_stuck().await.unwrap();
        assert_eq!(report.redispatched, vec![first.id.clone()]);
        assert_eq!(report.failed, vec![second.id.clone()]);

        let first = s.store.get_document(&first.id).await.unwrap().unwrap();
        assert_eq!(first.status, DocumentStatus::Ready);
        assert!(first.recovery_attempted);
        let second = s.store.get_document(&second.id).await.unwrap().unwrap();
        assert_eq!(second.status, DocumentStatus::Error);
    }
}
