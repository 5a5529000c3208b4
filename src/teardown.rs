//! Document deletion.
//!
//! The relational rows go in one transaction. Object-store and vector-index
//! cleanup is best-effort: a failure is handed to the [`RetryQueue`], which
//! retries in the background and logs a permanent failure once its retries
//! run out.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::models::DocumentStatus;
use crate::storage::ObjectStore;
use crate::store::DocumentStore;
use crate::vector_index::VectorIndex;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(30);

/// External state that outlives the document row until cleaned up.
#[derive(Debug, Clone, PartialEq)]
pub enum CleanupTask {
    Object { key: String },
    Vectors { document_id: String },
}

impl CleanupTask {
    fn describe(&self) -> String {
        match self {
            CleanupTask::Object { key } => format!("object {}", key),
            CleanupTask::Vectors { document_id } => format!("vectors of {}", document_id),
        }
    }
}

async fn run_task(
    task: &CleanupTask,
    objects: &dyn ObjectStore,
    index: &dyn VectorIndex,
) -> Result<()> {
    match task {
        CleanupTask::Object { key } => objects.delete(key).await,
        CleanupTask::Vectors { document_id } => index.delete_document(document_id).await,
    }
}

/// Background retries for failed cleanups. Retry `n` (0-based) waits
/// `base_delay * 2^n`.
pub struct RetryQueue {
    objects: Arc<dyn ObjectStore>,
    index: Arc<dyn VectorIndex>,
    max_retries: u32,
    base_delay: Duration,
    pending: Mutex<Vec<JoinHandle<bool>>>,
}

impl RetryQueue {
    pub fn new(objects: Arc<dyn ObjectStore>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            objects,
            index,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn with_backoff(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn enqueue(&self, task: CleanupTask) {
        let objects = self.objects.clone();
        let index = self.index.clone();
        let max_retries = self.max_retries;
        let base_delay = self.base_delay;

        let handle = tokio::spawn(async move {
            for retry in 0..max_retries {
                let delay = base_delay * (1u32 << retry.min(16));
                tokio::time::sleep(delay).await;
                match run_task(&task, objects.as_ref(), index.as_ref()).await {
                    Ok(()) => {
                        tracing::info!(task = %task.describe(), retry = retry + 1, "cleanup retry succeeded");
                        return true;
                    }
                    Err(e) => {
                        tracing::warn!(
                            task = %task.describe(),
                            retry = retry + 1,
                            max_retries,
                            error = %e,
                            "cleanup retry failed"
                        );
                    }
                }
            }
            tracing::error!(
                task = %task.describe(),
                "PERMANENT cleanup failure after {} retries; manual cleanup required",
                max_retries
            );
            false
        });

        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
    }

    /// Wait for every queued retry. Returns how many ended in permanent
    /// failure.
    pub async fn drain(&self) -> usize {
        let handles: Vec<JoinHandle<bool>> = match self.pending.lock() {
            Ok(mut pending) => pending.drain(..).collect(),
            Err(_) => return 0,
        };
        let mut failed = 0;
        for handle in handles {
            if !matches!(handle.await, Ok(true)) {
                failed += 1;
            }
        }
        failed
    }
}

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub document_id: String,
    /// Cleanups that failed on the first attempt and were queued.
    pub queued: Vec<CleanupTask>,
}

pub struct DocumentTeardown {
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    index: Arc<dyn VectorIndex>,
    retries: Arc<RetryQueue>,
}

impl DocumentTeardown {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        index: Arc<dyn VectorIndex>,
        retries: Arc<RetryQueue>,
    ) -> Self {
        Self {
            documents,
            objects,
            index,
            retries,
        }
    }

    pub fn retries(&self) -> &Arc<RetryQueue> {
        &self.retries
    }

    /// Delete a document and everything derived from it. Returns `None` when
    /// the document does not exist or belongs to another user.
    pub async fn delete(
        &self,
        document_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<TeardownReport>> {
        let Some(mut doc) = self.documents.get_document(document_id).await? else {
            return Ok(None);
        };
        if let (Some(owner), Some(caller)) = (doc.user_id.as_deref(), user_id) {
            if owner != caller {
                return Ok(None);
            }
        }

        doc.status = DocumentStatus::Deleting;
        self.documents.update_document(&doc).await?;

        let mut report = TeardownReport {
            document_id: doc.id.clone(),
            queued: Vec::new(),
        };
        let tasks = [
            CleanupTask::Object {
                key: doc.storage_key.clone(),
            },
            CleanupTask::Vectors {
                document_id: doc.id.clone(),
            },
        ];
        for task in tasks {
            if let Err(e) = run_task(&task, self.objects.as_ref(), self.index.as_ref()).await {
                tracing::warn!(document_id = %doc.id, task = %task.describe(), error = %e, "cleanup failed; queued for retry");
                self.retries.enqueue(task.clone());
                report.queued.push(task);
            }
        }

        self.documents.delete_document_cascade(&doc.id).await?;
        tracing::info!(document_id = %doc.id, queued = report.queued.len(), "document deleted");
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, DocumentStatus};
    use crate::storage::{storage_key, MemoryObjectStore};
    use crate::store::MemoryStore;
    use crate::vector_index::{InMemoryVectorIndex, VectorPoint};

    struct Setup {
        teardown: DocumentTeardown,
        store: Arc<MemoryStore>,
        objects: Arc<MemoryObjectStore>,
        index: Arc<InMemoryVectorIndex>,
    }

    async fn setup(max_retries: u32) -> (Setup, Document) {
        let store = Arc::new(MemoryStore::new());
        let objects = Arc::new(MemoryObjectStore::new());
        let index = Arc::new(InMemoryVectorIndex::new());
        let doc = Document {
            id: "d1".into(),
            user_id: Some("u1".into()),
            filename: "a.pdf".into(),
            content_type: "application/pdf".into(),
            storage_key: storage_key("d1", "a.pdf"),
            status: DocumentStatus::Ready,
            error_msg: None,
            page_count: 1,
            pages_parsed: 1,
            chunks_total: 1,
            chunks_indexed: 1,
            custom_instructions: None,
            is_demo: false,
            recovery_attempted: false,
            created_at: 0,
        };
        store.insert_document(&doc).await.unwrap();
        objects.put(&doc.storage_key, b"%PDF").await.unwrap();
        index
            .upsert(&[VectorPoint {
                chunk_id: "c1".into(),
                document_id: "d1".into(),
                chunk_index: 0,
                page_start: 1,
                vector: vec![1.0, 0.0],
            }])
            .await
            .unwrap();

        let retries = Arc::new(
            RetryQueue::new(objects.clone(), index.clone())
                .with_backoff(max_retries, Duration::from_millis(5)),
        );
        let teardown = DocumentTeardown::new(store.clone(), objects.clone(), index.clone(), retries);
        (
            Setup {
                teardown,
                store,
                objects,
                index,
            },
            doc,
        )
    }

    #[tokio::test]
    async fn delete_removes_rows_object_and_vectors() {
        let (s, doc) = setup(3).await;
        let report = s.teardown.delete("d1", Some("u1")).await.unwrap().unwrap();
        assert!(report.queued.is_empty());
        assert!(s.store.get_document("d1").await.unwrap().is_none());
        assert!(!s.objects.contains(&doc.storage_key));
        assert!(s.index.is_empty());
    }

    #[tokio::test]
    async fn other_users_cannot_delete() {
        let (s, _) = setup(3).await;
        assert!(s.teardown.delete("d1", Some("u2")).await.unwrap().is_none());
        assert!(s.teardown.delete("missing", None).await.unwrap().is_none());
        assert!(s.store.get_document("d1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_object_delete_is_retried() {
        let (s, doc) = setup(3).await;
        s.objects.fail_next_deletes(2);
        let report = s.teardown.delete("d1", None).await.unwrap().unwrap();
        assert_eq!(
            report.queued,
            vec![CleanupTask::Object {
                key: doc.storage_key.clone()
            }]
        );
        assert!(s.store.get_document("d1").await.unwrap().is_none());
        assert!(s.objects.contains(&doc.storage_key));

        assert_eq!(s.teardown.retries().drain().await, 0);
        assert!(!s.objects.contains(&doc.storage_key));
    }

    #[tokio::test]
    async fn exhausted_retries_are_permanent() {
        let (s, doc) = setup(2).await;
        s.objects.fail_next_deletes(10);
        s.teardown.delete("d1", None).await.unwrap();
        assert_eq!(s.teardown.retries().drain().await, 1);
        assert!(s.objects.contains(&doc.storage_key));
    }
}
