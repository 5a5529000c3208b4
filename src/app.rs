//! Service wiring shared by the CLI and the HTTP server.

use anyhow::Result;
use std::sync::Arc;

use crate::chat::ChatOrchestrator;
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::ingest::IngestPipeline;
use crate::ledger::CreditLedger;
use crate::llm::{create_chat_model, ChatModel};
use crate::migrate;
use crate::ocr::{create_ocr, OcrEngine};
use crate::retrieval::Retriever;
use crate::storage::{FsObjectStore, ObjectStore};
use crate::store::SqliteStore;
use crate::teardown::{DocumentTeardown, RetryQueue};
use crate::vector_index::{SqliteVectorIndex, VectorIndex};

/// Every service, built over one SQLite pool.
pub struct Services {
    pub config: Arc<Config>,
    pub store: Arc<SqliteStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub index: Arc<dyn VectorIndex>,
    pub ledger: Arc<CreditLedger>,
    pub retriever: Arc<Retriever>,
    pub chat: Arc<ChatOrchestrator>,
    pub ingest: Arc<IngestPipeline>,
    pub teardown: Arc<DocumentTeardown>,
}

impl Services {
    /// Connect, migrate, and build providers from the config.
    pub async fn open(config: &Config) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = Arc::from(create_embedder(&config.embedding)?);
        let model: Arc<dyn ChatModel> = Arc::from(create_chat_model(&config.llm)?);
        let ocr: Arc<dyn OcrEngine> = Arc::from(create_ocr(&config.ocr));
        Self::open_with(config, embedder, model, ocr).await
    }

    /// Same as [`Services::open`] with caller-supplied providers.
    pub async fn open_with(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn ChatModel>,
        ocr: Arc<dyn OcrEngine>,
    ) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;

        let store = Arc::new(SqliteStore::new(pool.clone()));
        let index: Arc<dyn VectorIndex> =
            Arc::new(SqliteVectorIndex::new(pool, embedder.model_name()));
        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.storage.root));

        let ledger = Arc::new(CreditLedger::new(store.clone(), config.credits.clone()));
        let retriever = Arc::new(Retriever::new(
            embedder.clone(),
            index.clone(),
            store.clone(),
            config.retrieval.clone(),
        ));
        let chat = Arc::new(ChatOrchestrator::new(
            store.clone(),
            store.clone(),
            retriever.clone(),
            ledger.clone(),
            model,
            config.chat.clone(),
        ));
        let ingest = Arc::new(IngestPipeline::new(
            store.clone(),
            objects.clone(),
            embedder,
            index.clone(),
            ocr,
            config,
        ));
        let retries = Arc::new(RetryQueue::new(objects.clone(), index.clone()));
        let teardown = Arc::new(DocumentTeardown::new(
            store.clone(),
            objects.clone(),
            index.clone(),
            retries,
        ));

        Ok(Self {
            config: Arc::new(config.clone()),
            store,
            objects,
            index,
            ledger,
            retriever,
            chat,
            ingest,
            teardown,
        })
    }
}
