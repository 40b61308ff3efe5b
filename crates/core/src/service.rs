use crate::config::{EmbeddingBackend, EmbeddingConfig, KnowledgeBaseConfig};
use crate::embeddings::{CharacterNgramEmbedder, EmbeddingProvider, OllamaEmbedder};
use crate::error::{IngestError, ModelError, SearchError, StoreError};
use crate::evaluation::RecallEvaluationHarness;
use crate::expansion::QueryExpander;
use crate::ingest::{IngestionPipeline, IngestionReport};
use crate::llm::GenerativeModel;
use crate::models::{ChunkStrategy, Document, DocumentId, OwnerId, RetrievalResult, SearchFlags};
use crate::orchestrator::SearchCoordinator;
use crate::rerank::LlmReranker;
use crate::retriever::HybridRetriever;
use crate::stores::InMemoryStore;
use crate::traits::{ChunkStore, DocumentStore, EvaluationStore, TextExtractor};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Clone)]
pub struct Services {
    pub chunks: Arc<dyn ChunkStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub evaluations: Arc<dyn EvaluationStore>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub model: Arc<dyn GenerativeModel>,
    pub extractor: Arc<dyn TextExtractor>,
}

impl Services {
    pub fn in_memory(
        store: Arc<InMemoryStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn GenerativeModel>,
        extractor: Arc<dyn TextExtractor>,
    ) -> Self {
        Self {
            chunks: store.clone(),
            documents: store.clone(),
            evaluations: store,
            embedder,
            model,
            extractor,
        }
    }
}

pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, ModelError> {
    let embedder: Arc<dyn EmbeddingProvider> = match config.backend {
        EmbeddingBackend::Ngram => Arc::new(CharacterNgramEmbedder {
            dimensions: config.dimensions,
        }),
        EmbeddingBackend::Ollama => Arc::new(OllamaEmbedder::new(config)?),
    };
    Ok(embedder)
}

pub struct KnowledgeBase {
    config: KnowledgeBaseConfig,
    documents: Arc<dyn DocumentStore>,
    chunks: Arc<dyn ChunkStore>,
    pipeline: Arc<IngestionPipeline>,
    search: Arc<SearchCoordinator>,
    harness: RecallEvaluationHarness,
}

impl KnowledgeBase {
    pub fn new(services: Services, config: KnowledgeBaseConfig) -> Self {
        let tuning = config.tuning.clone();

        let pipeline = Arc::new(IngestionPipeline::new(
            services.documents.clone(),
            services.chunks.clone(),
            services.embedder.clone(),
            services.extractor.clone(),
            config.ingestion.clone(),
            tuning.model_timeout,
        ));

        let expander = QueryExpander::new(
            services.model.clone(),
            tuning.model_timeout,
            tuning.expansion_temperature,
        );
        let retriever = HybridRetriever::new(
            services.chunks.clone(),
            services.embedder.clone(),
            expander,
            tuning.clone(),
        );
        let reranker = LlmReranker::new(services.model.clone(), &tuning);
        let search = Arc::new(SearchCoordinator::new(
            retriever,
            reranker,
            services.chunks.clone(),
        ));
        let harness = RecallEvaluationHarness::new(
            search.clone(),
            services.evaluations.clone(),
            services.chunks.clone(),
        );

        info!(
            embedding_dimensions = services.embedder.dimensions(),
            chunk_size = config.ingestion.chunk_size,
            strategy = %config.ingestion.strategy,
            "knowledge base ready"
        );

        Self {
            config,
            documents: services.documents,
            chunks: services.chunks,
            pipeline,
            search,
            harness,
        }
    }

    pub fn config(&self) -> &KnowledgeBaseConfig {
        &self.config
    }

    pub async fn upload(
        &self,
        owner: OwnerId,
        path: &Path,
        strategy: Option<ChunkStrategy>,
    ) -> Result<(Document, JoinHandle<()>), IngestError> {
        self.pipeline.upload(owner, path, strategy).await
    }

    pub async fn ingest_folder(
        &self,
        owner: OwnerId,
        folder: &Path,
        strategy: Option<ChunkStrategy>,
    ) -> Result<IngestionReport, IngestError> {
        self.pipeline.ingest_folder(owner, folder, strategy).await
    }

    pub async fn process_document(
        &self,
        document_id: DocumentId,
        file_path: &Path,
        strategy: ChunkStrategy,
    ) -> Result<usize, IngestError> {
        self.pipeline
            .process_document(document_id, file_path, strategy)
            .await
    }

    pub async fn reprocess_document(
        &self,
        owner: OwnerId,
        document_id: DocumentId,
        strategy: Option<ChunkStrategy>,
    ) -> Result<usize, IngestError> {
        self.document(owner, document_id)
            .await?
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        self.pipeline.reprocess_document(document_id, strategy).await
    }

    /// Drops every chunk of every owner so vectors of a different width can
    /// be stored. Documents go back to pending until re-chunked.
    pub async fn clear_chunks(&self) -> Result<usize, StoreError> {
        let removed = self.chunks.clear_chunks().await?;
        info!(removed, "chunk index cleared");
        Ok(removed)
    }

    pub async fn reprocess_owner(
        &self,
        owner: OwnerId,
        strategy: Option<ChunkStrategy>,
    ) -> Result<IngestionReport, IngestError> {
        self.pipeline.reprocess_owner(owner, strategy).await
    }

    pub async fn documents(&self, owner: OwnerId) -> Result<Vec<Document>, StoreError> {
        self.documents.list_documents(owner).await
    }

    pub async fn document(
        &self,
        owner: OwnerId,
        document_id: DocumentId,
    ) -> Result<Option<Document>, StoreError> {
        Ok(self
            .documents
            .get_document(document_id)
            .await?
            .filter(|document| document.owner == owner))
    }

    pub async fn set_category(
        &self,
        owner: OwnerId,
        document_id: DocumentId,
        category: &str,
    ) -> Result<(), StoreError> {
        self.document(owner, document_id)
            .await?
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        self.documents.set_category(document_id, category).await
    }

    pub async fn delete_document(
        &self,
        owner: OwnerId,
        document_id: DocumentId,
    ) -> Result<bool, StoreError> {
        if self.document(owner, document_id).await?.is_none() {
            return Ok(false);
        }
        self.documents.delete_document(document_id).await
    }

    pub async fn search(
        &self,
        query: &str,
        owner: OwnerId,
        top_k: Option<usize>,
        flags: Option<SearchFlags>,
    ) -> Result<Vec<RetrievalResult>, SearchError> {
        self.search
            .search(
                query,
                owner,
                top_k.unwrap_or(self.config.default_top_k),
                flags.unwrap_or(self.config.default_flags),
            )
            .await
    }

    pub fn harness(&self) -> &RecallEvaluationHarness {
        &self.harness
    }
}
