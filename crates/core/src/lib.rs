pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod evaluation;
pub mod expansion;
pub mod extractor;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod rerank;
pub mod retriever;
pub mod service;
pub mod store;
pub mod stores;
pub mod traits;

pub use chunking::{chunk, chunk_texts, clean_text, sliding_window, ChunkingConfig};
pub use config::{
    EmbeddingBackend, EmbeddingConfig, GenerationConfig, KnowledgeBaseConfig, OcrEndpointConfig,
    RetrievalTuning,
};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingProvider, OllamaEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{EvalError, IngestError, ModelError, SearchError, StoreError};
pub use evaluation::{ChunkDetail, RecallEvaluationHarness, RetrievalMetrics, TestCaseUpdate};
pub use expansion::QueryExpander;
pub use extractor::{FileTextExtractor, SUPPORTED_EXTENSIONS};
pub use ingest::{discover_source_files, IngestionPipeline, IngestionReport, SkippedFile};
pub use llm::{GenerativeModel, OpenAiCompatibleModel};
pub use models::{
    Chunk, ChunkDraft, ChunkId, ChunkStrategy, Document, DocumentId, DocumentStatus,
    EvaluationSummary, IngestionOptions, NewChunk, OwnerId, RetrievalMethod, RetrievalResult,
    SearchFlags, TestCase, TestCaseId, TestResult,
};
pub use orchestrator::SearchCoordinator;
pub use rerank::LlmReranker;
pub use retriever::{extract_keywords, HybridRetriever};
pub use service::{build_embedder, KnowledgeBase, Services};
pub use store::ChunkHit;
pub use stores::InMemoryStore;
pub use traits::{ChunkStore, DocumentStore, EvaluationStore, TextExtractor};
