use crate::error::{IngestError, StoreError};
use crate::models::{
    Chunk, ChunkId, ChunkStrategy, Document, DocumentId, DocumentStatus, NewChunk, OwnerId,
    TestCase, TestCaseId, TestResult,
};
use crate::store::ChunkHit;
use async_trait::async_trait;
use std::path::Path;

pub trait TextExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<String, IngestError>;
}

/// Chunks, their vectors, and the parent/child arena. Queries only see
/// chunks whose document belongs to `owner` and is `completed`.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn insert(
        &self,
        document_id: DocumentId,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<ChunkId>, StoreError>;

    /// Deletes the document's chunks and inserts `chunks` as one unit. On
    /// error the previous chunks are untouched.
    async fn replace_document_chunks(
        &self,
        document_id: DocumentId,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<ChunkId>, StoreError>;

    async fn delete_by_document(&self, document_id: DocumentId) -> Result<usize, StoreError>;

    async fn vector_query(
        &self,
        vector: &[f32],
        owner: OwnerId,
        top_k: usize,
    ) -> Result<Vec<ChunkHit>, StoreError>;

    async fn keyword_query(
        &self,
        terms: &[String],
        owner: OwnerId,
        top_k: usize,
    ) -> Result<Vec<ChunkHit>, StoreError>;

    async fn get_chunks(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>, StoreError>;

    async fn clear_chunks(&self) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(
        &self,
        owner: OwnerId,
        file_name: &str,
        file_path: &str,
        strategy: ChunkStrategy,
    ) -> Result<Document, StoreError>;

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError>;

    async fn list_documents(&self, owner: OwnerId) -> Result<Vec<Document>, StoreError>;

    async fn set_status(
        &self,
        id: DocumentId,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    async fn mark_completed(
        &self,
        id: DocumentId,
        content: String,
        checksum: String,
        strategy: ChunkStrategy,
        chunk_count: usize,
    ) -> Result<(), StoreError>;

    async fn set_category(&self, id: DocumentId, category: &str) -> Result<(), StoreError>;

    async fn delete_document(&self, id: DocumentId) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait EvaluationStore: Send + Sync {
    async fn create_test_case(
        &self,
        owner: OwnerId,
        query: &str,
        expected_chunk_ids: Vec<ChunkId>,
        description: Option<String>,
    ) -> Result<TestCase, StoreError>;

    async fn get_test_case(
        &self,
        owner: OwnerId,
        id: TestCaseId,
    ) -> Result<Option<TestCase>, StoreError>;

    async fn list_test_cases(&self, owner: OwnerId) -> Result<Vec<TestCase>, StoreError>;

    async fn update_test_case(&self, test_case: TestCase) -> Result<TestCase, StoreError>;

    async fn delete_test_case(&self, owner: OwnerId, id: TestCaseId) -> Result<bool, StoreError>;

    async fn save_test_result(&self, result: TestResult) -> Result<TestResult, StoreError>;

    async fn list_test_results(
        &self,
        owner: OwnerId,
        test_case_id: Option<TestCaseId>,
    ) -> Result<Vec<TestResult>, StoreError>;
}
