use crate::error::StoreError;
use crate::models::{
    Chunk, ChunkId, ChunkStrategy, Document, DocumentId, DocumentStatus, NewChunk, OwnerId,
    TestCase, TestCaseId, TestResult, TestResultId,
};
use crate::store::{cosine_similarity, count_matched_terms, ChunkHit};
use crate::traits::{ChunkStore, DocumentStore, EvaluationStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    next_document_id: DocumentId,
    next_chunk_id: ChunkId,
    next_test_case_id: TestCaseId,
    next_test_result_id: TestResultId,
    dimensions: Option<usize>,
    documents: BTreeMap<DocumentId, Document>,
    chunks: BTreeMap<ChunkId, Chunk>,
    test_cases: BTreeMap<TestCaseId, TestCase>,
    test_results: BTreeMap<TestResultId, TestResult>,
}

impl StoreState {
    fn document_mut(&mut self, id: DocumentId) -> Result<&mut Document, StoreError> {
        self.documents
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound(id))
    }

    fn searchable_documents(&self, owner: OwnerId) -> HashMap<DocumentId, &Document> {
        self.documents
            .values()
            .filter(|document| {
                document.owner == owner && document.status == DocumentStatus::Completed
            })
            .map(|document| (document.id, document))
            .collect()
    }

    fn chunk_count(&self, document_id: DocumentId) -> usize {
        self.chunks
            .values()
            .filter(|chunk| chunk.document_id == document_id)
            .count()
    }

    fn remove_document_chunks(&mut self, document_id: DocumentId) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|_, chunk| chunk.document_id != document_id);
        before - self.chunks.len()
    }

    /// Validates `chunks` and assigns ids without mutating the state.
    fn prepare_chunks(
        &self,
        document_id: DocumentId,
        chunks: Vec<NewChunk>,
        first_index: usize,
    ) -> Result<(Vec<Chunk>, Option<usize>), StoreError> {
        if !self.documents.contains_key(&document_id) {
            return Err(StoreError::DocumentNotFound(document_id));
        }

        let mut dimensions = self.dimensions;
        let mut prepared: Vec<Chunk> = Vec::with_capacity(chunks.len());

        for (position, chunk) in chunks.into_iter().enumerate() {
            match dimensions {
                Some(expected) if expected != chunk.embedding.len() => {
                    return Err(StoreError::DimensionMismatch {
                        expected,
                        actual: chunk.embedding.len(),
                    });
                }
                Some(_) => {}
                None => dimensions = Some(chunk.embedding.len()),
            }

            let parent_chunk_id = match chunk.parent {
                Some(parent) if parent >= position => {
                    return Err(StoreError::UnknownParent {
                        index: position,
                        parent,
                    });
                }
                Some(parent) => Some(prepared[parent].id),
                None => None,
            };

            prepared.push(Chunk {
                id: self.next_chunk_id + position as ChunkId + 1,
                document_id,
                index: first_index + position,
                content: chunk.content,
                embedding: chunk.embedding,
                parent_chunk_id,
            });
        }

        Ok((prepared, dimensions))
    }

    fn commit_chunks(&mut self, prepared: Vec<Chunk>, dimensions: Option<usize>) -> Vec<ChunkId> {
        if let Some(last) = prepared.last() {
            self.next_chunk_id = last.id;
        }
        if self.dimensions.is_none() {
            self.dimensions = dimensions;
        }

        prepared
            .into_iter()
            .map(|chunk| {
                let id = chunk.id;
                self.chunks.insert(id, chunk);
                id
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn dimensions(&self) -> Option<usize> {
        self.state.read().await.dimensions
    }

    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let state: StoreState = serde_json::from_slice(&bytes)?;
                debug!(path = %path.display(), documents = state.documents.len(), "loaded store snapshot");
                Ok(Self {
                    state: RwLock::new(state),
                })
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(error) => Err(StoreError::Io(error)),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        let bytes = {
            let state = self.state.read().await;
            serde_json::to_vec(&*state)?
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn insert(
        &self,
        document_id: DocumentId,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<ChunkId>, StoreError> {
        let mut state = self.state.write().await;
        let first_index = state.chunk_count(document_id);
        let (prepared, dimensions) = state.prepare_chunks(document_id, chunks, first_index)?;
        Ok(state.commit_chunks(prepared, dimensions))
    }

    async fn replace_document_chunks(
        &self,
        document_id: DocumentId,
        chunks: Vec<NewChunk>,
    ) -> Result<Vec<ChunkId>, StoreError> {
        let mut state = self.state.write().await;
        let (prepared, dimensions) = state.prepare_chunks(document_id, chunks, 0)?;
        let removed = state.remove_document_chunks(document_id);
        let ids = state.commit_chunks(prepared, dimensions);
        debug!(document_id, removed, inserted = ids.len(), "replaced document chunks");
        Ok(ids)
    }

    async fn delete_by_document(&self, document_id: DocumentId) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        Ok(state.remove_document_chunks(document_id))
    }

    async fn vector_query(
        &self,
        vector: &[f32],
        owner: OwnerId,
        top_k: usize,
    ) -> Result<Vec<ChunkHit>, StoreError> {
        let state = self.state.read().await;
        if let Some(expected) = state.dimensions {
            if expected != vector.len() {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let documents = state.searchable_documents(owner);
        let mut hits: Vec<ChunkHit> = state
            .chunks
            .values()
            .filter_map(|chunk| {
                let document = documents.get(&chunk.document_id)?;
                let similarity = cosine_similarity(vector, &chunk.embedding).clamp(0.0, 1.0);
                Some(hit_from(chunk, document, similarity, 0))
            })
            .collect();

        // BTreeMap iteration is id order, so a stable sort keeps insertion order on ties.
        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn keyword_query(
        &self,
        terms: &[String],
        owner: OwnerId,
        top_k: usize,
    ) -> Result<Vec<ChunkHit>, StoreError> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        let documents = state.searchable_documents(owner);
        let mut hits: Vec<ChunkHit> = state
            .chunks
            .values()
            .filter_map(|chunk| {
                let document = documents.get(&chunk.document_id)?;
                let matched = count_matched_terms(&chunk.content, terms);
                if matched == 0 {
                    return None;
                }
                let fraction = matched as f64 / terms.len() as f64;
                Some(hit_from(chunk, document, fraction, matched))
            })
            .collect();

        hits.sort_by(|left, right| right.matched_terms.cmp(&left.matched_terms));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn get_chunks(&self, ids: &[ChunkId]) -> Result<Vec<Chunk>, StoreError> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.chunks.get(id).cloned())
            .collect())
    }

    async fn clear_chunks(&self) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        let removed = state.chunks.len();
        state.chunks.clear();
        state.dimensions = None;
        let now = Utc::now();
        for document in state.documents.values_mut() {
            document.chunk_count = 0;
            if document.status == DocumentStatus::Completed {
                document.status = DocumentStatus::Pending;
                document.updated_at = now;
            }
        }
        Ok(removed)
    }
}

fn hit_from(chunk: &Chunk, document: &Document, score: f64, matched_terms: usize) -> ChunkHit {
    ChunkHit {
        chunk_id: chunk.id,
        document_id: chunk.document_id,
        document_name: document.file_name.clone(),
        content: chunk.content.clone(),
        parent_chunk_id: chunk.parent_chunk_id,
        score,
        matched_terms,
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_document(
        &self,
        owner: OwnerId,
        file_name: &str,
        file_path: &str,
        strategy: ChunkStrategy,
    ) -> Result<Document, StoreError> {
        let mut state = self.state.write().await;
        state.next_document_id += 1;
        let now = Utc::now();
        let file_type = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase())
            .unwrap_or_default();

        let document = Document {
            id: state.next_document_id,
            owner,
            file_name: file_name.to_string(),
            file_path: file_path.to_string(),
            file_type,
            category: String::new(),
            content: None,
            checksum: None,
            status: DocumentStatus::Pending,
            chunk_strategy: strategy,
            chunk_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        state.documents.insert(document.id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        Ok(self.state.read().await.documents.get(&id).cloned())
    }

    async fn list_documents(&self, owner: OwnerId) -> Result<Vec<Document>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .values()
            .filter(|document| document.owner == owner)
            .cloned()
            .collect())
    }

    async fn set_status(
        &self,
        id: DocumentId,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let document = state.document_mut(id)?;
        document.status = status;
        document.error_message = error_message;
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: DocumentId,
        content: String,
        checksum: String,
        strategy: ChunkStrategy,
        chunk_count: usize,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let document = state.document_mut(id)?;
        document.content = Some(content);
        document.checksum = Some(checksum);
        document.chunk_strategy = strategy;
        document.chunk_count = chunk_count;
        document.status = DocumentStatus::Completed;
        document.error_message = None;
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn set_category(&self, id: DocumentId, category: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let document = state.document_mut(id)?;
        document.category = category.to_string();
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_document(&self, id: DocumentId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.documents.remove(&id).is_none() {
            return Ok(false);
        }
        let removed = state.remove_document_chunks(id);
        debug!(document_id = id, removed, "deleted document");
        Ok(true)
    }
}

#[async_trait]
impl EvaluationStore for InMemoryStore {
    async fn create_test_case(
        &self,
        owner: OwnerId,
        query: &str,
        expected_chunk_ids: Vec<ChunkId>,
        description: Option<String>,
    ) -> Result<TestCase, StoreError> {
        let mut state = self.state.write().await;
        state.next_test_case_id += 1;
        let test_case = TestCase {
            id: state.next_test_case_id,
            owner,
            query: query.to_string(),
            expected_chunk_ids,
            description,
            created_at: Utc::now(),
        };
        state.test_cases.insert(test_case.id, test_case.clone());
        Ok(test_case)
    }

    async fn get_test_case(
        &self,
        owner: OwnerId,
        id: TestCaseId,
    ) -> Result<Option<TestCase>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .test_cases
            .get(&id)
            .filter(|test_case| test_case.owner == owner)
            .cloned())
    }

    async fn list_test_cases(&self, owner: OwnerId) -> Result<Vec<TestCase>, StoreError> {
        let state = self.state.read().await;
        let mut cases: Vec<TestCase> = state
            .test_cases
            .values()
            .filter(|test_case| test_case.owner == owner)
            .cloned()
            .collect();
        cases.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then(right.id.cmp(&left.id))
        });
        Ok(cases)
    }

    async fn update_test_case(&self, test_case: TestCase) -> Result<TestCase, StoreError> {
        let mut state = self.state.write().await;
        match state.test_cases.get_mut(&test_case.id) {
            Some(existing) if existing.owner == test_case.owner => {
                existing.query = test_case.query;
                existing.expected_chunk_ids = test_case.expected_chunk_ids;
                existing.description = test_case.description;
                Ok(existing.clone())
            }
            _ => Err(StoreError::TestCaseNotFound(test_case.id)),
        }
    }

    async fn delete_test_case(&self, owner: OwnerId, id: TestCaseId) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let owned = state
            .test_cases
            .get(&id)
            .is_some_and(|test_case| test_case.owner == owner);
        if !owned {
            return Ok(false);
        }
        state.test_cases.remove(&id);
        state.test_results.retain(|_, result| result.test_case_id != id);
        Ok(true)
    }

    async fn save_test_result(&self, mut result: TestResult) -> Result<TestResult, StoreError> {
        let mut state = self.state.write().await;
        if !state.test_cases.contains_key(&result.test_case_id) {
            return Err(StoreError::TestCaseNotFound(result.test_case_id));
        }
        state.next_test_result_id += 1;
        result.id = state.next_test_result_id;
        state.test_results.insert(result.id, result.clone());
        Ok(result)
    }

    async fn list_test_results(
        &self,
        owner: OwnerId,
        test_case_id: Option<TestCaseId>,
    ) -> Result<Vec<TestResult>, StoreError> {
        let state = self.state.read().await;
        let mut results: Vec<TestResult> = state
            .test_results
            .values()
            .filter(|result| result.owner == owner)
            .filter(|result| test_case_id.map_or(true, |id| result.test_case_id == id))
            .cloned()
            .collect();
        results.sort_by(|left, right| {
            right
                .created_at
                .cmp(&left.created_at)
                .then(right.id.cmp(&left.id))
        });
        Ok(results)
    }
}
