use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type DocumentId = u64;
pub type ChunkId = u64;
pub type OwnerId = u64;
pub type TestCaseId = u64;
pub type TestResultId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    #[default]
    Semantic,
    Recursive,
    ParentChild,
}

impl ChunkStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Semantic => "semantic",
            Self::Recursive => "recursive",
            Self::ParentChild => "parent_child",
        }
    }
}

impl fmt::Display for ChunkStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().replace('-', "_").as_str() {
            "semantic" => Ok(Self::Semantic),
            "recursive" => Ok(Self::Recursive),
            "parent_child" => Ok(Self::ParentChild),
            other => Err(format!("unknown chunk strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub owner: OwnerId,
    pub file_name: String,
    pub file_path: String,
    pub file_type: String,
    #[serde(default)]
    pub category: String,
    pub content: Option<String>,
    pub checksum: Option<String>,
    pub status: DocumentStatus,
    pub chunk_strategy: ChunkStrategy,
    pub chunk_count: usize,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Output of the chunker before embedding. `parent` is the position of the
/// parent draft in the same sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDraft {
    pub text: String,
    pub parent: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct NewChunk {
    pub content: String,
    pub embedding: Vec<f32>,
    pub parent: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub index: usize,
    pub content: String,
    pub embedding: Vec<f32>,
    pub parent_chunk_id: Option<ChunkId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMethod {
    Vector,
    Keyword,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub document_name: String,
    pub content: String,
    pub parent_chunk_id: Option<ChunkId>,
    pub parent_content: Option<String>,
    pub score: f64,
    pub vector_score: Option<f64>,
    pub keyword_score: Option<f64>,
    pub rerank_score: Option<f64>,
    pub rerank_reason: Option<String>,
    pub methods: Vec<RetrievalMethod>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchFlags {
    pub use_query_expansion: bool,
    pub use_hybrid_search: bool,
    pub use_reranking: bool,
}

impl Default for SearchFlags {
    fn default() -> Self {
        Self {
            use_query_expansion: true,
            use_hybrid_search: true,
            use_reranking: true,
        }
    }
}

impl SearchFlags {
    pub fn vector_only() -> Self {
        Self {
            use_query_expansion: false,
            use_hybrid_search: false,
            use_reranking: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: TestCaseId,
    pub owner: OwnerId,
    pub query: String,
    pub expected_chunk_ids: Vec<ChunkId>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: TestResultId,
    pub owner: OwnerId,
    pub test_case_id: TestCaseId,
    pub retrieved_chunk_ids: Vec<ChunkId>,
    pub retrieved_scores: Vec<f64>,
    pub recall: u32,
    pub precision: u32,
    pub f1: u32,
    pub mrr: u32,
    pub use_query_expansion: bool,
    pub use_hybrid_search: bool,
    pub use_reranking: bool,
    pub top_k: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub total_tests: usize,
    pub avg_recall: f64,
    pub avg_precision: f64,
    pub avg_f1: f64,
    pub avg_mrr: f64,
    pub results: Vec<TestResult>,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub strategy: ChunkStrategy,
    pub embedding_concurrency: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_000,
            chunk_overlap: 200,
            strategy: ChunkStrategy::Semantic,
            embedding_concurrency: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_cli_spellings() {
        assert_eq!("semantic".parse::<ChunkStrategy>(), Ok(ChunkStrategy::Semantic));
        assert_eq!("Parent-Child".parse::<ChunkStrategy>(), Ok(ChunkStrategy::ParentChild));
        assert!("sentences".parse::<ChunkStrategy>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        let encoded = serde_json::to_string(&DocumentStatus::Completed).expect("serialize");
        assert_eq!(encoded, "\"completed\"");
    }
}
