use crate::models::{DocumentId, TestCaseId};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("docx parse error: {0}")]
    DocxParse(String),

    #[error("no text could be extracted from {0}")]
    EmptyDocument(String),

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("multimodal OCR failed: {0}")]
    OcrFailed(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] ModelError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("document {0} is already being processed")]
    AlreadyProcessing(DocumentId),

    #[error("background task failed: {0}")]
    Task(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("empty response from {0}")]
    EmptyResponse(String),

    #[error("embedding dimension {actual} does not match expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("malformed model output: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    DocumentNotFound(DocumentId),

    #[error("test case {0} not found")]
    TestCaseNotFound(TestCaseId),

    #[error("vector dimension {actual} does not match store dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("chunk {index} references unknown parent position {parent}")]
    UnknownParent { index: usize, parent: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("all {attempted} retrieval sub-queries failed; last error: {last_error}")]
    AllSubqueriesFailed { attempted: usize, last_error: String },
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("test case {0} not found")]
    TestCaseNotFound(TestCaseId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("search failed: {0}")]
    Search(#[from] SearchError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
