use crate::models::{ChunkId, DocumentId, RetrievalMethod, RetrievalResult};

#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub document_name: String,
    pub content: String,
    pub parent_chunk_id: Option<ChunkId>,
    /// Vector path: cosine similarity clamped to `[0, 1]`.
    /// Keyword path: fraction of query terms found.
    pub score: f64,
    pub matched_terms: usize,
}

impl ChunkHit {
    pub fn into_result(self, method: RetrievalMethod, score: f64) -> RetrievalResult {
        let (vector_score, keyword_score) = match method {
            RetrievalMethod::Vector => (Some(score), None),
            RetrievalMethod::Keyword => (None, Some(score)),
        };

        RetrievalResult {
            chunk_id: self.chunk_id,
            document_id: self.document_id,
            document_name: self.document_name,
            content: self.content,
            parent_chunk_id: self.parent_chunk_id,
            parent_content: None,
            score,
            vector_score,
            keyword_score,
            rerank_score: None,
            rerank_reason: None,
            methods: vec![method],
        }
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let mut dot = 0f64;
    let mut left_norm = 0f64;
    let mut right_norm = 0f64;
    for (a, b) in left.iter().zip(right) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

pub fn count_matched_terms(text: &str, terms: &[String]) -> usize {
    let lowered = text.to_lowercase();
    terms
        .iter()
        .filter(|term| lowered.contains(&term.to_lowercase()))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        let similarity = cosine_similarity(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]);
        assert!((similarity - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_handles_zero_and_mismatched_vectors() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn matched_terms_ignore_case() {
        let terms = vec!["Rust".to_string(), "borrow".to_string(), "python".to_string()];
        assert_eq!(count_matched_terms("rust's BORROW checker", &terms), 2);
    }

    #[test]
    fn into_result_records_method_score() {
        let hit = ChunkHit {
            chunk_id: 3,
            document_id: 1,
            document_name: "notes.md".to_string(),
            content: "text".to_string(),
            parent_chunk_id: None,
            score: 0.25,
            matched_terms: 1,
        };
        let result = hit.into_result(RetrievalMethod::Keyword, 0.625);
        assert_eq!(result.keyword_score, Some(0.625));
        assert_eq!(result.vector_score, None);
        assert_eq!(result.score, 0.625);
    }
}
