use crate::config::RetrievalTuning;
use crate::llm::{parse_structured, with_timeout, GenerativeModel};
use crate::models::RetrievalResult;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct RerankJudgement {
    index: usize,
    score: f64,
    #[serde(default)]
    reason: Option<String>,
}

pub struct LlmReranker {
    model: Arc<dyn GenerativeModel>,
    original_weight: f64,
    model_weight: f64,
    temperature: f32,
    excerpt_chars: usize,
    timeout: Duration,
}

impl LlmReranker {
    pub fn new(model: Arc<dyn GenerativeModel>, tuning: &RetrievalTuning) -> Self {
        Self {
            model,
            original_weight: tuning.rerank_original_weight,
            model_weight: tuning.rerank_model_weight,
            temperature: tuning.rerank_temperature,
            excerpt_chars: tuning.rerank_excerpt_chars.max(1),
            timeout: tuning.model_timeout,
        }
    }

    /// Judges the first `2 * top_k` candidates and returns the best `top_k`.
    /// Falls back to the incoming order whenever the model gives nothing
    /// usable.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RetrievalResult>,
        top_k: usize,
    ) -> Vec<RetrievalResult> {
        let mut pool = candidates;
        pool.truncate(top_k.saturating_mul(2));
        if pool.is_empty() || top_k == 0 {
            pool.truncate(top_k);
            return pool;
        }

        let prompt = self.prompt(query, &pool);
        let raw = match with_timeout(
            "rerank",
            self.timeout,
            self.model.generate(&prompt, self.temperature),
        )
        .await
        {
            Ok(raw) => raw,
            Err(error) => {
                warn!(query, %error, "rerank call failed; keeping retrieval order");
                return fallback(pool, top_k);
            }
        };

        let judgements = match parse_structured::<Vec<RerankJudgement>>(&raw) {
            Ok(judgements) => judgements,
            Err(error) => {
                warn!(query, %error, "rerank output unusable; keeping retrieval order");
                return fallback(pool, top_k);
            }
        };

        let mut by_index: HashMap<usize, RerankJudgement> = HashMap::new();
        for judgement in judgements {
            if judgement.index >= pool.len() || !judgement.score.is_finite() {
                continue;
            }
            by_index.entry(judgement.index).or_insert(judgement);
        }
        if by_index.is_empty() {
            warn!(query, "rerank returned no judgement for any candidate; keeping retrieval order");
            return fallback(pool, top_k);
        }

        debug!(query, judged = by_index.len(), pool = pool.len(), "reranked candidates");
        for (index, result) in pool.iter_mut().enumerate() {
            let original = result.score;
            let (rerank_score, reason) = match by_index.remove(&index) {
                Some(judgement) => (judgement.score.clamp(0.0, 1.0), judgement.reason),
                None => (original, None),
            };
            result.rerank_score = Some(rerank_score);
            result.rerank_reason = reason;
            result.score =
                (self.original_weight * original + self.model_weight * rerank_score).clamp(0.0, 1.0);
        }

        pool.sort_by(|left, right| right.score.total_cmp(&left.score));
        pool.truncate(top_k);
        pool
    }

    fn prompt(&self, query: &str, pool: &[RetrievalResult]) -> String {
        let mut documents = String::new();
        for (index, result) in pool.iter().enumerate() {
            let excerpt: String = result.content.chars().take(self.excerpt_chars).collect();
            documents.push_str(&format!("[{index}] {excerpt}\n\n"));
        }

        format!(
            "Rate how relevant each document is to the query on a scale from 0 to 1.\n\
             Reply with only a JSON array of objects with the fields \
             \"index\", \"score\" and \"reason\".\n\n\
             Query: {query}\n\nDocuments:\n{documents}"
        )
    }
}

fn fallback(mut pool: Vec<RetrievalResult>, top_k: usize) -> Vec<RetrievalResult> {
    pool.truncate(top_k);
    pool
}
