use crate::config::RetrievalTuning;
use crate::embeddings::EmbeddingProvider;
use crate::error::{SearchError, StoreError};
use crate::expansion::QueryExpander;
use crate::llm::with_timeout;
use crate::models::{ChunkId, OwnerId, RetrievalMethod, RetrievalResult};
use crate::store::ChunkHit;
use crate::traits::ChunkStore;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "and", "or", "but", "of", "to", "in", "on", "at", "for", "with", "by",
    "from", "as", "is", "are", "was", "were", "be", "been", "it", "its", "this", "that", "these",
    "those", "what", "which", "who", "how", "why", "when", "where", "do", "does", "did", "can",
    "could", "should", "would", "about", "into", "than", "then", "there", "their", "my", "your",
    "our", "me", "we", "you", "i",
];

const HAN_STOP_WORDS: &[&str] = &[
    "如何", "怎么", "怎样", "什么", "为什么", "哪些", "哪个", "是否", "可以", "我们", "你们", "这个",
    "那个", "关于",
];

// Function characters that separate Han phrases.
const HAN_PARTICLES: &[char] = &['的', '了', '吗', '呢', '吧', '和', '与', '及', '是'];

pub struct HybridRetriever {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    expander: QueryExpander,
    tuning: RetrievalTuning,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        expander: QueryExpander,
        tuning: RetrievalTuning,
    ) -> Self {
        Self {
            store,
            embedder,
            expander,
            tuning,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        owner: OwnerId,
        top_k: usize,
        use_expansion: bool,
        use_hybrid: bool,
    ) -> Result<Vec<RetrievalResult>, SearchError> {
        let queries = if use_expansion {
            self.expander.expand(query, self.tuning.expansion_count).await
        } else {
            vec![query.to_string()]
        };

        let candidate_limit = top_k.saturating_mul(self.tuning.candidate_factor.max(1));
        let mut attempted = 0usize;
        let mut failures = 0usize;
        let mut last_error = String::new();
        let mut merged = MergedResults::default();

        let vector_outcomes: Vec<(String, Result<Vec<ChunkHit>, String>)> = stream::iter(queries)
            .map(|sub_query| async move {
                let outcome = self.vector_subquery(&sub_query, owner, candidate_limit).await;
                (sub_query, outcome)
            })
            .buffered(self.tuning.subquery_concurrency.max(1))
            .collect()
            .await;

        for (sub_query, outcome) in vector_outcomes {
            attempted += 1;
            match outcome {
                Ok(hits) => {
                    debug!(sub_query = %sub_query, hits = hits.len(), "vector sub-query");
                    for hit in hits {
                        let score = hit.score;
                        merged.offer(hit, RetrievalMethod::Vector, score);
                    }
                }
                Err(error) => {
                    warn!(sub_query = %sub_query, %error, "vector sub-query failed; dropping it");
                    failures += 1;
                    last_error = error;
                }
            }
        }

        if use_hybrid {
            let keywords = extract_keywords(query);
            if !keywords.is_empty() {
                attempted += 1;
                match self.store.keyword_query(&keywords, owner, candidate_limit).await {
                    Ok(hits) => {
                        debug!(keywords = ?keywords, hits = hits.len(), "keyword sub-query");
                        for hit in hits {
                            let score = self.keyword_score(hit.score);
                            merged.offer(hit, RetrievalMethod::Keyword, score);
                        }
                    }
                    Err(error) => {
                        warn!(%error, "keyword sub-query failed; dropping it");
                        failures += 1;
                        last_error = error.to_string();
                    }
                }
            }
        }

        if attempted > 0 && failures == attempted {
            return Err(SearchError::AllSubqueriesFailed {
                attempted,
                last_error,
            });
        }

        Ok(merged.into_ranked())
    }

    /// `keyword_base + keyword_weight * matched / total`.
    fn keyword_score(&self, matched_fraction: f64) -> f64 {
        let score = self.tuning.keyword_base + self.tuning.keyword_weight * matched_fraction;
        score.clamp(0.0, 1.0)
    }

    async fn vector_subquery(
        &self,
        query: &str,
        owner: OwnerId,
        limit: usize,
    ) -> Result<Vec<ChunkHit>, String> {
        let vector = with_timeout(
            "query embedding",
            self.tuning.model_timeout,
            self.embedder.embed(query),
        )
        .await
        .map_err(|error| error.to_string())?;

        self.store
            .vector_query(&vector, owner, limit)
            .await
            .map_err(|error: StoreError| error.to_string())
    }
}

#[derive(Default)]
struct MergedResults {
    by_chunk: HashMap<ChunkId, RetrievalResult>,
}

impl MergedResults {
    fn offer(&mut self, hit: ChunkHit, method: RetrievalMethod, score: f64) {
        match self.by_chunk.get_mut(&hit.chunk_id) {
            Some(existing) => {
                existing.score = existing.score.max(score);
                let slot = match method {
                    RetrievalMethod::Vector => &mut existing.vector_score,
                    RetrievalMethod::Keyword => &mut existing.keyword_score,
                };
                *slot = Some(slot.map_or(score, |current| current.max(score)));
                if !existing.methods.contains(&method) {
                    existing.methods.push(method);
                }
            }
            None => {
                self.by_chunk.insert(hit.chunk_id, hit.into_result(method, score));
            }
        }
    }

    fn into_ranked(self) -> Vec<RetrievalResult> {
        let mut ranked: Vec<RetrievalResult> = self.by_chunk.into_values().collect();
        ranked.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.chunk_id.cmp(&right.chunk_id))
        });
        ranked
    }
}

pub fn extract_keywords(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut seen = HashSet::new();
    let mut keywords = Vec::new();

    for word in lowered.split(|c: char| !c.is_alphanumeric()) {
        for (han, run) in script_runs(word) {
            let terms = if han {
                han_terms(run)
            } else {
                vec![run.to_string()]
            };
            for term in terms {
                if term.chars().count() > 1
                    && !STOP_WORDS.contains(&term.as_str())
                    && seen.insert(term.clone())
                {
                    keywords.push(term);
                }
            }
        }
    }

    keywords
}

fn is_han(c: char) -> bool {
    matches!(c, '\u{3400}'..='\u{4DBF}' | '\u{4E00}'..='\u{9FFF}' | '\u{F900}'..='\u{FAFF}')
}

fn script_runs(word: &str) -> Vec<(bool, &str)> {
    let mut runs = Vec::new();
    let mut start = 0;
    let mut current = None;

    for (offset, c) in word.char_indices() {
        let han = is_han(c);
        if let Some(kind) = current {
            if kind != han {
                runs.push((kind, &word[start..offset]));
                start = offset;
            }
        }
        current = Some(han);
    }
    if let Some(kind) = current {
        runs.push((kind, &word[start..]));
    }

    runs
}

fn han_terms(run: &str) -> Vec<String> {
    let mut phrases = Vec::new();
    let mut phrase = String::new();
    let mut rest = run;

    while let Some(first) = rest.chars().next() {
        let skip = HAN_STOP_WORDS
            .iter()
            .filter(|word| rest.starts_with(**word))
            .map(|word| word.len())
            .max()
            .or_else(|| HAN_PARTICLES.contains(&first).then(|| first.len_utf8()));

        match skip {
            Some(len) => {
                if !phrase.is_empty() {
                    phrases.push(std::mem::take(&mut phrase));
                }
                rest = &rest[len..];
            }
            None => {
                phrase.push(first);
                rest = &rest[first.len_utf8()..];
            }
        }
    }
    if !phrase.is_empty() {
        phrases.push(phrase);
    }

    phrases.iter().flat_map(|phrase| bigrams(phrase)).collect()
}

fn bigrams(phrase: &str) -> Vec<String> {
    let chars: Vec<char> = phrase.chars().collect();
    if chars.len() <= 2 {
        return vec![phrase.to_string()];
    }
    chars.windows(2).map(|pair| pair.iter().collect()).collect()
}
