use crate::error::SearchError;
use crate::models::{ChunkId, OwnerId, RetrievalResult, SearchFlags};
use crate::rerank::LlmReranker;
use crate::retriever::HybridRetriever;
use crate::traits::ChunkStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct SearchCoordinator {
    retriever: HybridRetriever,
    reranker: LlmReranker,
    store: Arc<dyn ChunkStore>,
}

impl SearchCoordinator {
    pub fn new(retriever: HybridRetriever, reranker: LlmReranker, store: Arc<dyn ChunkStore>) -> Self {
        Self {
            retriever,
            reranker,
            store,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        owner: OwnerId,
        top_k: usize,
        flags: SearchFlags,
    ) -> Result<Vec<RetrievalResult>, SearchError> {
        if query.trim().is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }
        if top_k == 0 {
            return Err(SearchError::Request("top_k must be positive".to_string()));
        }

        let candidates = self
            .retriever
            .retrieve(
                query,
                owner,
                top_k,
                flags.use_query_expansion,
                flags.use_hybrid_search,
            )
            .await?;
        let candidate_count = candidates.len();

        let mut results = if flags.use_reranking {
            self.reranker.rerank(query, candidates, top_k).await
        } else {
            let mut truncated = candidates;
            truncated.truncate(top_k);
            truncated
        };

        self.attach_parent_content(&mut results).await;

        info!(
            query,
            owner,
            top_k,
            candidates = candidate_count,
            returned = results.len(),
            expansion = flags.use_query_expansion,
            hybrid = flags.use_hybrid_search,
            reranking = flags.use_reranking,
            "search completed"
        );
        Ok(results)
    }

    async fn attach_parent_content(&self, results: &mut [RetrievalResult]) {
        let mut parent_ids: Vec<ChunkId> = results
            .iter()
            .filter_map(|result| result.parent_chunk_id)
            .collect();
        if parent_ids.is_empty() {
            return;
        }
        parent_ids.sort_unstable();
        parent_ids.dedup();

        let parents = match self.store.get_chunks(&parent_ids).await {
            Ok(parents) => parents,
            Err(error) => {
                warn!(%error, "could not load parent chunks; returning child text only");
                return;
            }
        };

        let by_id: HashMap<ChunkId, String> = parents
            .into_iter()
            .map(|chunk| (chunk.id, chunk.content))
            .collect();
        for result in results.iter_mut() {
            if let Some(parent_id) = result.parent_chunk_id {
                result.parent_content = by_id.get(&parent_id).cloned();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalTuning;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::ModelError;
    use crate::expansion::QueryExpander;
    use crate::llm::GenerativeModel;
    use crate::models::{ChunkStrategy, DocumentStatus, NewChunk};
    use crate::stores::InMemoryStore;
    use crate::traits::DocumentStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FailingModel;

    #[async_trait]
    impl GenerativeModel for FailingModel {
        async fn generate(&self, _prompt: &str, _temperature: f32) -> Result<String, ModelError> {
            Err(ModelError::EmptyResponse("offline".to_string()))
        }
    }

    const TEXTS: [&str; 4] = [
        "Rust ownership rules prevent data races at compile time.",
        "Python uses a global interpreter lock for thread safety.",
        "Database indexes speed up lookups with B-tree structures.",
        "Kubernetes schedules containers across a cluster of nodes.",
    ];

    async fn coordinator_with_chunks(
        chunks: Vec<NewChunk>,
    ) -> (SearchCoordinator, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let document = store
            .create_document(1, "notes.md", "/tmp/notes.md", ChunkStrategy::Semantic)
            .await
            .unwrap();
        store.replace_document_chunks(document.id, chunks).await.unwrap();
        store
            .set_status(document.id, DocumentStatus::Completed, None)
            .await
            .unwrap();

        let tuning = RetrievalTuning {
            model_timeout: Duration::from_secs(1),
            ..RetrievalTuning::default()
        };
        let model: Arc<dyn GenerativeModel> = Arc::new(FailingModel);
        let expander = QueryExpander::new(model.clone(), tuning.model_timeout, 0.7);
        let retriever = HybridRetriever::new(
            store.clone(),
            Arc::new(CharacterNgramEmbedder::default()),
            expander,
            tuning.clone(),
        );
        let reranker = LlmReranker::new(model, &tuning);
        (SearchCoordinator::new(retriever, reranker, store.clone()), store)
    }

    fn embedded(text: &str, parent: Option<usize>) -> NewChunk {
        NewChunk {
            content: text.to_string(),
            embedding: CharacterNgramEmbedder::default().embed_sync(text),
            parent,
        }
    }

    #[tokio::test]
    async fn rejects_empty_query_and_zero_top_k() {
        let (coordinator, _) = coordinator_with_chunks(Vec::new()).await;
        assert!(matches!(
            coordinator.search("   ", 1, 5, SearchFlags::default()).await,
            Err(SearchError::Request(_))
        ));
        assert!(matches!(
            coordinator.search("rust", 1, 0, SearchFlags::default()).await,
            Err(SearchError::Request(_))
        ));
    }

    #[tokio::test]
    async fn vector_only_search_returns_closest_chunk_first() {
        let chunks = TEXTS.iter().map(|text| embedded(text, None)).collect();
        let (coordinator, _) = coordinator_with_chunks(chunks).await;

        let results = coordinator
            .search(TEXTS[2], 1, 2, SearchFlags::vector_only())
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].content, TEXTS[2]);
        assert!(results[0].score >= results[1].score);
    }

    #[tokio::test]
    async fn model_outage_degrades_to_plain_hybrid_results() {
        let chunks = TEXTS.iter().map(|text| embedded(text, None)).collect();
        let (coordinator, _) = coordinator_with_chunks(chunks).await;

        let results = coordinator
            .search("database indexes b-tree", 1, 3, SearchFlags::default())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, TEXTS[2]);
        assert!(results.iter().all(|result| result.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn other_owners_see_nothing() {
        let chunks = TEXTS.iter().map(|text| embedded(text, None)).collect();
        let (coordinator, _) = coordinator_with_chunks(chunks).await;

        let results = coordinator
            .search(TEXTS[0], 2, 5, SearchFlags::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn child_hits_carry_parent_content() {
        let parent = format!("{} {}", TEXTS[0], TEXTS[1]);
        let chunks = vec![embedded(&parent, None), embedded(TEXTS[0], Some(0))];
        let (coordinator, store) = coordinator_with_chunks(chunks).await;

        let results = coordinator
            .search(TEXTS[0], 1, 2, SearchFlags::vector_only())
            .await
            .unwrap();

        let child = results
            .iter()
            .find(|result| result.parent_chunk_id.is_some())
            .expect("child hit");
        assert_eq!(child.parent_content.as_deref(), Some(parent.as_str()));

        let parent_chunk = store.get_chunks(&[child.parent_chunk_id.unwrap()]).await.unwrap();
        assert_eq!(parent_chunk[0].content, parent);
    }
}
