use crate::error::EvalError;
use crate::models::{
    ChunkId, DocumentId, EvaluationSummary, OwnerId, SearchFlags, TestCase, TestCaseId,
    TestResult,
};
use crate::orchestrator::SearchCoordinator;
use crate::traits::{ChunkStore, EvaluationStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrievalMetrics {
    /// Distinct retrieved ids that are in the expected set.
    pub hit_count: usize,
    pub recall: f64,
    pub precision: f64,
    pub f1: f64,
    pub mrr: f64,
}

impl RetrievalMetrics {
    pub fn compute(retrieved: &[ChunkId], expected: &[ChunkId]) -> Self {
        let expected: HashSet<ChunkId> = expected.iter().copied().collect();
        let hit_count = retrieved
            .iter()
            .filter(|id| expected.contains(*id))
            .collect::<HashSet<_>>()
            .len();

        let recall = ratio(hit_count, expected.len());
        // Duplicates count against precision.
        let precision = ratio(hit_count, retrieved.len());
        let f1 = if recall + precision > 0.0 {
            2.0 * recall * precision / (recall + precision)
        } else {
            0.0
        };
        let mrr = retrieved
            .iter()
            .position(|id| expected.contains(id))
            .map_or(0.0, |rank| 1.0 / (rank as f64 + 1.0));

        Self {
            hit_count,
            recall,
            precision,
            f1,
            mrr,
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

pub fn to_percentage(metric: f64) -> u32 {
    (metric * 100.0).round().clamp(0.0, 100.0) as u32
}

fn round_two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestCaseUpdate {
    pub query: Option<String>,
    pub expected_chunk_ids: Option<Vec<ChunkId>>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDetail {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub content: String,
}

pub struct RecallEvaluationHarness {
    coordinator: Arc<SearchCoordinator>,
    evaluations: Arc<dyn EvaluationStore>,
    chunks: Arc<dyn ChunkStore>,
}

impl RecallEvaluationHarness {
    pub fn new(
        coordinator: Arc<SearchCoordinator>,
        evaluations: Arc<dyn EvaluationStore>,
        chunks: Arc<dyn ChunkStore>,
    ) -> Self {
        Self {
            coordinator,
            evaluations,
            chunks,
        }
    }

    pub async fn create_test_case(
        &self,
        owner: OwnerId,
        query: &str,
        expected_chunk_ids: Vec<ChunkId>,
        description: Option<String>,
    ) -> Result<TestCase, EvalError> {
        if query.trim().is_empty() {
            return Err(EvalError::InvalidArgument("test case query is empty".to_string()));
        }
        let test_case = self
            .evaluations
            .create_test_case(owner, query.trim(), expected_chunk_ids, description)
            .await?;
        info!(owner, test_case_id = test_case.id, "created test case");
        Ok(test_case)
    }

    pub async fn list_test_cases(&self, owner: OwnerId) -> Result<Vec<TestCase>, EvalError> {
        Ok(self.evaluations.list_test_cases(owner).await?)
    }

    pub async fn update_test_case(
        &self,
        owner: OwnerId,
        id: TestCaseId,
        update: TestCaseUpdate,
    ) -> Result<TestCase, EvalError> {
        let mut test_case = self.test_case(owner, id).await?;

        if let Some(query) = update.query {
            if query.trim().is_empty() {
                return Err(EvalError::InvalidArgument("test case query is empty".to_string()));
            }
            test_case.query = query.trim().to_string();
        }
        if let Some(expected) = update.expected_chunk_ids {
            test_case.expected_chunk_ids = expected;
        }
        if let Some(description) = update.description {
            test_case.description = Some(description);
        }

        Ok(self.evaluations.update_test_case(test_case).await?)
    }

    pub async fn delete_test_case(&self, owner: OwnerId, id: TestCaseId) -> Result<bool, EvalError> {
        Ok(self.evaluations.delete_test_case(owner, id).await?)
    }

    pub async fn run(
        &self,
        owner: OwnerId,
        test_case_id: TestCaseId,
        top_k: usize,
        flags: SearchFlags,
    ) -> Result<TestResult, EvalError> {
        let test_case = self.test_case(owner, test_case_id).await?;
        let results = self
            .coordinator
            .search(&test_case.query, owner, top_k, flags)
            .await?;

        let retrieved_chunk_ids: Vec<ChunkId> = results.iter().map(|result| result.chunk_id).collect();
        let retrieved_scores: Vec<f64> = results.iter().map(|result| result.score).collect();
        let metrics = RetrievalMetrics::compute(&retrieved_chunk_ids, &test_case.expected_chunk_ids);

        let result = TestResult {
            id: 0,
            owner,
            test_case_id,
            retrieved_chunk_ids,
            retrieved_scores,
            recall: to_percentage(metrics.recall),
            precision: to_percentage(metrics.precision),
            f1: to_percentage(metrics.f1),
            mrr: to_percentage(metrics.mrr),
            use_query_expansion: flags.use_query_expansion,
            use_hybrid_search: flags.use_hybrid_search,
            use_reranking: flags.use_reranking,
            top_k,
            created_at: Utc::now(),
        };
        let saved = self.evaluations.save_test_result(result).await?;

        info!(
            owner,
            test_case_id,
            hits = metrics.hit_count,
            recall = saved.recall,
            precision = saved.precision,
            f1 = saved.f1,
            mrr = saved.mrr,
            "recall test finished"
        );
        Ok(saved)
    }

    pub async fn results(
        &self,
        owner: OwnerId,
        test_case_id: Option<TestCaseId>,
    ) -> Result<Vec<TestResult>, EvalError> {
        Ok(self.evaluations.list_test_results(owner, test_case_id).await?)
    }

    pub async fn summary(
        &self,
        owner: OwnerId,
        test_case_id: Option<TestCaseId>,
    ) -> Result<EvaluationSummary, EvalError> {
        let results = self.results(owner, test_case_id).await?;
        let total = results.len();

        let average = |metric: fn(&TestResult) -> u32| {
            if total == 0 {
                return 0.0;
            }
            let sum: u64 = results.iter().map(|result| u64::from(metric(result))).sum();
            round_two_decimals(sum as f64 / total as f64)
        };

        Ok(EvaluationSummary {
            total_tests: total,
            avg_recall: average(|result| result.recall),
            avg_precision: average(|result| result.precision),
            avg_f1: average(|result| result.f1),
            avg_mrr: average(|result| result.mrr),
            results,
        })
    }

    pub async fn chunk_details(&self, ids: &[ChunkId]) -> Result<Vec<ChunkDetail>, EvalError> {
        let chunks = self.chunks.get_chunks(ids).await?;
        Ok(chunks
            .into_iter()
            .map(|chunk| ChunkDetail {
                id: chunk.id,
                document_id: chunk.document_id,
                content: chunk.content,
            })
            .collect())
    }

    async fn test_case(&self, owner: OwnerId, id: TestCaseId) -> Result<TestCase, EvalError> {
        self.evaluations
            .get_test_case(owner, id)
            .await?
            .ok_or(EvalError::TestCaseNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalTuning;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::{ModelError, SearchError};
    use crate::expansion::QueryExpander;
    use crate::llm::GenerativeModel;
    use crate::models::{ChunkStrategy, DocumentStatus, NewChunk};
    use crate::rerank::LlmReranker;
    use crate::retriever::HybridRetriever;
    use crate::stores::InMemoryStore;
    use crate::traits::DocumentStore;
    use async_trait::async_trait;
    use std::time::Duration;

    struct OfflineModel;

    #[async_trait]
    impl GenerativeModel for OfflineModel {
        async fn generate(&self, _prompt: &str, _temperature: f32) -> Result<String, ModelError> {
            Err(ModelError::EmptyResponse("offline".to_string()))
        }
    }

    const TEXTS: [&str; 3] = [
        "Vector databases store embeddings for similarity search.",
        "Sourdough bread needs a long fermentation.",
        "Mountain bikes use wide tyres and suspension.",
    ];

    async fn harness() -> (RecallEvaluationHarness, Arc<InMemoryStore>, Vec<ChunkId>) {
        let store = Arc::new(InMemoryStore::new());
        let embedder = CharacterNgramEmbedder::default();
        let document = store
            .create_document(1, "kb.txt", "/tmp/kb.txt", ChunkStrategy::Recursive)
            .await
            .unwrap();
        let chunks = TEXTS
            .iter()
            .map(|text| NewChunk {
                content: text.to_string(),
                embedding: embedder.embed_sync(text),
                parent: None,
            })
            .collect();
        let ids = store.replace_document_chunks(document.id, chunks).await.unwrap();
        store
            .set_status(document.id, DocumentStatus::Completed, None)
            .await
            .unwrap();

        let tuning = RetrievalTuning {
            model_timeout: Duration::from_secs(1),
            ..RetrievalTuning::default()
        };
        let model: Arc<dyn GenerativeModel> = Arc::new(OfflineModel);
        let retriever = HybridRetriever::new(
            store.clone(),
            Arc::new(embedder),
            QueryExpander::new(model.clone(), tuning.model_timeout, 0.7),
            tuning.clone(),
        );
        let coordinator = SearchCoordinator::new(
            retriever,
            LlmReranker::new(model, &tuning),
            store.clone(),
        );
        let harness =
            RecallEvaluationHarness::new(Arc::new(coordinator), store.clone(), store.clone());
        (harness, store, ids)
    }

    fn stored_result(test_case_id: TestCaseId, recall: u32) -> TestResult {
        TestResult {
            id: 0,
            owner: 1,
            test_case_id,
            retrieved_chunk_ids: Vec::new(),
            retrieved_scores: Vec::new(),
            recall,
            precision: recall,
            f1: recall,
            mrr: recall,
            use_query_expansion: false,
            use_hybrid_search: false,
            use_reranking: false,
            top_k: 5,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn duplicates_hurt_precision_but_not_recall() {
        let metrics = RetrievalMetrics::compute(&[5, 2, 9, 2], &[2, 9]);
        assert_eq!(metrics.hit_count, 2);
        assert_eq!(to_percentage(metrics.recall), 100);
        assert_eq!(to_percentage(metrics.precision), 50);
        assert_eq!(to_percentage(metrics.f1), 67);
        assert_eq!(to_percentage(metrics.mrr), 50);
    }

    #[test]
    fn empty_inputs_score_zero() {
        let metrics = RetrievalMetrics::compute(&[1, 2], &[]);
        assert_eq!(metrics.recall, 0.0);
        assert_eq!(metrics.precision, 0.0);
        assert_eq!(metrics.f1, 0.0);
        assert_eq!(metrics.mrr, 0.0);

        let metrics = RetrievalMetrics::compute(&[], &[1]);
        assert_eq!(metrics.precision, 0.0);
        assert_eq!(metrics.mrr, 0.0);
    }

    #[test]
    fn mrr_uses_first_relevant_rank() {
        let metrics = RetrievalMetrics::compute(&[8, 7, 3, 1], &[3, 1]);
        assert!((metrics.mrr - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(to_percentage(metrics.mrr), 33);
    }

    #[tokio::test]
    async fn run_scores_and_persists_result() {
        let (harness, _, ids) = harness().await;
        let case = harness
            .create_test_case(1, TEXTS[0], vec![ids[0]], Some("vector db".to_string()))
            .await
            .unwrap();

        let result = harness
            .run(1, case.id, 2, SearchFlags::vector_only())
            .await
            .unwrap();

        assert_eq!(result.retrieved_chunk_ids.len(), 2);
        assert_eq!(result.retrieved_chunk_ids[0], ids[0]);
        assert_eq!(result.recall, 100);
        assert_eq!(result.precision, 50);
        assert_eq!(result.mrr, 100);
        assert!(!result.use_reranking);
        assert_eq!(harness.results(1, Some(case.id)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_or_foreign_case_is_not_found() {
        let (harness, _, ids) = harness().await;
        let case = harness
            .create_test_case(1, TEXTS[1], vec![ids[1]], None)
            .await
            .unwrap();

        assert!(matches!(
            harness.run(1, 999, 3, SearchFlags::default()).await,
            Err(EvalError::TestCaseNotFound(999))
        ));
        assert!(matches!(
            harness.run(2, case.id, 3, SearchFlags::default()).await,
            Err(EvalError::TestCaseNotFound(_))
        ));
    }

    #[tokio::test]
    async fn zero_top_k_is_rejected_by_search() {
        let (harness, _, ids) = harness().await;
        let case = harness.create_test_case(1, TEXTS[2], vec![ids[2]], None).await.unwrap();
        assert!(matches!(
            harness.run(1, case.id, 0, SearchFlags::default()).await,
            Err(EvalError::Search(SearchError::Request(_)))
        ));
    }

    #[tokio::test]
    async fn summary_rounds_to_two_decimals() {
        let (harness, store, ids) = harness().await;
        let case = harness.create_test_case(1, TEXTS[0], vec![ids[0]], None).await.unwrap();
        for recall in [100, 0, 0] {
            store.save_test_result(stored_result(case.id, recall)).await.unwrap();
        }

        let summary = harness.summary(1, Some(case.id)).await.unwrap();
        assert_eq!(summary.total_tests, 3);
        assert_eq!(summary.avg_recall, 33.33);
        assert_eq!(summary.avg_mrr, 33.33);

        let empty = harness.summary(2, None).await.unwrap();
        assert_eq!(empty.total_tests, 0);
        assert_eq!(empty.avg_f1, 0.0);
    }

    #[tokio::test]
    async fn update_and_delete_test_case() {
        let (harness, _, ids) = harness().await;
        let case = harness.create_test_case(1, "old query", vec![ids[0]], None).await.unwrap();

        let updated = harness
            .update_test_case(
                1,
                case.id,
                TestCaseUpdate {
                    query: Some("new query".to_string()),
                    expected_chunk_ids: Some(vec![ids[1], ids[2]]),
                    description: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.query, "new query");
        assert_eq!(updated.expected_chunk_ids, vec![ids[1], ids[2]]);

        harness.run(1, case.id, 2, SearchFlags::vector_only()).await.unwrap();
        assert!(harness.delete_test_case(1, case.id).await.unwrap());
        assert!(harness.results(1, Some(case.id)).await.unwrap().is_empty());
        assert!(harness.list_test_cases(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blank_query_is_rejected() {
        let (harness, _, _) = harness().await;
        assert!(matches!(
            harness.create_test_case(1, "  ", Vec::new(), None).await,
            Err(EvalError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn chunk_details_return_content() {
        let (harness, _, ids) = harness().await;
        let details = harness.chunk_details(&[ids[1]]).await.unwrap();
        assert_eq!(details.len(), 1);
        assert_eq!(details[0].content, TEXTS[1]);
    }
}
