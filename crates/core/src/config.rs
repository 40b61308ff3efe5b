use crate::models::{ChunkStrategy, IngestionOptions, SearchFlags};
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "qwen2.5:7b".to_string(),
            api_key: None,
            max_tokens: 2_000,
            timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

impl GenerationConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_string("KB_LLM_BASE_URL") {
            config.base_url = value;
        }
        if let Some(value) = env_string("KB_LLM_MODEL") {
            config.model = value;
        }
        config.api_key = env_string("KB_LLM_API_KEY");
        if let Some(value) = env_parse("KB_LLM_MAX_TOKENS") {
            config.max_tokens = value;
        }
        if let Some(seconds) = env_parse::<u64>("KB_MODEL_TIMEOUT_SECS") {
            config.timeout = Duration::from_secs(seconds);
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingBackend {
    #[default]
    Ngram,
    Ollama,
}

impl FromStr for EmbeddingBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "ngram" | "local" => Ok(Self::Ngram),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!("unknown embedding backend: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Ngram,
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
            timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

impl EmbeddingConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_parse("KB_EMBEDDING_BACKEND") {
            config.backend = value;
        }
        if let Some(value) = env_string("KB_EMBEDDING_BASE_URL") {
            config.base_url = value;
        }
        if let Some(value) = env_string("KB_EMBEDDING_MODEL") {
            config.model = value;
        }
        if let Some(value) = env_parse("KB_EMBEDDING_DIMENSIONS") {
            config.dimensions = value;
        }
        if let Some(seconds) = env_parse::<u64>("KB_MODEL_TIMEOUT_SECS") {
            config.timeout = Duration::from_secs(seconds);
        }
        config
    }
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl OcrEndpointConfig {
    pub fn from_env() -> Option<Self> {
        let endpoint = env_string("LLM_OCR_ENDPOINT")?;
        Some(Self {
            endpoint,
            api_key: env_string("LLM_OCR_API_KEY"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalTuning {
    pub expansion_count: usize,
    pub expansion_temperature: f32,
    pub candidate_factor: usize,
    pub keyword_base: f64,
    pub keyword_weight: f64,
    pub rerank_original_weight: f64,
    pub rerank_model_weight: f64,
    pub rerank_temperature: f32,
    pub rerank_excerpt_chars: usize,
    pub subquery_concurrency: usize,
    pub model_timeout: Duration,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            expansion_count: 3,
            expansion_temperature: 0.7,
            candidate_factor: 2,
            keyword_base: 0.5,
            keyword_weight: 0.5,
            rerank_original_weight: 0.3,
            rerank_model_weight: 0.7,
            rerank_temperature: 0.1,
            rerank_excerpt_chars: 500,
            subquery_concurrency: 4,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

impl RetrievalTuning {
    pub fn from_env() -> Self {
        let mut tuning = Self::default();
        if let Some(value) = env_parse("KB_EXPANSION_COUNT") {
            tuning.expansion_count = value;
        }
        if let Some(value) = env_parse("KB_CANDIDATE_FACTOR") {
            tuning.candidate_factor = value;
        }
        if let Some(value) = env_parse("KB_KEYWORD_BASE") {
            tuning.keyword_base = value;
        }
        if let Some(value) = env_parse("KB_KEYWORD_WEIGHT") {
            tuning.keyword_weight = value;
        }
        if let Some(value) = env_parse("KB_RERANK_ORIGINAL_WEIGHT") {
            tuning.rerank_original_weight = value;
        }
        if let Some(value) = env_parse("KB_RERANK_MODEL_WEIGHT") {
            tuning.rerank_model_weight = value;
        }
        if let Some(value) = env_parse("KB_SUBQUERY_CONCURRENCY") {
            tuning.subquery_concurrency = value;
        }
        if let Some(seconds) = env_parse::<u64>("KB_MODEL_TIMEOUT_SECS") {
            tuning.model_timeout = Duration::from_secs(seconds);
        }
        tuning
    }
}

impl IngestionOptions {
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(value) = env_parse("KB_CHUNK_SIZE") {
            options.chunk_size = value;
        }
        if let Some(value) = env_parse("KB_CHUNK_OVERLAP") {
            options.chunk_overlap = value;
        }
        if let Some(value) = env_parse::<ChunkStrategy>("KB_CHUNK_STRATEGY") {
            options.strategy = value;
        }
        if let Some(value) = env_parse("KB_EMBEDDING_CONCURRENCY") {
            options.embedding_concurrency = value;
        }
        options
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeBaseConfig {
    pub ingestion: IngestionOptions,
    pub tuning: RetrievalTuning,
    pub default_flags: SearchFlags,
    pub default_top_k: usize,
    pub ocr: Option<OcrEndpointConfig>,
}

impl Default for KnowledgeBaseConfig {
    fn default() -> Self {
        Self {
            ingestion: IngestionOptions::default(),
            tuning: RetrievalTuning::default(),
            default_flags: SearchFlags::default(),
            default_top_k: 5,
            ocr: None,
        }
    }
}

impl KnowledgeBaseConfig {
    pub fn from_env() -> Self {
        let defaults = SearchFlags::default();
        Self {
            ingestion: IngestionOptions::from_env(),
            tuning: RetrievalTuning::from_env(),
            default_flags: SearchFlags {
                use_query_expansion: env_parse("KB_ENABLE_QUERY_EXPANSION")
                    .unwrap_or(defaults.use_query_expansion),
                use_hybrid_search: env_parse("KB_ENABLE_HYBRID_SEARCH")
                    .unwrap_or(defaults.use_hybrid_search),
                use_reranking: env_parse("KB_ENABLE_RERANKING").unwrap_or(defaults.use_reranking),
            },
            default_top_k: env_parse("KB_TOP_K").unwrap_or(5),
            ocr: OcrEndpointConfig::from_env(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    let value = value.trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let tuning = RetrievalTuning::default();
        assert_eq!(tuning.keyword_base, 0.5);
        assert_eq!(tuning.keyword_weight, 0.5);
        assert_eq!(tuning.rerank_original_weight, 0.3);
        assert_eq!(tuning.rerank_model_weight, 0.7);
        assert_eq!(tuning.candidate_factor, 2);

        let ingestion = IngestionOptions::default();
        assert_eq!(ingestion.chunk_size, 1_000);
        assert_eq!(ingestion.chunk_overlap, 200);
    }

    #[test]
    fn unparsable_env_value_keeps_default() {
        std::env::set_var("KB_TEST_ONLY_NUMBER", "not-a-number");
        assert_eq!(env_parse::<usize>("KB_TEST_ONLY_NUMBER"), None);
        std::env::set_var("KB_TEST_ONLY_NUMBER", " 42 ");
        assert_eq!(env_parse::<usize>("KB_TEST_ONLY_NUMBER"), Some(42));
        std::env::remove_var("KB_TEST_ONLY_NUMBER");
    }

    #[test]
    fn backend_parses_aliases() {
        assert_eq!("local".parse::<EmbeddingBackend>(), Ok(EmbeddingBackend::Ngram));
        assert_eq!("Ollama".parse::<EmbeddingBackend>(), Ok(EmbeddingBackend::Ollama));
    }
}
