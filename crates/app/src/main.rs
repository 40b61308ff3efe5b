use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use kb_retrieval_core::{
    build_embedder, ChunkStrategy, DocumentStatus, EmbeddingBackend, EmbeddingConfig,
    FileTextExtractor, GenerationConfig, InMemoryStore, KnowledgeBase, KnowledgeBaseConfig,
    OpenAiCompatibleModel, OwnerId, RetrievalResult, SearchFlags, Services, TestCaseUpdate,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "kb-retrieval", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// JSON snapshot with documents, chunks and recall test cases.
    #[arg(long, env = "KB_DATA_FILE", default_value = "kb-state.json", global = true)]
    data_file: PathBuf,

    /// Owner scope for documents, searches and test cases.
    #[arg(long, env = "KB_OWNER", default_value_t = 1, global = true)]
    owner: OwnerId,

    /// OpenAI-compatible base URL used for query expansion and reranking.
    #[arg(long, env = "KB_LLM_BASE_URL", default_value = "http://localhost:11434/v1")]
    llm_base_url: String,

    /// Chat model name
    #[arg(long, env = "KB_LLM_MODEL", default_value = "qwen2.5:7b")]
    llm_model: String,

    /// Bearer token for the chat endpoint
    #[arg(long, env = "KB_LLM_API_KEY")]
    llm_api_key: Option<String>,

    /// `ngram` (offline trigram hashing) or `ollama`
    #[arg(long, env = "KB_EMBEDDING_BACKEND", default_value = "ngram")]
    embedding_backend: EmbeddingBackend,

    /// Ollama base URL
    #[arg(long, env = "KB_EMBEDDING_BASE_URL", default_value = "http://localhost:11434")]
    embedding_base_url: String,

    /// Ollama embedding model
    #[arg(long, env = "KB_EMBEDDING_MODEL", default_value = "nomic-embed-text")]
    embedding_model: String,

    /// Embedding dimensionality; must match the vectors already in the snapshot.
    #[arg(long, env = "KB_EMBEDDING_DIMENSIONS", default_value_t = 128)]
    embedding_dimensions: usize,

    /// Timeout applied to every model call.
    #[arg(long, env = "KB_MODEL_TIMEOUT_SECS", default_value_t = 30)]
    model_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Upload one file and wait for it to be processed.
    Upload {
        path: PathBuf,
        #[arg(long)]
        strategy: Option<ChunkStrategy>,
        #[arg(long)]
        category: Option<String>,
    },
    /// Ingest every supported file in a folder, recursively.
    IngestFolder {
        folder: PathBuf,
        #[arg(long)]
        strategy: Option<ChunkStrategy>,
    },
    /// List documents with their processing status.
    Documents,
    /// Re-chunk a document from its source file.
    Rechunk {
        document_id: u64,
        #[arg(long)]
        strategy: Option<ChunkStrategy>,
    },
    /// Delete a document and its chunks.
    Delete { document_id: u64 },
    /// Drop every stored chunk, then re-chunk this owner's documents with the
    /// configured embedder.
    ClearChunks {
        #[arg(long)]
        strategy: Option<ChunkStrategy>,
        /// Only clear; leave documents pending.
        #[arg(long, default_value_t = false)]
        no_reprocess: bool,
    },
    /// Query the knowledge base.
    Search {
        query: String,
        #[arg(long)]
        top_k: Option<usize>,
        #[command(flatten)]
        flags: FlagArgs,
        /// Print the parent chunk text for child hits.
        #[arg(long, default_value_t = false)]
        show_parent: bool,
    },
    /// Recall test cases and runs.
    Eval {
        #[command(subcommand)]
        command: EvalCommand,
    },
}

#[derive(Subcommand)]
enum EvalCommand {
    /// Create a test case.
    Add {
        query: String,
        /// Comma separated chunk ids that should be retrieved.
        #[arg(long, value_delimiter = ',')]
        expected: Vec<u64>,
        #[arg(long)]
        description: Option<String>,
    },
    /// List test cases.
    List,
    /// Update fields of a test case.
    Update {
        id: u64,
        #[arg(long)]
        query: Option<String>,
        #[arg(long, value_delimiter = ',')]
        expected: Option<Vec<u64>>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a test case and its results.
    Delete { id: u64 },
    /// Run a test case through search and record the metrics.
    Run {
        id: u64,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        #[command(flatten)]
        flags: FlagArgs,
    },
    /// Average metrics over recorded runs.
    Summary {
        #[arg(long)]
        test_case: Option<u64>,
    },
    /// Show the content of chunks by id.
    Chunks {
        #[arg(value_delimiter = ',', required = true)]
        ids: Vec<u64>,
    },
}

#[derive(Args)]
struct FlagArgs {
    /// Skip LLM query expansion.
    #[arg(long, default_value_t = false)]
    no_expansion: bool,
    /// Vector search only, no keyword pass.
    #[arg(long, default_value_t = false)]
    no_hybrid: bool,
    /// Skip LLM reranking.
    #[arg(long, default_value_t = false)]
    no_rerank: bool,
}

impl FlagArgs {
    fn apply(&self, defaults: SearchFlags) -> SearchFlags {
        SearchFlags {
            use_query_expansion: defaults.use_query_expansion && !self.no_expansion,
            use_hybrid_search: defaults.use_hybrid_search && !self.no_hybrid,
            use_reranking: defaults.use_reranking && !self.no_rerank,
        }
    }
}

impl Command {
    fn mutates_state(&self) -> bool {
        match self {
            Command::Documents | Command::Search { .. } => false,
            Command::Eval { command } => !matches!(
                command,
                EvalCommand::List | EvalCommand::Summary { .. } | EvalCommand::Chunks { .. }
            ),
            _ => true,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.model_timeout_secs);

    let mut config = KnowledgeBaseConfig::from_env();
    config.tuning.model_timeout = timeout;

    let generation = GenerationConfig {
        base_url: cli.llm_base_url.clone(),
        model: cli.llm_model.clone(),
        api_key: cli.llm_api_key.clone(),
        timeout,
        ..GenerationConfig::from_env()
    };
    let embedding = EmbeddingConfig {
        backend: cli.embedding_backend,
        base_url: cli.embedding_base_url.clone(),
        model: cli.embedding_model.clone(),
        dimensions: cli.embedding_dimensions,
        timeout,
    };

    let store = Arc::new(
        InMemoryStore::load(&cli.data_file)
            .await
            .with_context(|| format!("loading {}", cli.data_file.display()))?,
    );
    if let Some(existing) = store.dimensions().await {
        if existing != embedding.dimensions {
            warn!(
                snapshot = existing,
                configured = embedding.dimensions,
                "embedding dimensions differ from the snapshot; run clear-chunks to rebuild the index"
            );
        }
    }

    let extractor =
        FileTextExtractor::new().with_ocr(config.ocr.clone(), config.tuning.model_timeout);
    let services = Services::in_memory(
        store.clone(),
        build_embedder(&embedding)?,
        Arc::new(OpenAiCompatibleModel::new(&generation)?),
        Arc::new(extractor),
    );
    let kb = KnowledgeBase::new(services, config);

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        data_file = %cli.data_file.display(),
        "kb-retrieval boot"
    );

    let owner = cli.owner;
    let mutates = cli.command.mutates_state();

    match cli.command {
        Command::Upload {
            path,
            strategy,
            category,
        } => {
            let (document, task) = kb.upload(owner, &path, strategy).await?;
            task.await.context("processing task panicked")?;

            if let Some(category) = category {
                kb.set_category(owner, document.id, &category).await?;
            }
            let document = kb
                .document(owner, document.id)
                .await?
                .context("document vanished after upload")?;
            print_status(&document);
        }
        Command::IngestFolder { folder, strategy } => {
            let report = kb.ingest_folder(owner, &folder, strategy).await?;

            if !report.skipped_files.is_empty() {
                warn!(
                    "skipped_files={} for folder={}",
                    report.skipped_files.len(),
                    folder.display()
                );
                for skipped in &report.skipped_files {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
                }
            }

            let chunk_total: usize = report.documents.iter().map(|document| document.chunk_count).sum();
            println!(
                "{} documents ingested ({} chunks, {} skipped) at {}",
                report.documents.len(),
                chunk_total,
                report.skipped_files.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Documents => {
            let documents = kb.documents(owner).await?;
            if documents.is_empty() {
                println!("no documents");
            }
            for document in &documents {
                print_status(document);
            }
        }
        Command::Rechunk {
            document_id,
            strategy,
        } => match kb.reprocess_document(owner, document_id, strategy).await {
            Ok(chunk_count) => println!("document={document_id} re-chunked into {chunk_count} chunks"),
            Err(error) => {
                println!("document={document_id} failed: {error}");
            }
        },
        Command::Delete { document_id } => {
            if kb.delete_document(owner, document_id).await? {
                println!("deleted document={document_id}");
            } else {
                println!("document={document_id} not found");
            }
        }
        Command::ClearChunks {
            strategy,
            no_reprocess,
        } => {
            let removed = kb.clear_chunks().await?;
            println!("cleared {removed} chunks");

            if !no_reprocess {
                let report = kb.reprocess_owner(owner, strategy).await?;
                for skipped in &report.skipped_files {
                    warn!(path = %skipped.path.display(), reason = %skipped.reason, "document not re-chunked");
                }
                let chunk_total: usize = report.documents.iter().map(|document| document.chunk_count).sum();
                println!(
                    "{} documents re-chunked ({} chunks, {} failed)",
                    report.documents.len(),
                    chunk_total,
                    report.skipped_files.len()
                );
            }
        }
        Command::Search {
            query,
            top_k,
            flags,
            show_parent,
        } => {
            let flags = flags.apply(kb.config().default_flags);
            let results = kb.search(&query, owner, top_k, Some(flags)).await?;

            println!("query: {query}");
            if results.is_empty() {
                println!("no results");
            }
            for result in &results {
                print_result(result, show_parent);
            }
        }
        Command::Eval { command } => run_eval(&kb, owner, command).await?,
    }

    if mutates {
        store
            .save(&cli.data_file)
            .await
            .with_context(|| format!("saving {}", cli.data_file.display()))?;
    }

    Ok(())
}

async fn run_eval(kb: &KnowledgeBase, owner: OwnerId, command: EvalCommand) -> anyhow::Result<()> {
    let harness = kb.harness();

    match command {
        EvalCommand::Add {
            query,
            expected,
            description,
        } => {
            let case = harness
                .create_test_case(owner, &query, expected, description)
                .await?;
            println!("test_case={} query={:?} expected={:?}", case.id, case.query, case.expected_chunk_ids);
        }
        EvalCommand::List => {
            for case in harness.list_test_cases(owner).await? {
                println!(
                    "test_case={} query={:?} expected={:?} description={}",
                    case.id,
                    case.query,
                    case.expected_chunk_ids,
                    case.description.as_deref().unwrap_or("-")
                );
            }
        }
        EvalCommand::Update {
            id,
            query,
            expected,
            description,
        } => {
            let case = harness
                .update_test_case(
                    owner,
                    id,
                    TestCaseUpdate {
                        query,
                        expected_chunk_ids: expected,
                        description,
                    },
                )
                .await?;
            println!("test_case={} query={:?} expected={:?}", case.id, case.query, case.expected_chunk_ids);
        }
        EvalCommand::Delete { id } => {
            if harness.delete_test_case(owner, id).await? {
                println!("deleted test_case={id}");
            } else {
                println!("test_case={id} not found");
            }
        }
        EvalCommand::Run { id, top_k, flags } => {
            let flags = flags.apply(kb.config().default_flags);
            let result = harness.run(owner, id, top_k, flags).await?;
            println!(
                "test_case={} recall={}% precision={}% f1={}% mrr={}%",
                result.test_case_id, result.recall, result.precision, result.f1, result.mrr
            );
            println!("retrieved={:?}", result.retrieved_chunk_ids);
        }
        EvalCommand::Summary { test_case } => {
            let summary = harness.summary(owner, test_case).await?;
            println!(
                "runs={} avg_recall={:.2} avg_precision={:.2} avg_f1={:.2} avg_mrr={:.2}",
                summary.total_tests,
                summary.avg_recall,
                summary.avg_precision,
                summary.avg_f1,
                summary.avg_mrr
            );
        }
        EvalCommand::Chunks { ids } => {
            for chunk in harness.chunk_details(&ids).await? {
                println!("[chunk {}] document_id={}\n{}", chunk.id, chunk.document_id, chunk.content);
            }
        }
    }

    Ok(())
}

fn print_status(document: &kb_retrieval_core::Document) {
    println!(
        "[{}] {} status={} strategy={} chunks={}{}",
        document.id,
        document.file_name,
        document.status,
        document.chunk_strategy,
        document.chunk_count,
        if document.category.is_empty() {
            String::new()
        } else {
            format!(" category={}", document.category)
        }
    );
    if document.status == DocumentStatus::Failed {
        if let Some(message) = &document.error_message {
            println!("  error={message}");
        }
    }
}

fn print_result(result: &RetrievalResult, show_parent: bool) {
    let methods = result
        .methods
        .iter()
        .map(|method| format!("{method:?}").to_lowercase())
        .collect::<Vec<_>>()
        .join(",");
    println!(
        "[{}] score={:.4} chunk={} document={} methods={}",
        result.document_name, result.score, result.chunk_id, result.document_id, methods
    );
    if let Some(reason) = &result.rerank_reason {
        println!("  rerank_reason={reason}");
    }
    println!("  chunk_text:\n{}", result.content);
    if show_parent {
        if let Some(parent) = &result.parent_content {
            println!("  parent_text:\n{parent}");
        }
    }
}
