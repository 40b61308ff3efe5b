use crate::chunking::{chunk, clean_text};
use crate::embeddings::EmbeddingProvider;
use crate::error::{IngestError, StoreError};
use crate::extractor::is_supported;
use crate::llm::with_timeout;
use crate::models::{
    ChunkStrategy, Document, DocumentId, DocumentStatus, IngestionOptions, NewChunk, OwnerId,
};
use crate::traits::{ChunkStore, DocumentStore, TextExtractor};
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub fn discover_source_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if entry.file_type().is_file() && is_supported(entry.path()) {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

pub struct IngestionReport {
    pub documents: Vec<Document>,
    pub skipped_files: Vec<SkippedFile>,
}

type InFlight = Arc<Mutex<HashSet<DocumentId>>>;

struct InFlightClaim {
    in_flight: InFlight,
    document_id: DocumentId,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.document_id);
        }
    }
}

pub struct IngestionPipeline {
    documents: Arc<dyn DocumentStore>,
    chunks: Arc<dyn ChunkStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    extractor: Arc<dyn TextExtractor>,
    options: IngestionOptions,
    embed_timeout: Duration,
    in_flight: InFlight,
}

impl IngestionPipeline {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        chunks: Arc<dyn ChunkStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn TextExtractor>,
        options: IngestionOptions,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            documents,
            chunks,
            embedder,
            extractor,
            options,
            embed_timeout,
            in_flight: Arc::default(),
        }
    }

    pub async fn upload(
        self: &Arc<Self>,
        owner: OwnerId,
        path: &Path,
        strategy: Option<ChunkStrategy>,
    ) -> Result<(Document, JoinHandle<()>), IngestError> {
        let strategy = strategy.unwrap_or(self.options.strategy);
        let document = self.register(owner, path, strategy).await?;

        let pipeline = Arc::clone(self);
        let document_id = document.id;
        let path = path.to_path_buf();
        let task = tokio::spawn(async move {
            if let Err(error) = pipeline.process_document(document_id, &path, strategy).await {
                debug!(document_id, %error, "background processing ended with an error");
            }
        });

        Ok((document, task))
    }

    pub async fn ingest_folder(
        &self,
        owner: OwnerId,
        folder: &Path,
        strategy: Option<ChunkStrategy>,
    ) -> Result<IngestionReport, IngestError> {
        let files = discover_source_files(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no supported files found in {}",
                folder.display()
            )));
        }

        let strategy = strategy.unwrap_or(self.options.strategy);
        let mut documents = Vec::new();
        let mut skipped_files = Vec::new();

        for path in files {
            match self.ingest_file(owner, &path, strategy).await {
                Ok(document) => documents.push(document),
                Err(error) => skipped_files.push(SkippedFile {
                    path,
                    reason: error.to_string(),
                }),
            }
        }

        info!(
            folder = %folder.display(),
            processed = documents.len(),
            skipped = skipped_files.len(),
            "folder ingestion finished"
        );
        Ok(IngestionReport {
            documents,
            skipped_files,
        })
    }

    async fn ingest_file(
        &self,
        owner: OwnerId,
        path: &Path,
        strategy: ChunkStrategy,
    ) -> Result<Document, IngestError> {
        let document = self.register(owner, path, strategy).await?;
        self.process_document(document.id, path, strategy).await?;
        let processed = self
            .documents
            .get_document(document.id)
            .await?
            .ok_or(StoreError::DocumentNotFound(document.id))?;
        Ok(processed)
    }

    /// Extracts, chunks, embeds and stores one document, returning its chunk
    /// count. At most one run per document proceeds at a time; any failure
    /// marks the document failed and leaves its previous chunks in place.
    pub async fn process_document(
        &self,
        document_id: DocumentId,
        file_path: &Path,
        strategy: ChunkStrategy,
    ) -> Result<usize, IngestError> {
        let _claim = self.claim(document_id)?;
        info!(document_id, path = %file_path.display(), strategy = %strategy, "processing document");

        match self.run(document_id, file_path, strategy).await {
            Ok(chunk_count) => {
                info!(document_id, chunk_count, "document processed");
                Ok(chunk_count)
            }
            Err(error) => {
                warn!(document_id, %error, "document processing failed");
                if let Err(status_error) = self
                    .documents
                    .set_status(document_id, DocumentStatus::Failed, Some(error.to_string()))
                    .await
                {
                    warn!(document_id, error = %status_error, "could not record failure status");
                }
                Err(error)
            }
        }
    }

    pub async fn reprocess_document(
        &self,
        document_id: DocumentId,
        strategy: Option<ChunkStrategy>,
    ) -> Result<usize, IngestError> {
        let document = self
            .documents
            .get_document(document_id)
            .await?
            .ok_or(StoreError::DocumentNotFound(document_id))?;
        let strategy = strategy.unwrap_or(document.chunk_strategy);
        self.process_document(document_id, Path::new(&document.file_path), strategy)
            .await
    }

    pub async fn reprocess_owner(
        &self,
        owner: OwnerId,
        strategy: Option<ChunkStrategy>,
    ) -> Result<IngestionReport, IngestError> {
        let mut documents = Vec::new();
        let mut skipped_files = Vec::new();

        for document in self.documents.list_documents(owner).await? {
            match self.reprocess_document(document.id, strategy).await {
                Ok(_) => {
                    let processed = self
                        .documents
                        .get_document(document.id)
                        .await?
                        .ok_or(StoreError::DocumentNotFound(document.id))?;
                    documents.push(processed);
                }
                Err(error) => skipped_files.push(SkippedFile {
                    path: PathBuf::from(&document.file_path),
                    reason: error.to_string(),
                }),
            }
        }

        info!(
            owner,
            processed = documents.len(),
            skipped = skipped_files.len(),
            "owner documents reprocessed"
        );
        Ok(IngestionReport {
            documents,
            skipped_files,
        })
    }

    async fn register(
        &self,
        owner: OwnerId,
        path: &Path,
        strategy: ChunkStrategy,
    ) -> Result<Document, IngestError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
            })?;

        let document = self
            .documents
            .create_document(owner, name, &path.to_string_lossy(), strategy)
            .await?;
        debug!(document_id = document.id, owner, name, "registered document");
        Ok(document)
    }

    fn claim(&self, document_id: DocumentId) -> Result<InFlightClaim, IngestError> {
        let mut in_flight = self
            .in_flight
            .lock()
            .map_err(|_| IngestError::Task("in-flight registry lock poisoned".to_string()))?;
        if !in_flight.insert(document_id) {
            return Err(IngestError::AlreadyProcessing(document_id));
        }
        Ok(InFlightClaim {
            in_flight: Arc::clone(&self.in_flight),
            document_id,
        })
    }

    async fn run(
        &self,
        document_id: DocumentId,
        file_path: &Path,
        strategy: ChunkStrategy,
    ) -> Result<usize, IngestError> {
        self.documents
            .set_status(document_id, DocumentStatus::Processing, None)
            .await?;

        let extractor = Arc::clone(&self.extractor);
        let path = file_path.to_path_buf();
        let (checksum, raw) = tokio::task::spawn_blocking(move || {
            let checksum = digest_file(&path)?;
            let raw = extractor.extract(&path)?;
            Ok::<_, IngestError>((checksum, raw))
        })
        .await
        .map_err(|error| IngestError::Task(error.to_string()))??;

        let content = clean_text(&raw);
        if content.is_empty() {
            return Err(IngestError::EmptyDocument(file_path.display().to_string()));
        }

        let drafts = chunk(
            &content,
            strategy,
            self.options.chunk_size,
            self.options.chunk_overlap,
        )?;
        debug!(document_id, chunks = drafts.len(), "chunked document");

        let texts: Vec<String> = drafts.iter().map(|draft| draft.text.clone()).collect();
        let embed_timeout = self.embed_timeout;
        let embeddings: Vec<Vec<f32>> = stream::iter(texts)
            .map(|text| {
                let embedder = Arc::clone(&self.embedder);
                async move {
                    with_timeout("chunk embedding", embed_timeout, embedder.embed(&text)).await
                }
            })
            .buffered(self.options.embedding_concurrency.max(1))
            .try_collect()
            .await?;

        let new_chunks: Vec<NewChunk> = drafts
            .into_iter()
            .zip(embeddings)
            .map(|(draft, embedding)| NewChunk {
                content: draft.text,
                embedding,
                parent: draft.parent,
            })
            .collect();

        let ids = self
            .chunks
            .replace_document_chunks(document_id, new_chunks)
            .await?;
        self.documents
            .mark_completed(document_id, content, checksum, strategy, ids.len())
            .await?;

        Ok(ids.len())
    }
}
