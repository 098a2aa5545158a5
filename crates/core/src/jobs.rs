//! Indexing job records and the background pipeline that drives them.
//!
//! A job moves `queued -> extracting -> embedding -> indexing -> completed`,
//! or to `failed` from any non-terminal state. Only one job may be
//! non-terminal at a time. Records are never removed so status stays
//! pollable after the job ends.

use crate::chunking::{chunk_document, ChunkingConfig};
use crate::embed_client::EmbeddingClient;
use crate::error::{ErrorKind, IngestError, SearchError};
use crate::models::{DocumentRecord, IndexingOptions, PdfChunk};
use crate::snapshot::{ActiveSnapshot, IndexSnapshot, SnapshotStore};
use crate::traits::DocumentSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};
use uuid::Uuid;

const EXTRACTION_END: u8 = 10;
const EMBEDDING_END: u8 = 90;
const PERSISTED: u8 = 99;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Extracting,
    Embedding,
    Indexing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedDocument {
    pub document_id: String,
    pub filename: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobState {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress_percent: u8,
    pub processed_chunk_count: usize,
    pub total_chunk_count: usize,
    pub error: Option<JobError>,
    pub document_ids: Vec<String>,
    pub skipped_documents: Vec<SkippedDocument>,
    pub build_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobState {
    fn queued(document_ids: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            status: JobStatus::Queued,
            progress_percent: 0,
            processed_chunk_count: 0,
            total_chunk_count: 0,
            error: None,
            document_ids,
            skipped_documents: Vec::new(),
            build_id: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Every job ever started, oldest first.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<Vec<JobState>>,
}

impl JobRegistry {
    /// Registers a queued job, or fails with `Conflict` while another job is
    /// still running.
    pub fn begin(&self, document_ids: Vec<String>) -> Result<Uuid, SearchError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = jobs.iter().find(|job| !job.status.is_terminal()) {
            return Err(SearchError::Conflict(format!(
                "job {} is still {:?}",
                active.job_id, active.status
            )));
        }

        let job = JobState::queued(document_ids);
        let job_id = job.job_id;
        jobs.push(job);
        Ok(job_id)
    }

    pub fn get(&self, job_id: Uuid) -> Option<JobState> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|job| job.job_id == job_id)
            .cloned()
    }

    /// Newest first.
    pub fn list(&self) -> Vec<JobState> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.iter().rev().cloned().collect()
    }

    pub fn active(&self) -> Option<JobState> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|job| !job.status.is_terminal())
            .cloned()
    }

    fn update<F>(&self, job_id: Uuid, apply: F)
    where
        F: FnOnce(&mut JobState),
    {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = jobs
            .iter_mut()
            .find(|job| job.job_id == job_id && !job.status.is_terminal())
        {
            apply(job);
            job.updated_at = Utc::now();
        }
    }

    /// Progress never moves backwards.
    fn advance(&self, job_id: Uuid, status: JobStatus, progress_percent: u8) {
        self.update(job_id, |job| {
            job.status = status;
            job.progress_percent = job.progress_percent.max(progress_percent.min(100));
        });
    }

    fn set_total_chunks(&self, job_id: Uuid, total: usize) {
        self.update(job_id, |job| job.total_chunk_count = total);
    }

    fn record_embedding_progress(&self, job_id: Uuid, processed: usize, total: usize) {
        let span = usize::from(EMBEDDING_END - EXTRACTION_END);
        let reached = EXTRACTION_END as usize + span * processed / total.max(1);
        self.update(job_id, |job| {
            job.processed_chunk_count = processed;
            job.total_chunk_count = total;
            job.progress_percent = job
                .progress_percent
                .max(u8::try_from(reached).unwrap_or(EMBEDDING_END));
        });
    }

    fn record_skip(&self, job_id: Uuid, skipped: SkippedDocument) {
        self.update(job_id, |job| job.skipped_documents.push(skipped));
    }

    fn complete(&self, job_id: Uuid, build_id: Uuid) {
        self.update(job_id, |job| {
            job.status = JobStatus::Completed;
            job.progress_percent = 100;
            job.processed_chunk_count = job.total_chunk_count;
            job.build_id = Some(build_id);
            job.finished_at = Some(Utc::now());
        });
    }

    fn fail(&self, job_id: Uuid, failure: &IngestError) {
        self.fail_with(job_id, failure.kind(), failure.to_string());
    }

    fn fail_with(&self, job_id: Uuid, kind: ErrorKind, message: String) {
        self.update(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(JobError { kind, message });
            job.finished_at = Some(Utc::now());
        });
    }
}

/// Everything one background build needs. Consumed by [`IndexingRun::run`].
pub(crate) struct IndexingRun {
    pub(crate) job_id: Uuid,
    pub(crate) documents: Vec<DocumentRecord>,
    pub(crate) source: Arc<dyn DocumentSource>,
    pub(crate) embedder: Arc<EmbeddingClient>,
    pub(crate) options: IndexingOptions,
    pub(crate) registry: Arc<JobRegistry>,
    pub(crate) active: Arc<ActiveSnapshot>,
    pub(crate) store: Option<SnapshotStore>,
}

impl IndexingRun {
    /// Runs the build on its own task. A watcher task fails the job with
    /// `Internal` if the build panics or is cancelled.
    pub(crate) fn spawn(self) {
        let job_id = self.job_id;
        let registry = Arc::clone(&self.registry);
        let build = tokio::spawn(self.run());
        tokio::spawn(async move {
            if let Err(join_error) = build.await {
                error!(%job_id, error = %join_error, "indexing task aborted");
                registry.fail_with(
                    job_id,
                    ErrorKind::Internal,
                    format!("indexing task aborted: {join_error}"),
                );
            }
        });
    }

    pub(crate) async fn run(self) {
        let job_id = self.job_id;
        match self.execute().await {
            Ok(build_id) => {
                self.registry.complete(job_id, build_id);
                info!(%job_id, %build_id, "indexing job completed");
            }
            Err(failure) => {
                error!(%job_id, kind = ?failure.kind(), error = %failure, "indexing job failed");
                self.registry.fail(job_id, &failure);
            }
        }
    }

    async fn execute(&self) -> Result<Uuid, IngestError> {
        let job_id = self.job_id;
        let config = ChunkingConfig::from(&self.options);
        config.validate()?;

        self.registry.advance(job_id, JobStatus::Extracting, 0);
        info!(%job_id, documents = self.documents.len(), "extracting page text");
        let chunks = self.extract_and_chunk(config).await?;

        if chunks.is_empty() {
            return Err(IngestError::NoContent(format!(
                "{} document(s) produced no chunks",
                self.documents.len()
            )));
        }

        self.registry
            .advance(job_id, JobStatus::Embedding, EXTRACTION_END);
        self.registry.set_total_chunks(job_id, chunks.len());
        info!(%job_id, chunks = chunks.len(), model = self.embedder.model(), "embedding chunks");
        let registry = Arc::clone(&self.registry);
        let embeddings = self
            .embedder
            .embed(&chunks, move |processed, total| {
                registry.record_embedding_progress(job_id, processed, total)
            })
            .await?;

        self.registry
            .advance(job_id, JobStatus::Indexing, EMBEDDING_END);
        info!(%job_id, "building indexes");
        let documents = self.documents.clone();
        let model = self.embedder.model().to_string();
        let dimension = self.embedder.dimensions();
        let options = self.options.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            IndexSnapshot::assemble(chunks, embeddings, &documents, &model, dimension, &options)
        })
        .await
        .map_err(|error| IngestError::IndexBuild(format!("index task failed: {error}")))??;

        if let Some(store) = &self.store {
            store.persist(&snapshot).await?;
        }
        self.registry.advance(job_id, JobStatus::Indexing, PERSISTED);

        let build_id = snapshot.build_id();
        let previous = self.active.replace(Arc::new(snapshot));
        info!(
            %job_id,
            %build_id,
            replaced = ?previous.map(|snapshot| snapshot.build_id()),
            "snapshot activated"
        );
        Ok(build_id)
    }

    async fn extract_and_chunk(&self, config: ChunkingConfig) -> Result<Vec<PdfChunk>, IngestError> {
        let job_id = self.job_id;
        let total = self.documents.len().max(1);
        let mut chunks = Vec::new();

        for (position, document) in self.documents.iter().enumerate() {
            let extracted = match self.source.get_page_texts(&document.document_id).await {
                Ok(pages) => chunk_document(&document.document_id, &pages, config),
                Err(error) => Err(error),
            };

            match extracted {
                Ok(document_chunks) => chunks.extend(document_chunks),
                Err(IngestError::Extraction(reason)) if self.options.skip_unreadable => {
                    warn!(
                        %job_id,
                        document_id = %document.document_id,
                        filename = %document.filename,
                        %reason,
                        "skipping unreadable document"
                    );
                    self.registry.record_skip(
                        job_id,
                        SkippedDocument {
                            document_id: document.document_id.clone(),
                            filename: document.filename.clone(),
                            reason,
                        },
                    );
                }
                Err(error) => return Err(error),
            }

            let reached = usize::from(EXTRACTION_END) * (position + 1) / total;
            self.registry.advance(
                job_id,
                JobStatus::Extracting,
                u8::try_from(reached).unwrap_or(EXTRACTION_END),
            );
        }

        Ok(chunks)
    }
}
