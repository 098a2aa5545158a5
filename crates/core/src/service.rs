use crate::chunking::ChunkingConfig;
use crate::embed_client::EmbeddingClient;
use crate::error::SearchError;
use crate::jobs::{IndexingRun, JobRegistry, JobState};
use crate::models::{
    IndexingOptions, RetrievalOptions, RetrievedPassage, SearchMode, SearchQuery,
};
use crate::retriever::HybridRetriever;
use crate::snapshot::{ActiveSnapshot, IndexSnapshot, SnapshotStore};
use crate::traits::DocumentSource;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemStats {
    pub ready: bool,
    pub build_id: Option<Uuid>,
    pub built_at: Option<DateTime<Utc>>,
    pub chunk_count: usize,
    pub document_count: usize,
    pub average_chunk_chars: f64,
    pub total_text_chars: usize,
    pub embedding_model: Option<String>,
    pub dimension: Option<usize>,
    pub active_job: Option<Uuid>,
}

/// Entry point for callers: starts indexing jobs, reports their status and
/// answers queries against the active snapshot.
pub struct KnowledgeService {
    source: Arc<dyn DocumentSource>,
    embedder: Arc<EmbeddingClient>,
    retriever: HybridRetriever,
    indexing: IndexingOptions,
    jobs: Arc<JobRegistry>,
    active: Arc<ActiveSnapshot>,
    store: Option<SnapshotStore>,
}

impl KnowledgeService {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        embedder: Arc<EmbeddingClient>,
        indexing: IndexingOptions,
        retrieval: RetrievalOptions,
    ) -> Result<Self, SearchError> {
        ChunkingConfig::from(&indexing).validate()?;
        indexing.bm25.validate().map_err(SearchError::Request)?;
        Ok(Self {
            source,
            embedder,
            retriever: HybridRetriever::new(retrieval)?,
            indexing,
            jobs: Arc::new(JobRegistry::default()),
            active: Arc::new(ActiveSnapshot::default()),
            store: None,
        })
    }

    /// Persist every completed build under `store`.
    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Serves the persisted active snapshot, if any. Returns whether one was
    /// loaded.
    pub async fn load_persisted(&self) -> Result<bool, SearchError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        match store.load_active().await? {
            Some(snapshot) => {
                info!(build_id = %snapshot.build_id(), "serving persisted snapshot");
                self.active.replace(Arc::new(snapshot));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Queues a build over `document_ids` (every known document when empty)
    /// and returns immediately. Must be called inside a tokio runtime.
    pub fn start_indexing(&self, document_ids: &[String]) -> Result<Uuid, SearchError> {
        let documents = if document_ids.is_empty() {
            self.source.documents()
        } else {
            let mut seen = HashSet::new();
            let mut documents = Vec::with_capacity(document_ids.len());
            for document_id in document_ids {
                if !seen.insert(document_id.as_str()) {
                    continue;
                }
                let document = self.source.document(document_id).ok_or_else(|| {
                    SearchError::NotFound(format!("document {document_id}"))
                })?;
                documents.push(document);
            }
            documents
        };
        if documents.is_empty() {
            return Err(SearchError::Request("no documents to index".to_string()));
        }

        let job_id = self.jobs.begin(
            documents
                .iter()
                .map(|document| document.document_id.clone())
                .collect(),
        )?;
        info!(%job_id, documents = documents.len(), "indexing job queued");

        let run = IndexingRun {
            job_id,
            documents,
            source: Arc::clone(&self.source),
            embedder: Arc::clone(&self.embedder),
            options: self.indexing.clone(),
            registry: Arc::clone(&self.jobs),
            active: Arc::clone(&self.active),
            store: self.store.clone(),
        };
        run.spawn();

        Ok(job_id)
    }

    pub fn job_status(&self, job_id: Uuid) -> Result<JobState, SearchError> {
        self.jobs
            .get(job_id)
            .ok_or_else(|| SearchError::NotFound(format!("job {job_id}")))
    }

    /// Newest first.
    pub fn jobs(&self) -> Vec<JobState> {
        self.jobs.list()
    }

    pub fn active_snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.active.current()
    }

    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievedPassage>, SearchError> {
        self.search(SearchQuery::hybrid(text, k)).await
    }

    pub async fn search(&self, query: SearchQuery) -> Result<Vec<RetrievedPassage>, SearchError> {
        if query.text.trim().is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }
        let snapshot = self
            .active
            .current()
            .ok_or_else(|| SearchError::NotReady("no index has been built yet".to_string()))?;
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        let query_vector = match query.mode {
            SearchMode::Lexical => None,
            SearchMode::Hybrid | SearchMode::Vector => {
                let manifest = snapshot.manifest();
                if manifest.embedding_model != self.embedder.model()
                    || manifest.dimension != self.embedder.dimensions()
                {
                    return Err(SearchError::Request(format!(
                        "snapshot was built with {} ({} dims) but queries use {} ({} dims)",
                        manifest.embedding_model,
                        manifest.dimension,
                        self.embedder.model(),
                        self.embedder.dimensions()
                    )));
                }
                Some(self.embedder.embed_query(&query.text).await?)
            }
        };

        let passages = self
            .retriever
            .retrieve(&snapshot, &query, query_vector.as_deref())?;
        debug!(
            build_id = %snapshot.build_id(),
            top_k = query.top_k,
            returned = passages.len(),
            "query answered"
        );
        Ok(passages)
    }

    pub fn default_top_k(&self) -> usize {
        self.retriever.options().default_top_k
    }

    pub fn stats(&self) -> SystemStats {
        let active_job = self.jobs.active().map(|job| job.job_id);
        let Some(snapshot) = self.active.current() else {
            return SystemStats {
                ready: false,
                build_id: None,
                built_at: None,
                chunk_count: 0,
                document_count: 0,
                average_chunk_chars: 0.0,
                total_text_chars: 0,
                embedding_model: None,
                dimension: None,
                active_job,
            };
        };

        let manifest = snapshot.manifest();
        let total_text_chars: usize = snapshot
            .chunks()
            .iter()
            .map(|chunk| chunk.text.chars().count())
            .sum();
        let average_chunk_chars = if snapshot.chunk_count() == 0 {
            0.0
        } else {
            total_text_chars as f64 / snapshot.chunk_count() as f64
        };

        SystemStats {
            ready: true,
            build_id: Some(manifest.build_id),
            built_at: Some(manifest.created_at),
            chunk_count: snapshot.chunk_count(),
            document_count: manifest.document_ids.len(),
            average_chunk_chars,
            total_text_chars,
            embedding_model: Some(manifest.embedding_model.clone()),
            dimension: Some(manifest.dimension),
            active_job,
        }
    }
}
