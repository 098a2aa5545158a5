use crate::error::IngestError;
use crate::extractor::{extract_page_texts, PageText};
use crate::models::{DocumentRecord, ScoredChunk};
use async_trait::async_trait;

pub trait KeywordIndex {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn search_keyword(&self, query: &str, k: usize) -> Vec<ScoredChunk>;
}

pub trait VectorIndex {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn search_vector(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, IngestError>;
}

/// Storage collaborator that owns uploaded documents.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn document(&self, document_id: &str) -> Option<DocumentRecord>;

    fn documents(&self) -> Vec<DocumentRecord>;

    async fn get_document_bytes(&self, document_id: &str) -> Result<Vec<u8>, IngestError>;

    async fn get_page_texts(&self, document_id: &str) -> Result<Vec<PageText>, IngestError> {
        let bytes = self.get_document_bytes(document_id).await?;
        extract_off_thread(bytes).await
    }
}

/// Runs PDF text extraction on the blocking pool.
pub async fn extract_off_thread(bytes: Vec<u8>) -> Result<Vec<PageText>, IngestError> {
    tokio::task::spawn_blocking(move || extract_page_texts(&bytes))
        .await
        .map_err(|error| IngestError::Extraction(format!("extractor task failed: {error}")))?
}
