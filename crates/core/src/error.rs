use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("text extraction failed: {0}")]
    Extraction(String),

    #[error("embedding failed after {attempts} attempt(s): {last_error}")]
    Embedding { attempts: u32, last_error: String },

    #[error("no indexable content: {0}")]
    NoContent(String),

    #[error("index build failed: {0}")]
    IndexBuild(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Extraction(_) => ErrorKind::Extraction,
            IngestError::Embedding { .. } => ErrorKind::Embedding,
            IngestError::NoContent(_) => ErrorKind::NoContent,
            IngestError::IndexBuild(_) | IngestError::Serialization(_) => ErrorKind::IndexBuild,
            IngestError::Io(_)
            | IngestError::InvalidChunkConfig(_)
            | IngestError::InvalidArgument(_) => ErrorKind::Internal,
        }
    }
}

/// A single failed call to an upstream embedding provider.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("rate limited by upstream: {0}")]
    RateLimited(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream rejected request with {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_)
                | ProviderError::Timeout(_)
                | ProviderError::Upstream { .. }
                | ProviderError::Transport(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ProviderError::Timeout(0)
        } else if error.is_decode() {
            ProviderError::InvalidResponse(error.to_string())
        } else {
            ProviderError::Transport(error.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("an indexing job is already running: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("knowledge base not ready: {0}")]
    NotReady(String),

    #[error("search request failed: {0}")]
    Request(String),

    #[error("query embedding failed: {0}")]
    Embedding(String),

    #[error("snapshot unavailable: {0}")]
    Snapshot(String),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
}

impl SearchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SearchError::Conflict(_) => ErrorKind::Conflict,
            SearchError::NotFound(_) => ErrorKind::NotFound,
            SearchError::NotReady(_) => ErrorKind::NotReady,
            SearchError::Embedding(_) => ErrorKind::Embedding,
            SearchError::Request(_) | SearchError::Snapshot(_) | SearchError::Url(_) => {
                ErrorKind::Internal
            }
        }
    }
}

impl From<IngestError> for SearchError {
    fn from(error: IngestError) -> Self {
        match error {
            IngestError::Embedding { .. } => SearchError::Embedding(error.to_string()),
            other => SearchError::Request(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Extraction,
    Embedding,
    NoContent,
    IndexBuild,
    Conflict,
    NotFound,
    NotReady,
    Internal,
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
