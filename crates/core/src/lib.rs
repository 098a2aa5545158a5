pub mod chunking;
pub mod embed_client;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod jobs;
pub mod models;
pub mod retriever;
pub mod service;
pub mod snapshot;
pub mod stores;
pub mod traits;

pub use chunking::{chunk_document, normalize_whitespace, ChunkingConfig};
pub use embed_client::{EmbeddingClient, EmbeddingSettings};
pub use embeddings::{
    CharacterNgramEmbedder, EmbeddingEndpointConfig, EmbeddingProvider, OpenAiEmbeddingProvider,
    DEFAULT_API_BASE_URL, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_EMBEDDING_MODEL,
    DEFAULT_REMOTE_DIMENSIONS,
};
pub use error::{ErrorKind, IngestError, ProviderError, SearchError};
pub use extractor::{count_pages, extract_page_texts, LopdfExtractor, PageText, PdfExtractor};
pub use ingest::{discover_pdf_files, digest_file, FolderDocumentStore, MemoryDocumentStore};
pub use jobs::{JobError, JobRegistry, JobState, JobStatus, SkippedDocument};
pub use models::{
    DocumentRecord, EmbeddingVector, IndexingOptions, PdfChunk, RetrievalOptions,
    RetrievedPassage, ScoredChunk, SearchMode, SearchQuery, SimilarityMetric, SourceMetadata,
};
pub use retriever::{FusedHit, HybridRetriever};
pub use service::{KnowledgeService, SystemStats};
pub use snapshot::{ActiveSnapshot, IndexSnapshot, SnapshotManifest, SnapshotStore};
pub use stores::{tokenize, Bm25Index, Bm25Params, FlatVectorIndex, VectorIndexBuilder};
pub use traits::{DocumentSource, KeywordIndex, VectorIndex};
