use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use pdf_rag_core::{
    Bm25Params, CharacterNgramEmbedder, EmbeddingClient, EmbeddingEndpointConfig, EmbeddingProvider,
    EmbeddingSettings, FolderDocumentStore, IndexingOptions, KnowledgeService,
    MemoryDocumentStore, OpenAiEmbeddingProvider, RetrievalOptions, SearchMode, SearchQuery,
    SimilarityMetric, SnapshotStore, DEFAULT_API_BASE_URL, DEFAULT_EMBEDDING_DIMENSIONS, DEFAULT_EMBEDDING_MODEL,
    DEFAULT_REMOTE_DIMENSIONS,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding persisted index snapshots.
    #[arg(long, env = "PDF_RAG_INDEX_DIR", default_value = ".pdf-rag", global = true)]
    index_dir: PathBuf,

    #[command(flatten)]
    embedding: EmbeddingArgs,

    #[command(flatten)]
    retrieval: RetrievalArgs,
}

#[derive(Args)]
struct EmbeddingArgs {
    /// Embed locally with the character-trigram hasher instead of calling an API.
    #[arg(long, env = "PDF_RAG_OFFLINE", global = true, default_value_t = false)]
    offline: bool,

    /// Vector length of the offline embedder.
    #[arg(long, env = "PDF_RAG_OFFLINE_DIMENSIONS", global = true, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    offline_dimensions: usize,

    /// Base URL of an OpenAI-compatible embeddings API.
    #[arg(long, env = "API_BASE_URL", global = true, default_value = DEFAULT_API_BASE_URL)]
    api_base_url: String,

    #[arg(long, env = "OPENAI_API_KEY", global = true, hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long, env = "EMBEDDING_MODEL", global = true, default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    #[arg(long, env = "EMBEDDING_DIMENSIONS", global = true, default_value_t = DEFAULT_REMOTE_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Chunks per embedding request.
    #[arg(long, env = "PDF_RAG_BATCH_SIZE", global = true, default_value_t = 32)]
    batch_size: usize,

    /// Embedding requests in flight at once.
    #[arg(long, env = "PDF_RAG_MAX_IN_FLIGHT", global = true, default_value_t = 2)]
    max_in_flight: usize,

    #[arg(long, env = "PDF_RAG_MAX_ATTEMPTS", global = true, default_value_t = 4)]
    max_attempts: u32,

    /// First retry delay in milliseconds; doubles per attempt.
    #[arg(long, env = "PDF_RAG_RETRY_BASE_DELAY_MS", global = true, default_value_t = 500)]
    retry_base_delay_ms: u64,

    /// Upper bound on a single retry delay in milliseconds.
    #[arg(long, env = "PDF_RAG_RETRY_MAX_DELAY_MS", global = true, default_value_t = 8_000)]
    retry_max_delay_ms: u64,

    /// Per-request timeout in seconds.
    #[arg(long, env = "PDF_RAG_REQUEST_TIMEOUT", global = true, default_value_t = 30)]
    request_timeout: u64,
}

#[derive(Args)]
struct RetrievalArgs {
    /// Share of the fused score taken from vector similarity; the rest is BM25.
    #[arg(long, env = "PDF_RAG_VECTOR_WEIGHT", global = true, default_value_t = 0.5)]
    vector_weight: f64,

    /// Hits fetched from each index per requested result before fusion.
    #[arg(long, env = "PDF_RAG_CANDIDATE_MULTIPLIER", global = true, default_value_t = 2)]
    candidate_multiplier: usize,

    /// Drop vector hits at or below this similarity.
    #[arg(long, env = "PDF_RAG_MIN_VECTOR_SCORE", global = true)]
    min_vector_score: Option<f64>,
}

#[derive(Subcommand)]
enum Command {
    /// Index every PDF under a folder and activate the new snapshot.
    Index {
        /// Folder that contains PDFs recursively.
        #[arg(long)]
        folder: PathBuf,
        /// Window length in whitespace tokens.
        #[arg(long, env = "PDF_RAG_CHUNK_SIZE", default_value_t = 500)]
        chunk_size: usize,
        /// Tokens shared by consecutive windows.
        #[arg(long, env = "PDF_RAG_CHUNK_OVERLAP", default_value_t = 100)]
        chunk_overlap: usize,
        /// Fail the job on the first unreadable PDF instead of skipping it.
        #[arg(long, env = "PDF_RAG_STRICT", default_value_t = false)]
        strict: bool,
        /// Vector similarity: cosine or l2.
        #[arg(long, env = "PDF_RAG_METRIC", default_value = "cosine")]
        metric: SimilarityMetric,
        /// BM25 term-frequency saturation.
        #[arg(long, env = "PDF_RAG_BM25_K1", default_value_t = 1.5)]
        bm25_k1: f64,
        /// BM25 length normalization, between 0 and 1.
        #[arg(long, env = "PDF_RAG_BM25_B", default_value_t = 0.75)]
        bm25_b: f64,
    },
    /// Query the active snapshot.
    Query {
        /// Search query
        #[arg(long)]
        query: String,
        /// Number of passages to return.
        #[arg(long, env = "PDF_RAG_TOP_K", default_value_t = 5)]
        top_k: usize,
        /// hybrid, vector or lexical.
        #[arg(long, env = "PDF_RAG_MODE", default_value = "hybrid")]
        mode: SearchMode,
        /// Print per-signal score contributions.
        #[arg(long, default_value_t = false)]
        explain: bool,
    },
    /// Show statistics for the active snapshot.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "pdf-rag boot"
    );

    let embedder = Arc::new(EmbeddingClient::new(
        embedding_provider(&cli.embedding)?,
        EmbeddingSettings {
            batch_size: cli.embedding.batch_size,
            max_in_flight: cli.embedding.max_in_flight,
            max_attempts: cli.embedding.max_attempts,
            retry_base_delay: Duration::from_millis(cli.embedding.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(cli.embedding.retry_max_delay_ms),
            request_timeout: Duration::from_secs(cli.embedding.request_timeout),
        },
    ));
    let retrieval = RetrievalOptions {
        vector_weight: cli.retrieval.vector_weight,
        lexical_weight: 1.0 - cli.retrieval.vector_weight,
        candidate_multiplier: cli.retrieval.candidate_multiplier,
        min_vector_score: cli.retrieval.min_vector_score,
        ..RetrievalOptions::default()
    };
    let store = SnapshotStore::new(&cli.index_dir);

    match cli.command {
        Command::Index {
            folder,
            chunk_size,
            chunk_overlap,
            strict,
            metric,
            bm25_k1,
            bm25_b,
        } => {
            let indexing = IndexingOptions {
                chunk_size,
                chunk_overlap,
                skip_unreadable: !strict,
                metric,
                bm25: Bm25Params { k1: bm25_k1, b: bm25_b },
            };
            run_index(&folder, embedder, indexing, retrieval, store).await?;
        }
        Command::Query {
            query,
            top_k,
            mode,
            explain,
        } => {
            let service = open_for_reading(embedder, retrieval, store).await?;
            let passages = service
                .search(SearchQuery {
                    text: query.clone(),
                    top_k,
                    mode,
                })
                .await?;

            println!("query: {query}");
            if passages.is_empty() {
                println!("no passages matched");
            }
            for (rank, passage) in passages.iter().enumerate() {
                println!(
                    "[{}] score={:.4} file={} page={} chunk={}",
                    rank + 1,
                    passage.score,
                    passage.source.filename,
                    passage.source.page_number,
                    passage.chunk_id
                );
                if explain {
                    println!(
                        "  explain: vector={} lexical={}",
                        format_signal(passage.vector_score),
                        format_signal(passage.lexical_score)
                    );
                }
                println!("  {}", passage.text);
            }
        }
        Command::Stats => {
            let service = open_for_reading(embedder, retrieval, store).await?;
            let stats = service.stats();
            if !stats.ready {
                println!("no index has been built in {}", cli.index_dir.display());
                return Ok(());
            }
            if let Some(build_id) = stats.build_id {
                println!("build_id: {build_id}");
            }
            if let Some(built_at) = stats.built_at {
                println!("built_at: {}", built_at.to_rfc3339());
            }
            println!("documents: {}", stats.document_count);
            println!("chunks: {}", stats.chunk_count);
            println!("average_chunk_chars: {:.1}", stats.average_chunk_chars);
            println!("total_text_chars: {}", stats.total_text_chars);
            if let (Some(model), Some(dimension)) = (&stats.embedding_model, stats.dimension) {
                println!("embedding_model: {model} ({dimension} dims)");
            }
        }
    }

    Ok(())
}

fn embedding_provider(args: &EmbeddingArgs) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    if args.offline {
        return Ok(Arc::new(CharacterNgramEmbedder {
            dimensions: args.offline_dimensions,
        }));
    }
    if args.api_key.is_none() {
        warn!(base_url = %args.api_base_url, "no api key set; requests are sent unauthenticated");
    }

    let provider = OpenAiEmbeddingProvider::new(EmbeddingEndpointConfig {
        base_url: args.api_base_url.clone(),
        api_key: args.api_key.clone(),
        model: args.embedding_model.clone(),
        dimensions: args.embedding_dimensions,
    })?;
    info!(endpoint = %provider.endpoint(), model = %args.embedding_model, "remote embeddings");
    Ok(Arc::new(provider))
}

async fn run_index(
    folder: &Path,
    embedder: Arc<EmbeddingClient>,
    indexing: IndexingOptions,
    retrieval: RetrievalOptions,
    store: SnapshotStore,
) -> anyhow::Result<()> {
    let documents = Arc::new(FolderDocumentStore::open(folder)?);
    let service = KnowledgeService::new(documents, embedder, indexing, retrieval)?.with_store(store);

    let job_id = service.start_indexing(&[])?;
    info!(%job_id, folder = %folder.display(), "indexing started");

    let mut last_progress = None;
    let job = loop {
        let job = service.job_status(job_id)?;
        if last_progress != Some((job.status, job.progress_percent)) {
            println!("{:?} {}%", job.status, job.progress_percent);
            last_progress = Some((job.status, job.progress_percent));
        }
        if job.status.is_terminal() {
            break job;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    for skipped in &job.skipped_documents {
        warn!(file = %skipped.filename, reason = %skipped.reason, "skipped pdf");
    }
    if let Some(error) = job.error {
        anyhow::bail!("indexing failed ({:?}): {}", error.kind, error.message);
    }

    println!(
        "{} chunks indexed from {} document(s), {} skipped, build {}",
        job.total_chunk_count,
        job.document_ids.len() - job.skipped_documents.len(),
        job.skipped_documents.len(),
        job.build_id.map(|id| id.to_string()).unwrap_or_default()
    );
    Ok(())
}

async fn open_for_reading(
    embedder: Arc<EmbeddingClient>,
    retrieval: RetrievalOptions,
    store: SnapshotStore,
) -> anyhow::Result<KnowledgeService> {
    let service = KnowledgeService::new(
        Arc::new(MemoryDocumentStore::new()),
        embedder,
        IndexingOptions::default(),
        retrieval,
    )?
    .with_store(store);
    service.load_persisted().await?;
    Ok(service)
}

fn format_signal(score: Option<f64>) -> String {
    score
        .map(|value| format!("{value:.4}"))
        .unwrap_or_else(|| "-".to_string())
}
