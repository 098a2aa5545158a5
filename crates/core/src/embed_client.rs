//! Batched, retrying front end over an [`EmbeddingProvider`].
//!
//! Chunks are grouped into fixed-size batches, up to `max_in_flight` batches
//! are dispatched at once, and results are collected in input order. Each
//! provider call carries a timeout; timeouts, rate limits and 5xx responses
//! are retried with exponential backoff. A batch that exhausts its attempts
//! fails the whole call, since a partially embedded corpus cannot be indexed.

use crate::embeddings::EmbeddingProvider;
use crate::error::{IngestError, ProviderError};
use crate::models::{EmbeddingVector, PdfChunk};
use futures::{stream, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingSettings {
    pub batch_size: usize,
    pub max_attempts: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_base_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub retry_max_delay: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    pub max_in_flight: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_attempts: 4,
            retry_base_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(8),
            request_timeout: Duration::from_secs(30),
            max_in_flight: 2,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    fn from_settings(settings: &EmbeddingSettings) -> Self {
        let base = settings.retry_base_delay.as_millis().max(1) as u64;
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay_ms: base,
            max_delay_ms: (settings.retry_max_delay.as_millis() as u64).max(base),
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(backoff.min(self.max_delay_ms))
    }
}

pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    settings: EmbeddingSettings,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, settings: EmbeddingSettings) -> Self {
        Self { provider, settings }
    }

    pub fn model(&self) -> &str {
        self.provider.model()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn settings(&self) -> &EmbeddingSettings {
        &self.settings
    }

    /// Embeds every chunk, calling `on_progress(embedded, total)` after each
    /// batch lands. Output order matches `chunks`.
    pub async fn embed<F>(
        &self,
        chunks: &[PdfChunk],
        mut on_progress: F,
    ) -> Result<Vec<EmbeddingVector>, IngestError>
    where
        F: FnMut(usize, usize) + Send,
    {
        let total = chunks.len();
        let batch_size = self.settings.batch_size.max(1);
        let owned: Vec<Vec<PdfChunk>> = chunks.chunks(batch_size).map(<[PdfChunk]>::to_vec).collect();
        let mut batches = stream::iter(owned.into_iter().enumerate())
            .map(|(batch_index, batch)| {
                async move { self.embed_batch(batch_index, &batch).await }.boxed()
            })
            .buffered(self.settings.max_in_flight.max(1));

        let mut vectors = Vec::with_capacity(total);
        while let Some(batch) = batches.next().await {
            vectors.extend(batch?);
            on_progress(vectors.len(), total);
        }

        Ok(vectors)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, IngestError> {
        let texts = vec![text.to_string()];
        let mut vectors = self.call_with_retry(&texts).await?;
        vectors.pop().ok_or_else(|| IngestError::Embedding {
            attempts: 1,
            last_error: "provider returned no query vector".to_string(),
        })
    }

    async fn embed_batch(
        &self,
        batch_index: usize,
        batch: &[PdfChunk],
    ) -> Result<Vec<EmbeddingVector>, IngestError> {
        let texts: Vec<String> = batch.iter().map(|chunk| chunk.text.clone()).collect();
        let vectors = self.call_with_retry(&texts).await?;
        debug!(batch_index, size = batch.len(), "embedded batch");

        Ok(batch
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddingVector {
                chunk_id: chunk.chunk_id.clone(),
                vector,
            })
            .collect())
    }

    async fn call_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IngestError> {
        let policy = RetryPolicy::from_settings(&self.settings);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(
                self.settings.request_timeout,
                self.provider.embed_batch(texts),
            )
            .await
            {
                Ok(result) => result.and_then(|vectors| self.check_shape(texts.len(), vectors)),
                Err(_) => Err(ProviderError::Timeout(
                    self.settings.request_timeout.as_millis() as u64,
                )),
            };

            match outcome {
                Ok(vectors) => return Ok(vectors),
                Err(error) if error.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "embedding call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(IngestError::Embedding {
                        attempts: attempt,
                        last_error: error.to_string(),
                    })
                }
            }
        }
    }

    fn check_shape(
        &self,
        expected: usize,
        vectors: Vec<Vec<f32>>,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        if vectors.len() != expected {
            return Err(ProviderError::InvalidResponse(format!(
                "expected {expected} vectors, got {}",
                vectors.len()
            )));
        }
        let dimensions = self.provider.dimensions();
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != dimensions) {
            return Err(ProviderError::InvalidResponse(format!(
                "embedding dimension {} != {dimensions}",
                bad.len()
            )));
        }
        Ok(vectors)
    }
}
