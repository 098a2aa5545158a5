use crate::error::IngestError;
use crate::models::{EmbeddingVector, ScoredChunk, SimilarityMetric};
use crate::traits::VectorIndex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Accumulates vectors for a new index. Consumed by [`VectorIndexBuilder::build`].
#[derive(Debug)]
pub struct VectorIndexBuilder {
    dimension: usize,
    metric: SimilarityMetric,
    chunk_ids: Vec<String>,
    seen: HashSet<String>,
    data: Vec<f32>,
}

impl VectorIndexBuilder {
    pub fn new(dimension: usize, metric: SimilarityMetric) -> Self {
        Self {
            dimension,
            metric,
            chunk_ids: Vec::new(),
            seen: HashSet::new(),
            data: Vec::new(),
        }
    }

    pub fn push(&mut self, embedding: EmbeddingVector) -> Result<(), IngestError> {
        if embedding.vector.len() != self.dimension {
            return Err(IngestError::IndexBuild(format!(
                "chunk {} has dimension {}, index expects {}",
                embedding.chunk_id,
                embedding.vector.len(),
                self.dimension
            )));
        }
        if embedding.vector.iter().any(|value| !value.is_finite()) {
            return Err(IngestError::IndexBuild(format!(
                "chunk {} has a non-finite component",
                embedding.chunk_id
            )));
        }
        if !self.seen.insert(embedding.chunk_id.clone()) {
            return Err(IngestError::IndexBuild(format!(
                "duplicate chunk id {}",
                embedding.chunk_id
            )));
        }

        self.data.extend_from_slice(&embedding.vector);
        self.chunk_ids.push(embedding.chunk_id);
        Ok(())
    }

    pub fn build(self) -> FlatVectorIndex {
        let norms = self
            .data
            .chunks(self.dimension.max(1))
            .map(|row| row.iter().map(|value| value * value).sum::<f32>().sqrt())
            .collect();

        FlatVectorIndex {
            dimension: self.dimension,
            metric: self.metric,
            chunk_ids: self.chunk_ids,
            data: self.data,
            norms,
        }
    }
}

/// Exact nearest-neighbour index over a contiguous row-major matrix.
///
/// Scores are similarities (higher is closer): cosine similarity for
/// [`SimilarityMetric::Cosine`], `1 / (1 + distance)` for [`SimilarityMetric::L2`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlatVectorIndex {
    dimension: usize,
    metric: SimilarityMetric,
    chunk_ids: Vec<String>,
    data: Vec<f32>,
    norms: Vec<f32>,
}

impl FlatVectorIndex {
    pub fn build(
        dimension: usize,
        metric: SimilarityMetric,
        vectors: Vec<EmbeddingVector>,
    ) -> Result<Self, IngestError> {
        let mut builder = VectorIndexBuilder::new(dimension, metric);
        for vector in vectors {
            builder.push(vector)?;
        }
        Ok(builder.build())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn metric(&self) -> SimilarityMetric {
        self.metric
    }

    pub fn chunk_ids(&self) -> &[String] {
        &self.chunk_ids
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunk_ids.iter().any(|id| id == chunk_id)
    }

    /// Checks that the flat storage matches the declared shape. Deserialized
    /// indexes must pass this before they are searched.
    pub fn check_integrity(&self) -> Result<(), String> {
        let expected = self.chunk_ids.len().checked_mul(self.dimension);
        if expected != Some(self.data.len()) {
            return Err(format!(
                "vector data holds {} values, expected {} rows of {}",
                self.data.len(),
                self.chunk_ids.len(),
                self.dimension
            ));
        }
        if self.norms.len() != self.chunk_ids.len() {
            return Err(format!(
                "{} norms for {} vectors",
                self.norms.len(),
                self.chunk_ids.len()
            ));
        }
        if self.data.iter().chain(&self.norms).any(|value| !value.is_finite()) {
            return Err("vector data has a non-finite component".to_string());
        }
        Ok(())
    }

    fn row(&self, position: usize) -> &[f32] {
        let start = position * self.dimension;
        &self.data[start..start + self.dimension]
    }

    fn similarity(&self, position: usize, query: &[f32], query_norm: f32) -> f64 {
        let row = self.row(position);
        match self.metric {
            SimilarityMetric::Cosine => {
                let norm = self.norms[position];
                if norm == 0.0 || query_norm == 0.0 {
                    return 0.0;
                }
                let dot: f32 = row.iter().zip(query).map(|(a, b)| a * b).sum();
                f64::from(dot / (norm * query_norm))
            }
            SimilarityMetric::L2 => {
                let distance = row
                    .iter()
                    .zip(query)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + f64::from(distance))
            }
        }
    }
}

impl VectorIndex for FlatVectorIndex {
    fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    fn search_vector(&self, query: &[f32], k: usize) -> Result<Vec<ScoredChunk>, IngestError> {
        if self.chunk_ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(IngestError::InvalidArgument(format!(
                "query vector dim {} is not {}",
                query.len(),
                self.dimension
            )));
        }

        let query_norm = query.iter().map(|value| value * value).sum::<f32>().sqrt();
        let mut scored: Vec<(usize, f64)> = (0..self.chunk_ids.len())
            .map(|position| (position, self.similarity(position, query, query_norm)))
            .collect();

        scored.sort_by(|left, right| {
            right
                .1
                .partial_cmp(&left.1)
                .unwrap_or(Ordering::Equal)
                .then(left.0.cmp(&right.0))
        });

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(position, score)| ScoredChunk {
                chunk_id: self.chunk_ids[position].clone(),
                score,
            })
            .collect())
    }
}
