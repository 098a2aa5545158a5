use crate::stores::Bm25Params;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentRecord {
    pub document_id: String,
    pub filename: String,
    pub byte_size: u64,
    pub page_count: Option<u32>,
    pub checksum: String,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PdfChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub page_number: u32,
    pub sequence_index: u64,
    pub text: String,
    pub token_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingVector {
    pub chunk_id: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceMetadata {
    pub document_id: String,
    pub filename: String,
    pub page_number: u32,
    pub sequence_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedPassage {
    pub chunk_id: String,
    pub text: String,
    pub score: f64,
    pub source: SourceMetadata,
    pub vector_score: Option<f64>,
    pub lexical_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    #[default]
    Hybrid,
    Vector,
    Lexical,
}

impl std::str::FromStr for SearchMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(SearchMode::Hybrid),
            "vector" | "dense" => Ok(SearchMode::Vector),
            "lexical" | "keyword" | "bm25" => Ok(SearchMode::Lexical),
            other => Err(format!("unknown search mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SearchQuery {
    pub text: String,
    pub top_k: usize,
    pub mode: SearchMode,
}

impl SearchQuery {
    pub fn hybrid(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            mode: SearchMode::Hybrid,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    #[default]
    Cosine,
    L2,
}

impl std::str::FromStr for SimilarityMetric {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(SimilarityMetric::Cosine),
            "l2" | "euclidean" => Ok(SimilarityMetric::L2),
            other => Err(format!("unknown similarity metric: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexingOptions {
    /// Window length in whitespace tokens.
    pub chunk_size: usize,
    /// Tokens shared between consecutive windows.
    pub chunk_overlap: usize,
    /// Record unreadable documents as skipped instead of failing the job.
    pub skip_unreadable: bool,
    pub metric: SimilarityMetric,
    #[serde(default)]
    pub bm25: Bm25Params,
}

impl Default for IndexingOptions {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 100,
            skip_unreadable: true,
            metric: SimilarityMetric::Cosine,
            bm25: Bm25Params::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalOptions {
    pub vector_weight: f64,
    pub lexical_weight: f64,
    /// Each index is asked for `top_k * candidate_multiplier` hits before fusion.
    pub candidate_multiplier: usize,
    pub default_top_k: usize,
    /// Dense hits scoring at or below this value are dropped before fusion.
    pub min_vector_score: Option<f64>,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            vector_weight: 0.5,
            lexical_weight: 0.5,
            candidate_multiplier: 2,
            default_top_k: 5,
            min_vector_score: None,
        }
    }
}

impl RetrievalOptions {
    pub fn validate(&self) -> Result<(), String> {
        if self.vector_weight < 0.0 || self.lexical_weight < 0.0 {
            return Err("fusion weights must be non-negative".to_string());
        }
        if ((self.vector_weight + self.lexical_weight) - 1.0).abs() > 1e-6 {
            return Err(format!(
                "fusion weights must sum to 1, got {} + {}",
                self.vector_weight, self.lexical_weight
            ));
        }
        if self.candidate_multiplier == 0 {
            return Err("candidate_multiplier must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn candidate_breadth(&self, top_k: usize) -> usize {
        top_k.saturating_mul(self.candidate_multiplier.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retrieval_options_are_valid() {
        let options = RetrievalOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(options.candidate_breadth(5), 10);
    }

    #[test]
    fn weights_not_summing_to_one_are_rejected() {
        let options = RetrievalOptions {
            vector_weight: 0.7,
            lexical_weight: 0.7,
            ..RetrievalOptions::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn similarity_metric_parses_names() {
        assert_eq!("cosine".parse::<SimilarityMetric>(), Ok(SimilarityMetric::Cosine));
        assert_eq!(" L2 ".parse::<SimilarityMetric>(), Ok(SimilarityMetric::L2));
        assert_eq!("euclidean".parse::<SimilarityMetric>(), Ok(SimilarityMetric::L2));
        assert!("dot".parse::<SimilarityMetric>().is_err());
    }

    #[test]
    fn indexing_options_without_bm25_settings_use_defaults() -> Result<(), serde_json::Error> {
        let options: IndexingOptions = serde_json::from_value(serde_json::json!({
            "chunk_size": 200,
            "chunk_overlap": 20,
            "skip_unreadable": false,
            "metric": "l2"
        }))?;
        assert_eq!(options.bm25, Bm25Params::default());
        assert_eq!(options.metric, SimilarityMetric::L2);
        Ok(())
    }

    #[test]
    fn search_mode_parses_aliases() {
        assert_eq!("bm25".parse::<SearchMode>(), Ok(SearchMode::Lexical));
        assert_eq!("Dense".parse::<SearchMode>(), Ok(SearchMode::Vector));
        assert_eq!("hybrid".parse::<SearchMode>(), Ok(SearchMode::Hybrid));
        assert!("graph".parse::<SearchMode>().is_err());
    }
}
