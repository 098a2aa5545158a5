use crate::error::SearchError;
use crate::models::{
    RetrievalOptions, RetrievedPassage, ScoredChunk, SearchMode, SearchQuery, SourceMetadata,
};
use crate::snapshot::IndexSnapshot;
use crate::traits::{KeywordIndex, VectorIndex};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub chunk_id: String,
    pub score: f64,
    pub vector_score: Option<f64>,
    pub lexical_score: Option<f64>,
    insertion_order: usize,
}

/// Blends dense and lexical rankings into one list.
///
/// Each signal's scores are rescaled to `[0, 1]` before weighting; a chunk
/// seen by only one signal is scored from that signal alone.
#[derive(Debug, Clone)]
pub struct HybridRetriever {
    options: RetrievalOptions,
}

impl HybridRetriever {
    pub fn new(options: RetrievalOptions) -> Result<Self, SearchError> {
        options.validate().map_err(SearchError::Request)?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &RetrievalOptions {
        &self.options
    }

    /// Candidate lists from both indexes, each `top_k * candidate_multiplier` long.
    pub fn search_indexes<V, K>(
        &self,
        vector: &V,
        lexical: &K,
        query: &SearchQuery,
        query_vector: Option<&[f32]>,
    ) -> Result<(Vec<ScoredChunk>, Vec<ScoredChunk>), SearchError>
    where
        V: VectorIndex + ?Sized,
        K: KeywordIndex + ?Sized,
    {
        let breadth = self.options.candidate_breadth(query.top_k);

        let vector_hits = match (query.mode, query_vector) {
            (SearchMode::Lexical, _) => Vec::new(),
            (_, Some(query_vector)) => {
                let mut hits = vector
                    .search_vector(query_vector, breadth)
                    .map_err(|error| SearchError::Request(error.to_string()))?;
                if let Some(floor) = self.options.min_vector_score {
                    hits.retain(|hit| hit.score > floor);
                }
                hits
            }
            (_, None) => {
                return Err(SearchError::Request(
                    "dense retrieval requires a query vector".to_string(),
                ))
            }
        };

        let lexical_hits = match query.mode {
            SearchMode::Vector => Vec::new(),
            SearchMode::Hybrid | SearchMode::Lexical => lexical.search_keyword(&query.text, breadth),
        };

        Ok((vector_hits, lexical_hits))
    }

    /// Fuses candidate lists; `insertion_order` resolves tie-breaks and drops
    /// chunks unknown to the serving snapshot.
    pub fn fuse<F>(
        &self,
        vector_hits: &[ScoredChunk],
        lexical_hits: &[ScoredChunk],
        mode: SearchMode,
        top_k: usize,
        insertion_order: F,
    ) -> Vec<FusedHit>
    where
        F: Fn(&str) -> Option<usize>,
    {
        let (vector_weight, lexical_weight) = match mode {
            SearchMode::Hybrid => (self.options.vector_weight, self.options.lexical_weight),
            SearchMode::Vector => (1.0, 0.0),
            SearchMode::Lexical => (0.0, 1.0),
        };

        let mut fused: HashMap<&str, FusedHit> = HashMap::new();
        for (hit, normalized) in vector_hits.iter().zip(normalize_scores(vector_hits)) {
            let Some(order) = insertion_order(&hit.chunk_id) else {
                continue;
            };
            let entry = fused
                .entry(hit.chunk_id.as_str())
                .or_insert_with(|| empty_hit(&hit.chunk_id, order));
            entry.vector_score = Some(normalized);
            entry.score += vector_weight * normalized;
        }
        for (hit, normalized) in lexical_hits.iter().zip(normalize_scores(lexical_hits)) {
            let Some(order) = insertion_order(&hit.chunk_id) else {
                continue;
            };
            let entry = fused
                .entry(hit.chunk_id.as_str())
                .or_insert_with(|| empty_hit(&hit.chunk_id, order));
            entry.lexical_score = Some(normalized);
            entry.score += lexical_weight * normalized;
        }

        // Zero fused score means no signal found any evidence.
        let mut ranked: Vec<FusedHit> = fused
            .into_values()
            .filter(|hit| hit.score > 0.0)
            .collect();
        ranked.sort_by(|left, right| {
            right
                .score
                .partial_cmp(&left.score)
                .unwrap_or(Ordering::Equal)
                .then(left.insertion_order.cmp(&right.insertion_order))
        });
        ranked.truncate(top_k);
        ranked
    }

    pub fn retrieve(
        &self,
        snapshot: &IndexSnapshot,
        query: &SearchQuery,
        query_vector: Option<&[f32]>,
    ) -> Result<Vec<RetrievedPassage>, SearchError> {
        if query.text.trim().is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }
        if snapshot.chunk_count() == 0 || query.top_k == 0 {
            return Ok(Vec::new());
        }

        let (vector_hits, lexical_hits) =
            self.search_indexes(snapshot.vector(), snapshot.lexical(), query, query_vector)?;
        let fused = self.fuse(&vector_hits, &lexical_hits, query.mode, query.top_k, |chunk_id| {
            snapshot.insertion_order(chunk_id)
        });

        debug!(
            mode = ?query.mode,
            vector_candidates = vector_hits.len(),
            lexical_candidates = lexical_hits.len(),
            returned = fused.len(),
            "fused retrieval"
        );

        Ok(fused
            .into_iter()
            .filter_map(|hit| {
                let chunk = snapshot.chunk(&hit.chunk_id)?;
                Some(RetrievedPassage {
                    chunk_id: hit.chunk_id,
                    text: chunk.text.clone(),
                    score: hit.score,
                    source: SourceMetadata {
                        document_id: chunk.document_id.clone(),
                        filename: snapshot.filename(&chunk.document_id).to_string(),
                        page_number: chunk.page_number,
                        sequence_index: chunk.sequence_index,
                    },
                    vector_score: hit.vector_score,
                    lexical_score: hit.lexical_score,
                })
            })
            .collect())
    }
}

fn empty_hit(chunk_id: &str, insertion_order: usize) -> FusedHit {
    FusedHit {
        chunk_id: chunk_id.to_string(),
        score: 0.0,
        vector_score: None,
        lexical_score: None,
        insertion_order,
    }
}

/// Rescales to `[0, 1]` against `min(0, lowest)`, so all-positive lists keep
/// their lowest hit above zero. A flat list maps to 1 only when its scores
/// are positive.
fn normalize_scores(hits: &[ScoredChunk]) -> Vec<f64> {
    let Some(max) = hits.iter().map(|hit| hit.score).reduce(f64::max) else {
        return Vec::new();
    };
    let floor = hits.iter().map(|hit| hit.score).fold(0.0, f64::min);
    let span = max - floor;

    hits.iter()
        .map(|hit| {
            if span <= f64::EPSILON {
                if max > 0.0 {
                    1.0
                } else {
                    0.0
                }
            } else {
                ((hit.score - floor) / span).clamp(0.0, 1.0)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;

    #[derive(Default)]
    struct FakeKeywordIndex {
        hits: Vec<ScoredChunk>,
    }

    #[derive(Default)]
    struct FakeVectorIndex {
        hits: Vec<ScoredChunk>,
    }

    impl KeywordIndex for FakeKeywordIndex {
        fn len(&self) -> usize {
            self.hits.len()
        }

        fn search_keyword(&self, _query: &str, k: usize) -> Vec<ScoredChunk> {
            self.hits.iter().take(k).cloned().collect()
        }
    }

    impl VectorIndex for FakeVectorIndex {
        fn len(&self) -> usize {
            self.hits.len()
        }

        fn search_vector(
            &self,
            _query: &[f32],
            k: usize,
        ) -> Result<Vec<ScoredChunk>, IngestError> {
            Ok(self.hits.iter().take(k).cloned().collect())
        }
    }

    fn scored(chunk_id: &str, score: f64) -> ScoredChunk {
        ScoredChunk {
            chunk_id: chunk_id.to_string(),
            score,
        }
    }

    fn order_of(ids: &'static [&'static str]) -> impl Fn(&str) -> Option<usize> {
        move |chunk_id| ids.iter().position(|id| *id == chunk_id)
    }

    #[test]
    fn each_signal_contributes_through_its_own_list() {
        let retriever = HybridRetriever::new(RetrievalOptions::default()).expect("valid options");
        let vector = FakeVectorIndex {
            hits: vec![scored("similar-meaning", 0.92)],
        };
        let keyword = FakeKeywordIndex {
            hits: vec![scored("exact-term", 3.4)],
        };
        let query = SearchQuery::hybrid("stop-loss", 2);

        let (vector_hits, lexical_hits) = retriever
            .search_indexes(&vector, &keyword, &query, Some(&[0.0, 1.0]))
            .expect("search succeeds");
        let fused = retriever.fuse(
            &vector_hits,
            &lexical_hits,
            query.mode,
            query.top_k,
            order_of(&["exact-term", "similar-meaning"]),
        );

        assert_eq!(fused.len(), 2);
        let exact = fused
            .iter()
            .find(|hit| hit.chunk_id == "exact-term")
            .expect("lexical hit kept");
        assert_eq!(exact.lexical_score, Some(1.0));
        assert_eq!(exact.vector_score, None);
        assert!((exact.score - 0.5).abs() < 1e-9);

        let similar = fused
            .iter()
            .find(|hit| hit.chunk_id == "similar-meaning")
            .expect("vector hit kept");
        assert_eq!(similar.vector_score, Some(1.0));
        assert_eq!(similar.lexical_score, None);

        // Equal fused scores fall back to insertion order.
        assert_eq!(fused[0].chunk_id, "exact-term");
    }

    #[test]
    fn agreement_between_signals_ranks_highest() {
        let retriever = HybridRetriever::new(RetrievalOptions::default()).expect("valid options");
        let fused = retriever.fuse(
            &[scored("both", 0.9), scored("dense-only", 0.8)],
            &[scored("both", 5.0), scored("lexical-only", 4.0)],
            SearchMode::Hybrid,
            3,
            order_of(&["dense-only", "lexical-only", "both"]),
        );

        assert_eq!(fused[0].chunk_id, "both");
        assert!((fused[0].score - 1.0).abs() < 1e-9);
        assert!(fused.iter().all(|hit| hit.score > 0.0));
    }

    #[test]
    fn results_never_exceed_top_k_or_leave_the_snapshot() {
        let retriever = HybridRetriever::new(RetrievalOptions::default()).expect("valid options");
        let fused = retriever.fuse(
            &[scored("a", 0.9), scored("ghost", 0.85), scored("b", 0.7)],
            &[scored("c", 2.0), scored("a", 1.0)],
            SearchMode::Hybrid,
            2,
            order_of(&["a", "b", "c"]),
        );

        assert_eq!(fused.len(), 2);
        assert!(fused.iter().all(|hit| hit.chunk_id != "ghost"));
    }

    #[test]
    fn weights_shift_the_blend() {
        let retriever = HybridRetriever::new(RetrievalOptions {
            vector_weight: 0.8,
            lexical_weight: 0.2,
            ..RetrievalOptions::default()
        })
        .expect("valid options");

        let fused = retriever.fuse(
            &[scored("dense", 0.5)],
            &[scored("lexical", 9.0)],
            SearchMode::Hybrid,
            2,
            order_of(&["lexical", "dense"]),
        );
        assert_eq!(fused[0].chunk_id, "dense");
        assert!((fused[0].score - 0.8).abs() < 1e-9);
        assert!((fused[1].score - 0.2).abs() < 1e-9);
    }

    #[test]
    fn single_signal_modes_ignore_the_other_index() {
        let retriever = HybridRetriever::new(RetrievalOptions::default()).expect("valid options");
        let vector = FakeVectorIndex {
            hits: vec![scored("dense", 0.4)],
        };
        let keyword = FakeKeywordIndex {
            hits: vec![scored("lexical", 1.2)],
        };

        let lexical_query = SearchQuery {
            text: "atr".to_string(),
            top_k: 3,
            mode: SearchMode::Lexical,
        };
        let (vector_hits, lexical_hits) = retriever
            .search_indexes(&vector, &keyword, &lexical_query, None)
            .expect("lexical mode needs no vector");
        assert!(vector_hits.is_empty());
        assert_eq!(lexical_hits.len(), 1);

        let dense_query = SearchQuery {
            mode: SearchMode::Vector,
            ..lexical_query
        };
        assert!(retriever
            .search_indexes(&vector, &keyword, &dense_query, None)
            .is_err());
        let (vector_hits, lexical_hits) = retriever
            .search_indexes(&vector, &keyword, &dense_query, Some(&[1.0]))
            .expect("dense search");
        let fused = retriever.fuse(
            &vector_hits,
            &lexical_hits,
            SearchMode::Vector,
            3,
            order_of(&["dense", "lexical"]),
        );
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn zero_similarity_hits_earn_no_credit() {
        let retriever = HybridRetriever::new(RetrievalOptions::default()).expect("valid options");
        let fused = retriever.fuse(
            &[scored("a", 0.0), scored("b", 0.0)],
            &[],
            SearchMode::Hybrid,
            2,
            order_of(&["a", "b"]),
        );
        assert!(fused.is_empty());

        let fused = retriever.fuse(
            &[scored("a", 0.0), scored("b", 0.0)],
            &[scored("b", 1.7)],
            SearchMode::Hybrid,
            2,
            order_of(&["a", "b"]),
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].chunk_id, "b");
        assert_eq!(fused[0].vector_score, Some(0.0));
        assert!((fused[0].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn min_vector_score_drops_weak_dense_hits() {
        let retriever = HybridRetriever::new(RetrievalOptions {
            min_vector_score: Some(0.0),
            ..RetrievalOptions::default()
        })
        .expect("valid options");
        let vector = FakeVectorIndex {
            hits: vec![scored("close", 0.6), scored("orthogonal", 0.0)],
        };
        let keyword = FakeKeywordIndex::default();

        let (vector_hits, _) = retriever
            .search_indexes(&vector, &keyword, &SearchQuery::hybrid("q", 2), Some(&[1.0]))
            .expect("search");
        assert_eq!(vector_hits.len(), 1);
        assert_eq!(vector_hits[0].chunk_id, "close");
    }

    #[test]
    fn normalization_handles_negative_and_flat_lists() {
        let negative = normalize_scores(&[scored("a", 0.5), scored("b", -0.5)]);
        assert_eq!(negative, vec![1.0, 0.0]);

        let flat = normalize_scores(&[scored("a", 2.0), scored("b", 2.0)]);
        assert_eq!(flat, vec![1.0, 1.0]);

        let all_zero = normalize_scores(&[scored("a", 0.0), scored("b", 0.0)]);
        assert_eq!(all_zero, vec![0.0, 0.0]);

        let positive = normalize_scores(&[scored("a", 4.0), scored("b", 1.0)]);
        assert_eq!(positive, vec![1.0, 0.25]);

        assert!(normalize_scores(&[]).is_empty());
    }

    #[test]
    fn invalid_weights_are_rejected() {
        let result = HybridRetriever::new(RetrievalOptions {
            vector_weight: 0.9,
            lexical_weight: 0.3,
            ..RetrievalOptions::default()
        });
        assert!(matches!(result, Err(SearchError::Request(_))));
    }
}
