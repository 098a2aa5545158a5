//! In-memory BM25 index over chunk text.
//!
//! Documents and queries share [`tokenize`]: lowercase, then split on any run
//! of characters that are neither letters nor digits. Scores use the Okapi
//! BM25 formula with the `ln(1 + (N - df + 0.5) / (df + 0.5))` idf, which
//! stays positive even for terms present in every chunk.

use crate::error::IngestError;
use crate::models::{PdfChunk, ScoredChunk};
use crate::traits::KeywordIndex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::OnceLock;

static TERM_SEPARATOR: OnceLock<Regex> = OnceLock::new();

pub fn tokenize(text: &str) -> Vec<String> {
    let separator = TERM_SEPARATOR
        .get_or_init(|| Regex::new(r"[^\p{L}\p{N}]+").expect("term separator pattern is valid"));
    let lowered = text.to_lowercase();
    separator
        .split(&lowered)
        .filter(|term| !term.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

impl Bm25Params {
    pub fn validate(&self) -> Result<(), String> {
        if !self.k1.is_finite() || self.k1 < 0.0 {
            return Err(format!("bm25 k1 must be a non-negative number, got {}", self.k1));
        }
        if !(0.0..=1.0).contains(&self.b) {
            return Err(format!("bm25 b must lie in [0, 1], got {}", self.b));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Posting {
    /// Position of the chunk in insertion order.
    pub doc: u32,
    pub term_frequency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    params: Bm25Params,
    chunk_ids: Vec<String>,
    doc_lengths: Vec<u32>,
    avg_doc_length: f64,
    postings: BTreeMap<String, Vec<Posting>>,
}

impl Bm25Index {
    pub fn build(chunks: &[PdfChunk], params: Bm25Params) -> Result<Self, IngestError> {
        let mut seen = HashSet::new();
        let mut chunk_ids = Vec::with_capacity(chunks.len());
        let mut doc_lengths = Vec::with_capacity(chunks.len());
        let mut postings: BTreeMap<String, Vec<Posting>> = BTreeMap::new();

        for (position, chunk) in chunks.iter().enumerate() {
            if !seen.insert(chunk.chunk_id.as_str()) {
                return Err(IngestError::IndexBuild(format!(
                    "duplicate chunk id {}",
                    chunk.chunk_id
                )));
            }
            let doc = u32::try_from(position).map_err(|_| {
                IngestError::IndexBuild("lexical index exceeds u32::MAX chunks".to_string())
            })?;

            let terms = tokenize(&chunk.text);
            let mut frequencies: BTreeMap<&str, u32> = BTreeMap::new();
            for term in &terms {
                *frequencies.entry(term.as_str()).or_default() += 1;
            }
            for (term, term_frequency) in frequencies {
                postings.entry(term.to_string()).or_default().push(Posting {
                    doc,
                    term_frequency,
                });
            }

            chunk_ids.push(chunk.chunk_id.clone());
            doc_lengths.push(terms.len() as u32);
        }

        let total: u64 = doc_lengths.iter().map(|length| u64::from(*length)).sum();
        let avg_doc_length = if doc_lengths.is_empty() {
            0.0
        } else {
            total as f64 / doc_lengths.len() as f64
        };

        Ok(Self {
            params,
            chunk_ids,
            doc_lengths,
            avg_doc_length,
            postings,
        })
    }

    pub fn chunk_ids(&self) -> &[String] {
        &self.chunk_ids
    }

    pub fn params(&self) -> Bm25Params {
        self.params
    }

    pub fn document_frequency(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, Vec::len)
    }

    /// `(chunk_id, term_frequency)` pairs for one normalized term.
    pub fn postings(&self, term: &str) -> Vec<(&str, u32)> {
        self.postings
            .get(term)
            .map(|list| {
                list.iter()
                    .map(|posting| {
                        (
                            self.chunk_ids[posting.doc as usize].as_str(),
                            posting.term_frequency,
                        )
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Checks that every posting points at a known chunk. Deserialized
    /// indexes must pass this before they are searched.
    pub fn check_integrity(&self) -> Result<(), String> {
        if self.doc_lengths.len() != self.chunk_ids.len() {
            return Err(format!(
                "{} document lengths for {} chunks",
                self.doc_lengths.len(),
                self.chunk_ids.len()
            ));
        }
        let out_of_range = self
            .postings
            .iter()
            .find(|(_, list)| list.iter().any(|posting| posting.doc as usize >= self.chunk_ids.len()));
        if let Some((term, _)) = out_of_range {
            return Err(format!("posting list for {term:?} references an unknown chunk"));
        }
        Ok(())
    }

    fn idf(&self, document_frequency: usize) -> f64 {
        let n = self.chunk_ids.len() as f64;
        let df = document_frequency as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }
}

impl KeywordIndex for Bm25Index {
    fn len(&self) -> usize {
        self.chunk_ids.len()
    }

    fn search_keyword(&self, query: &str, k: usize) -> Vec<ScoredChunk> {
        if self.chunk_ids.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut terms = tokenize(query);
        let mut seen = HashSet::new();
        terms.retain(|term| seen.insert(term.clone()));

        let avg_length = if self.avg_doc_length > 0.0 {
            self.avg_doc_length
        } else {
            1.0
        };
        let Bm25Params { k1, b } = self.params;

        let mut scores: HashMap<u32, f64> = HashMap::new();
        for term in &terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(list.len());
            for posting in list {
                let tf = f64::from(posting.term_frequency);
                let length = f64::from(self.doc_lengths[posting.doc as usize]);
                let saturation = tf * (k1 + 1.0) / (tf + k1 * (1.0 - b + b * length / avg_length));
                *scores.entry(posting.doc).or_default() += idf * saturation;
            }
        }

        let mut ranked: Vec<(u32, f64)> = scores
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .collect();
        ranked.sort_by(|left, right| {
            right
                .1
                .partial_cmp(&left.1)
                .unwrap_or(Ordering::Equal)
                .then(left.0.cmp(&right.0))
        });

        ranked
            .into_iter()
            .take(k)
            .map(|(doc, score)| ScoredChunk {
                chunk_id: self.chunk_ids[doc as usize].clone(),
                score,
            })
            .collect()
    }
}
