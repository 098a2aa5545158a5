use crate::error::IngestError;
use crate::extractor::PageText;
use crate::models::{IndexingOptions, PdfChunk};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self, IngestError> {
        let config = Self {
            chunk_size,
            overlap,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap {} must be smaller than chunk_size {}",
                self.overlap, self.chunk_size
            )));
        }
        Ok(())
    }

    fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

impl From<&IndexingOptions> for ChunkingConfig {
    fn from(value: &IndexingOptions) -> Self {
        Self {
            chunk_size: value.chunk_size,
            overlap: value.chunk_overlap,
        }
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits a document's pages into overlapping token windows.
///
/// Pages are concatenated in the given order and tokenized on whitespace.
/// Each window is attributed to the page holding its first token, so pages
/// with no tokens never own a chunk. Fails only when no page has any text.
pub fn chunk_document(
    document_id: &str,
    pages: &[PageText],
    config: ChunkingConfig,
) -> Result<Vec<PdfChunk>, IngestError> {
    config.validate()?;

    let tokens: Vec<(u32, &str)> = pages
        .iter()
        .flat_map(|page| {
            page.text
                .split_whitespace()
                .map(move |token| (page.number, token))
        })
        .collect();

    if tokens.is_empty() {
        return Err(IngestError::Extraction(format!(
            "document {document_id} yielded no page text"
        )));
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut sequence = 0u64;

    loop {
        let end = (start + config.chunk_size).min(tokens.len());
        let window = &tokens[start..end];
        let text = window
            .iter()
            .map(|(_, token)| *token)
            .collect::<Vec<_>>()
            .join(" ");
        let page_number = window[0].0;

        chunks.push(PdfChunk {
            chunk_id: make_chunk_id(document_id, page_number, sequence, &text),
            document_id: document_id.to_string(),
            page_number,
            sequence_index: sequence,
            token_count: window.len(),
            text,
        });

        if end == tokens.len() {
            break;
        }
        start += config.stride();
        sequence += 1;
    }

    Ok(chunks)
}

fn make_chunk_id(document_id: &str, page: u32, index: u64, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(page.to_le_bytes());
    hasher.update(index.to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
