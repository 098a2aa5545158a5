//! Immutable index snapshots and their on-disk layout.
//!
//! A persisted snapshot lives in `snapshots/<build_id>/` as three JSON
//! artifacts. The `ACTIVE` file at the index root names the build that is
//! served; it is only replaced (write temp, then rename) after every
//! artifact of the new build is on disk.

use crate::error::{IngestError, SearchError};
use crate::models::{DocumentRecord, EmbeddingVector, IndexingOptions, PdfChunk};
use crate::stores::{Bm25Index, FlatVectorIndex};
use crate::traits::{KeywordIndex, VectorIndex};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;
use uuid::Uuid;

const SNAPSHOTS_DIR: &str = "snapshots";
const ACTIVE_POINTER: &str = "ACTIVE";
const VECTORS_FILE: &str = "vectors.json";
const LEXICAL_FILE: &str = "lexical.json";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotManifest {
    pub build_id: Uuid,
    pub chunk_count: usize,
    pub document_ids: Vec<String>,
    pub embedding_model: String,
    pub dimension: usize,
    pub created_at: DateTime<Utc>,
    pub options: IndexingOptions,
}

/// Lexical artifact: the BM25 index plus the chunk catalog it was built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LexicalArtifact {
    index: Bm25Index,
    chunks: Vec<PdfChunk>,
    filenames: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    manifest: SnapshotManifest,
    vector: FlatVectorIndex,
    lexical: Bm25Index,
    chunks: Vec<PdfChunk>,
    positions: HashMap<String, usize>,
    filenames: BTreeMap<String, String>,
}

impl IndexSnapshot {
    /// Builds both indexes for a new snapshot. `embeddings` must pair 1:1,
    /// in order, with `chunks`.
    pub fn assemble(
        chunks: Vec<PdfChunk>,
        embeddings: Vec<EmbeddingVector>,
        documents: &[DocumentRecord],
        embedding_model: &str,
        dimension: usize,
        options: &IndexingOptions,
    ) -> Result<Self, IngestError> {
        if embeddings.len() != chunks.len() {
            return Err(IngestError::IndexBuild(format!(
                "{} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            )));
        }
        if let Some((chunk, embedding)) = chunks
            .iter()
            .zip(&embeddings)
            .find(|(chunk, embedding)| chunk.chunk_id != embedding.chunk_id)
        {
            return Err(IngestError::IndexBuild(format!(
                "embedding {} does not match chunk {}",
                embedding.chunk_id, chunk.chunk_id
            )));
        }

        let vector = FlatVectorIndex::build(dimension, options.metric, embeddings)?;
        let lexical = Bm25Index::build(&chunks, options.bm25)?;

        let mut document_ids: Vec<String> = Vec::new();
        for chunk in &chunks {
            if !document_ids.contains(&chunk.document_id) {
                document_ids.push(chunk.document_id.clone());
            }
        }
        let filenames = documents
            .iter()
            .filter(|document| document_ids.contains(&document.document_id))
            .map(|document| (document.document_id.clone(), document.filename.clone()))
            .collect();

        let manifest = SnapshotManifest {
            build_id: Uuid::new_v4(),
            chunk_count: chunks.len(),
            document_ids,
            embedding_model: embedding_model.to_string(),
            dimension,
            created_at: Utc::now(),
            options: options.clone(),
        };

        Self::from_parts(manifest, vector, lexical, chunks, filenames).map_err(IngestError::IndexBuild)
    }

    fn from_parts(
        manifest: SnapshotManifest,
        vector: FlatVectorIndex,
        lexical: Bm25Index,
        chunks: Vec<PdfChunk>,
        filenames: BTreeMap<String, String>,
    ) -> Result<Self, String> {
        if manifest.chunk_count != chunks.len()
            || vector.len() != chunks.len()
            || lexical.len() != chunks.len()
        {
            return Err(format!(
                "manifest lists {} chunks, vector index has {}, lexical index has {}, catalog has {}",
                manifest.chunk_count,
                vector.len(),
                lexical.len(),
                chunks.len()
            ));
        }
        vector.check_integrity()?;
        lexical.check_integrity()?;
        if vector.dimension() != manifest.dimension {
            return Err(format!(
                "vector index dimension {} differs from manifest {}",
                vector.dimension(),
                manifest.dimension
            ));
        }
        let aligned = chunks
            .iter()
            .zip(vector.chunk_ids())
            .zip(lexical.chunk_ids())
            .all(|((chunk, vector_id), lexical_id)| {
                &chunk.chunk_id == vector_id && &chunk.chunk_id == lexical_id
            });
        if !aligned {
            return Err("indexes and chunk catalog disagree on chunk order".to_string());
        }

        let positions = chunks
            .iter()
            .enumerate()
            .map(|(position, chunk)| (chunk.chunk_id.clone(), position))
            .collect();

        Ok(Self {
            manifest,
            vector,
            lexical,
            chunks,
            positions,
            filenames,
        })
    }

    pub fn manifest(&self) -> &SnapshotManifest {
        &self.manifest
    }

    pub fn build_id(&self) -> Uuid {
        self.manifest.build_id
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[PdfChunk] {
        &self.chunks
    }

    pub fn vector(&self) -> &FlatVectorIndex {
        &self.vector
    }

    pub fn lexical(&self) -> &Bm25Index {
        &self.lexical
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<&PdfChunk> {
        self.positions
            .get(chunk_id)
            .and_then(|position| self.chunks.get(*position))
    }

    pub fn insertion_order(&self, chunk_id: &str) -> Option<usize> {
        self.positions.get(chunk_id).copied()
    }

    /// Falls back to the document id when no filename was recorded.
    pub fn filename<'a>(&'a self, document_id: &'a str) -> &'a str {
        self.filenames
            .get(document_id)
            .map(String::as_str)
            .unwrap_or(document_id)
    }
}

/// The snapshot currently served to queries. Readers clone the `Arc`; a
/// completed build swaps in its snapshot in one step.
#[derive(Debug, Default)]
pub struct ActiveSnapshot {
    slot: RwLock<Option<Arc<IndexSnapshot>>>,
}

impl ActiveSnapshot {
    pub fn current(&self) -> Option<Arc<IndexSnapshot>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the snapshot that was serving before the swap.
    pub fn replace(&self, snapshot: Arc<IndexSnapshot>) -> Option<Arc<IndexSnapshot>> {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(snapshot)
    }
}

/// Filesystem home of persisted snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn build_dir(&self, build_id: Uuid) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(build_id.to_string())
    }

    /// Writes all artifacts, then points `ACTIVE` at the new build.
    pub async fn persist(&self, snapshot: &IndexSnapshot) -> Result<PathBuf, IngestError> {
        let dir = self.build_dir(snapshot.build_id());
        tokio::fs::create_dir_all(&dir).await?;

        let lexical = LexicalArtifact {
            index: snapshot.lexical.clone(),
            chunks: snapshot.chunks.clone(),
            filenames: snapshot.filenames.clone(),
        };
        tokio::fs::write(dir.join(VECTORS_FILE), serde_json::to_vec(&snapshot.vector)?).await?;
        tokio::fs::write(dir.join(LEXICAL_FILE), serde_json::to_vec(&lexical)?).await?;
        tokio::fs::write(
            dir.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&snapshot.manifest)?,
        )
        .await?;

        let pointer = self.root.join(ACTIVE_POINTER);
        let staged = self.root.join(format!("{ACTIVE_POINTER}.tmp"));
        tokio::fs::write(&staged, snapshot.build_id().to_string()).await?;
        tokio::fs::rename(&staged, &pointer).await?;

        info!(
            build_id = %snapshot.build_id(),
            chunks = snapshot.chunk_count(),
            path = %dir.display(),
            "snapshot persisted"
        );
        Ok(dir)
    }

    pub async fn active_build_id(&self) -> Result<Option<Uuid>, SearchError> {
        let pointer = self.root.join(ACTIVE_POINTER);
        let contents = match tokio::fs::read_to_string(&pointer).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(SearchError::Snapshot(format!(
                    "cannot read {}: {error}",
                    pointer.display()
                )))
            }
        };

        Uuid::parse_str(contents.trim())
            .map(Some)
            .map_err(|error| SearchError::Snapshot(format!("active pointer is corrupt: {error}")))
    }

    /// `Ok(None)` when nothing was ever persisted.
    pub async fn load_active(&self) -> Result<Option<IndexSnapshot>, SearchError> {
        let Some(build_id) = self.active_build_id().await? else {
            return Ok(None);
        };
        let dir = self.build_dir(build_id);

        let manifest: SnapshotManifest = read_artifact(&dir.join(MANIFEST_FILE)).await?;
        let vector: FlatVectorIndex = read_artifact(&dir.join(VECTORS_FILE)).await?;
        let lexical: LexicalArtifact = read_artifact(&dir.join(LEXICAL_FILE)).await?;

        if manifest.build_id != build_id {
            return Err(SearchError::Snapshot(format!(
                "manifest in {} belongs to build {}",
                dir.display(),
                manifest.build_id
            )));
        }

        let snapshot = IndexSnapshot::from_parts(
            manifest,
            vector,
            lexical.index,
            lexical.chunks,
            lexical.filenames,
        )
        .map_err(SearchError::Snapshot)?;

        info!(build_id = %build_id, chunks = snapshot.chunk_count(), "snapshot loaded");
        Ok(Some(snapshot))
    }
}

async fn read_artifact<T>(path: &Path) -> Result<T, SearchError>
where
    T: serde::de::DeserializeOwned,
{
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|error| SearchError::Snapshot(format!("cannot read {}: {error}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(|error| SearchError::Snapshot(format!("cannot parse {}: {error}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use tempfile::tempdir;

    fn chunk(chunk_id: &str, document_id: &str, text: &str) -> PdfChunk {
        PdfChunk {
            chunk_id: chunk_id.to_string(),
            document_id: document_id.to_string(),
            page_number: 1,
            sequence_index: 0,
            text: text.to_string(),
            token_count: text.split_whitespace().count(),
        }
    }

    fn document(document_id: &str, filename: &str) -> DocumentRecord {
        DocumentRecord {
            document_id: document_id.to_string(),
            filename: filename.to_string(),
            byte_size: 0,
            page_count: Some(1),
            checksum: String::new(),
            uploaded_at: Utc::now(),
        }
    }

    fn sample_snapshot() -> IndexSnapshot {
        let embedder = CharacterNgramEmbedder { dimensions: 16 };
        let chunks = vec![
            chunk("c1", "doc-a", "moving averages smooth price"),
            chunk("c2", "doc-b", "stop-loss orders cap risk"),
            chunk("c3", "doc-a", "volume confirms breakouts"),
        ];
        let embeddings = chunks
            .iter()
            .map(|chunk| EmbeddingVector {
                chunk_id: chunk.chunk_id.clone(),
                vector: embedder.embed(&chunk.text),
            })
            .collect();

        IndexSnapshot::assemble(
            chunks,
            embeddings,
            &[document("doc-a", "a.pdf"), document("doc-b", "b.pdf")],
            "char-trigram-hash",
            16,
            &IndexingOptions::default(),
        )
        .expect("snapshot assembles")
    }

    #[test]
    fn assemble_records_manifest_and_lookups() {
        let snapshot = sample_snapshot();

        assert_eq!(snapshot.chunk_count(), 3);
        assert_eq!(snapshot.manifest().document_ids, vec!["doc-a", "doc-b"]);
        assert_eq!(snapshot.manifest().dimension, 16);
        assert_eq!(snapshot.insertion_order("c2"), Some(1));
        assert_eq!(snapshot.filename("doc-b"), "b.pdf");
        assert_eq!(snapshot.filename("doc-z"), "doc-z");
        assert!(snapshot.chunk("missing").is_none());
    }

    #[test]
    fn assemble_rejects_uncovered_chunks() {
        let chunks = vec![chunk("c1", "doc", "one"), chunk("c2", "doc", "two")];
        let short = vec![EmbeddingVector {
            chunk_id: "c1".to_string(),
            vector: vec![1.0, 0.0],
        }];
        let result = IndexSnapshot::assemble(
            chunks.clone(),
            short,
            &[],
            "m",
            2,
            &IndexingOptions::default(),
        );
        assert!(matches!(result, Err(IngestError::IndexBuild(_))));

        let swapped = vec![
            EmbeddingVector {
                chunk_id: "c2".to_string(),
                vector: vec![1.0, 0.0],
            },
            EmbeddingVector {
                chunk_id: "c1".to_string(),
                vector: vec![0.0, 1.0],
            },
        ];
        let result =
            IndexSnapshot::assemble(chunks, swapped, &[], "m", 2, &IndexingOptions::default());
        assert!(matches!(result, Err(IngestError::IndexBuild(_))));
    }

    #[test]
    fn active_snapshot_swaps_whole_snapshots() {
        let active = ActiveSnapshot::default();
        assert!(active.current().is_none());

        let first = Arc::new(sample_snapshot());
        assert!(active.replace(Arc::clone(&first)).is_none());
        let reader = active.current().expect("first snapshot served");

        let second = Arc::new(sample_snapshot());
        let previous = active.replace(Arc::clone(&second)).expect("previous returned");
        assert_eq!(previous.build_id(), first.build_id());
        assert_eq!(reader.build_id(), first.build_id());
        assert_eq!(active.current().map(|s| s.build_id()), Some(second.build_id()));
    }

    #[tokio::test]
    async fn persisted_snapshot_becomes_active() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path());
        assert!(store.load_active().await?.is_none());

        let first = sample_snapshot();
        store.persist(&first).await?;
        let second = sample_snapshot();
        let build_dir = store.persist(&second).await?;

        assert!(build_dir.join(VECTORS_FILE).exists());
        assert!(build_dir.join(LEXICAL_FILE).exists());
        assert!(!dir.path().join("ACTIVE.tmp").exists());

        let loaded = store.load_active().await?.expect("active snapshot");
        assert_eq!(loaded.build_id(), second.build_id());
        assert_eq!(loaded.chunk_count(), 3);
        assert_eq!(loaded.filename("doc-a"), "a.pdf");
        assert_eq!(
            loaded.lexical().search_keyword("stop-loss", 1)[0].chunk_id,
            "c2"
        );
        Ok(())
    }

    #[tokio::test]
    async fn dangling_or_corrupt_pointer_is_a_snapshot_error(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path());

        std::fs::write(dir.path().join(ACTIVE_POINTER), Uuid::new_v4().to_string())?;
        assert!(matches!(
            store.load_active().await,
            Err(SearchError::Snapshot(_))
        ));

        std::fs::write(dir.path().join(ACTIVE_POINTER), "not-a-build")?;
        assert!(matches!(
            store.load_active().await,
            Err(SearchError::Snapshot(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn truncated_vector_artifact_is_rejected_on_load(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path());
        let build_dir = store.persist(&sample_snapshot()).await?;

        let path = build_dir.join(VECTORS_FILE);
        let mut artifact: serde_json::Value = serde_json::from_slice(&std::fs::read(&path)?)?;
        artifact["data"] = serde_json::json!([0.5]);
        std::fs::write(&path, serde_json::to_vec(&artifact)?)?;

        assert!(matches!(
            store.load_active().await,
            Err(SearchError::Snapshot(_))
        ));
        Ok(())
    }
}
