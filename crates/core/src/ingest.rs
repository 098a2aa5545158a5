use crate::error::IngestError;
use crate::extractor::{count_pages, PageText};
use crate::models::DocumentRecord;
use crate::traits::{extract_off_thread, DocumentSource};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    Ok(digest_bytes(&bytes))
}

/// Stable id for a file: SHA-256 of its path relative to the store root.
fn generate_document_id(relative: &Path) -> String {
    let normalized = relative.to_string_lossy().replace('\\', "/");
    digest_bytes(normalized.as_bytes())
}

#[derive(Debug, Clone)]
struct FolderEntry {
    record: DocumentRecord,
    path: PathBuf,
}

/// Serves every PDF found under a folder, recursively.
#[derive(Debug)]
pub struct FolderDocumentStore {
    root: PathBuf,
    entries: Vec<FolderEntry>,
}

impl FolderDocumentStore {
    pub fn open(folder: &Path) -> Result<Self, IngestError> {
        let files = discover_pdf_files(folder);
        if files.is_empty() {
            return Err(IngestError::InvalidArgument(format!(
                "no pdf files found in {}",
                folder.display()
            )));
        }

        let mut entries = Vec::with_capacity(files.len());
        for path in files {
            let relative = path.strip_prefix(folder).unwrap_or(path.as_path()).to_path_buf();
            let bytes = fs::read(&path)?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| {
                    IngestError::InvalidArgument(format!(
                        "path missing filename: {}",
                        path.display()
                    ))
                })?
                .to_string();

            let record = DocumentRecord {
                document_id: generate_document_id(&relative),
                filename,
                byte_size: bytes.len() as u64,
                page_count: count_pages(&bytes),
                checksum: digest_bytes(&bytes),
                uploaded_at: Utc::now(),
            };
            debug!(document_id = %record.document_id, path = %path.display(), "discovered pdf");
            entries.push(FolderEntry { record, path });
        }

        info!(folder = %folder.display(), documents = entries.len(), "folder store opened");
        Ok(Self {
            root: folder.to_path_buf(),
            entries,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| entry.record.document_id.clone())
            .collect()
    }

    fn entry(&self, document_id: &str) -> Option<&FolderEntry> {
        self.entries
            .iter()
            .find(|entry| entry.record.document_id == document_id)
    }
}

#[async_trait]
impl DocumentSource for FolderDocumentStore {
    fn document(&self, document_id: &str) -> Option<DocumentRecord> {
        self.entry(document_id).map(|entry| entry.record.clone())
    }

    fn documents(&self) -> Vec<DocumentRecord> {
        self.entries.iter().map(|entry| entry.record.clone()).collect()
    }

    async fn get_document_bytes(&self, document_id: &str) -> Result<Vec<u8>, IngestError> {
        let entry = self.entry(document_id).ok_or_else(|| {
            IngestError::InvalidArgument(format!("unknown document {document_id}"))
        })?;
        Ok(tokio::fs::read(&entry.path).await?)
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    record: DocumentRecord,
    bytes: Vec<u8>,
    pages: Option<Vec<PageText>>,
}

/// Holds uploaded documents in memory. Documents added as page text skip
/// PDF extraction entirely.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    entries: RwLock<Vec<MemoryEntry>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pdf(&self, filename: &str, bytes: Vec<u8>) -> DocumentRecord {
        let record = DocumentRecord {
            document_id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            byte_size: bytes.len() as u64,
            page_count: count_pages(&bytes),
            checksum: digest_bytes(&bytes),
            uploaded_at: Utc::now(),
        };
        self.insert(MemoryEntry {
            record: record.clone(),
            bytes,
            pages: None,
        });
        record
    }

    pub fn add_text_document(&self, filename: &str, pages: Vec<PageText>) -> DocumentRecord {
        let joined = pages
            .iter()
            .map(|page| page.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let record = DocumentRecord {
            document_id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            byte_size: joined.len() as u64,
            page_count: u32::try_from(pages.len()).ok(),
            checksum: digest_bytes(joined.as_bytes()),
            uploaded_at: Utc::now(),
        };
        self.insert(MemoryEntry {
            record: record.clone(),
            bytes: joined.into_bytes(),
            pages: Some(pages),
        });
        record
    }

    fn insert(&self, entry: MemoryEntry) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    fn entry(&self, document_id: &str) -> Option<MemoryEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|entry| entry.record.document_id == document_id)
            .cloned()
    }
}

#[async_trait]
impl DocumentSource for MemoryDocumentStore {
    fn document(&self, document_id: &str) -> Option<DocumentRecord> {
        self.entry(document_id).map(|entry| entry.record)
    }

    fn documents(&self) -> Vec<DocumentRecord> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.record.clone())
            .collect()
    }

    async fn get_document_bytes(&self, document_id: &str) -> Result<Vec<u8>, IngestError> {
        self.entry(document_id)
            .map(|entry| entry.bytes)
            .ok_or_else(|| IngestError::InvalidArgument(format!("unknown document {document_id}")))
    }

    async fn get_page_texts(&self, document_id: &str) -> Result<Vec<PageText>, IngestError> {
        let entry = self.entry(document_id).ok_or_else(|| {
            IngestError::InvalidArgument(format!("unknown document {document_id}"))
        })?;
        match entry.pages {
            Some(pages) => Ok(pages),
            None => extract_off_thread(entry.bytes).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::tests::single_page_pdf;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.PDF"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        fs::write(base.join("notes.txt"), b"ignored")?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file_path = dir.path().join("a.pdf");
        fs::write(&file_path, b"abc")?;

        let first = digest_file(&file_path)?;
        let second = digest_file(&file_path)?;
        assert_eq!(first, second);
        assert_eq!(first, digest_bytes(b"abc"));
        Ok(())
    }

    #[test]
    fn folder_store_fails_without_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let result = FolderDocumentStore::open(dir.path());
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn folder_store_ids_are_stable_across_opens() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(
            dir.path().join("guide.pdf"),
            single_page_pdf("Risk management involves stop-loss orders."),
        )?;

        let first = FolderDocumentStore::open(dir.path())?;
        let second = FolderDocumentStore::open(dir.path())?;
        assert_eq!(first.document_ids(), second.document_ids());

        let record = &first.documents()[0];
        assert_eq!(record.filename, "guide.pdf");
        assert_eq!(record.page_count, Some(1));
        assert!(record.byte_size > 0);

        let pages = first.get_page_texts(&record.document_id).await?;
        assert!(pages[0].text.contains("stop-loss"));
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_serves_text_documents_without_extraction(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryDocumentStore::new();
        let record = store.add_text_document(
            "notes.pdf",
            vec![PageText::new(1, "candles"), PageText::new(2, "wicks")],
        );

        assert_eq!(record.page_count, Some(2));
        let pages = store.get_page_texts(&record.document_id).await?;
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].text, "wicks");

        assert!(store.document("missing").is_none());
        assert!(store.get_document_bytes("missing").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn memory_store_extracts_uploaded_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let store = MemoryDocumentStore::new();
        let record = store.add_pdf("broken.pdf", b"%PDF-1.4\n%broken".to_vec());
        assert!(matches!(
            store.get_page_texts(&record.document_id).await,
            Err(IngestError::Extraction(_))
        ));

        let record = store.add_pdf("guide.pdf", single_page_pdf("ATR measures volatility"));
        let pages = store.get_page_texts(&record.document_id).await?;
        assert!(pages[0].text.contains("volatility"));
        assert_eq!(store.documents().len(), 2);
        Ok(())
    }
}
