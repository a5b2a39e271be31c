use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Rendered PDFs on disk, addressed by owner number and content hash.
///
/// The cache can be wiped at any time; every file is reproducible from the
/// record it was rendered from.
#[derive(Debug, Clone)]
pub struct DocumentCache {
    root: PathBuf,
}

impl DocumentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn relative_path(owner: &str, sha256: &str) -> PathBuf {
        PathBuf::from(owner).join(format!("{sha256}.pdf"))
    }

    /// Write through a temp file and an atomic rename; identical bytes land on
    /// the same path and are not rewritten.
    pub async fn store_pdf(&self, owner: &str, bytes: &[u8]) -> anyhow::Result<StoredDocument> {
        let sha256 = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path(owner, &sha256);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.root.join(owner);

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating document directory {}", parent.display()))?;

        let stored = |deduplicated| StoredDocument {
            sha256: sha256.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking document path {}", absolute_path.display()))?
        {
            debug!(path = %absolute_path.display(), "document already cached");
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp document {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp document {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp document {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp document {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }

    /// Cached bytes for a pointer, or `None` when the file was evicted.
    pub async fn read(&self, relative_path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.root.join(relative_path);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading document {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            DocumentCache::sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_renders_share_one_file() {
        let dir = tempdir().expect("tempdir");
        let cache = DocumentCache::new(dir.path());

        let first = cache.store_pdf("CSA-26-0001", b"%PDF-1.5 same").await.expect("first");
        let second = cache.store_pdf("CSA-26-0001", b"%PDF-1.5 same").await.expect("second");
        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());

        let bytes = cache.read(&first.relative_path).await.expect("read");
        assert_eq!(bytes.as_deref(), Some(&b"%PDF-1.5 same"[..]));
    }

    #[tokio::test]
    async fn evicted_documents_read_as_missing() {
        let dir = tempdir().expect("tempdir");
        let cache = DocumentCache::new(dir.path());
        let stored = cache.store_pdf("CSA-26-0002", b"%PDF-1.5 gone").await.expect("store");
        std::fs::remove_file(&stored.absolute_path).expect("evict");
        assert!(cache.read(&stored.relative_path).await.expect("read").is_none());
    }
}
