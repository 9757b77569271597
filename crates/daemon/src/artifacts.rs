//! Artifact storage rooted at the configured media root.
//!
//! Layout:
//! - `original/`            uploaded sources
//! - `encoded/<media>/`     encoded outputs, one per job
//! - `chunks/<media>/`      chunk source segments (shared by sibling chunk jobs)
//! - `thumbnails/`          thumbnails and posters
//! - `rejected/`            sources the probe did not recognise
//! - `hls/<media>/`         adaptive streaming packages
//!
//! Every filesystem operation is bounded by the configured timeout.

use sha2::{Digest, Sha256};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("{op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} {path}: timed out after {after:?}")]
    Timeout {
        op: &'static str,
        path: PathBuf,
        after: Duration,
    },
}

/// Streams a file through SHA-256 and returns the hex digest.
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    fs_timeout: Duration,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, fs_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            fs_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn original_dir(&self) -> PathBuf {
        self.root.join("original")
    }

    pub fn encoded_root(&self) -> PathBuf {
        self.root.join("encoded")
    }

    pub fn encoded_dir(&self, media_id: &str) -> PathBuf {
        self.encoded_root().join(media_id)
    }

    pub fn chunks_root(&self) -> PathBuf {
        self.root.join("chunks")
    }

    pub fn chunks_dir(&self, media_id: &str) -> PathBuf {
        self.chunks_root().join(media_id)
    }

    pub fn thumbnails_dir(&self) -> PathBuf {
        self.root.join("thumbnails")
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.root.join("rejected")
    }

    pub fn hls_dir(&self, media_id: &str) -> PathBuf {
        self.root.join("hls").join(media_id)
    }

    async fn bounded<T, F>(&self, op: &'static str, path: &Path, fut: F) -> Result<T, ArtifactError>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        match tokio::time::timeout(self.fs_timeout, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(source)) => Err(ArtifactError::Io {
                op,
                path: path.to_path_buf(),
                source,
            }),
            Err(_) => Err(ArtifactError::Timeout {
                op,
                path: path.to_path_buf(),
                after: self.fs_timeout,
            }),
        }
    }

    /// Creates the top level directories.
    pub async fn ensure_layout(&self) -> Result<(), ArtifactError> {
        for dir in [
            self.original_dir(),
            self.encoded_root(),
            self.chunks_root(),
            self.thumbnails_dir(),
            self.rejected_dir(),
            self.root.join("hls"),
        ] {
            self.bounded("create_dir", &dir, tokio::fs::create_dir_all(&dir)).await?;
        }
        Ok(())
    }

    /// Allocates a unique `<stem>.<token>.<ext>` path under `encoded/<media>/`.
    pub async fn allocate_output(
        &self,
        media_id: &str,
        source: &Path,
        extension: &str,
    ) -> Result<PathBuf, ArtifactError> {
        let dir = self.encoded_dir(media_id);
        self.bounded("create_dir", &dir, tokio::fs::create_dir_all(&dir)).await?;
        Ok(dir.join(unique_name(source, extension)))
    }

    /// Brings an upload into `original/`, copying or moving it.
    pub async fn import_original(&self, source: &Path, copy: bool) -> Result<PathBuf, ArtifactError> {
        let dir = self.original_dir();
        self.bounded("create_dir", &dir, tokio::fs::create_dir_all(&dir)).await?;
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        let dest = dir.join(unique_name(source, &ext));
        if copy {
            self.bounded("copy", source, tokio::fs::copy(source, &dest)).await?;
        } else {
            self.move_file(source, &dest).await?;
        }
        Ok(dest)
    }

    /// Moves a rejected source out of the serving path.
    pub async fn quarantine(&self, path: &Path) -> Result<PathBuf, ArtifactError> {
        let dir = self.rejected_dir();
        self.bounded("create_dir", &dir, tokio::fs::create_dir_all(&dir)).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let dest = dir.join(name);
        self.move_file(path, &dest).await?;
        Ok(dest)
    }

    /// Renames `from` to `to`, falling back to copy and delete across devices.
    pub async fn move_file(&self, from: &Path, to: &Path) -> Result<(), ArtifactError> {
        if let Some(parent) = to.parent() {
            self.bounded("create_dir", parent, tokio::fs::create_dir_all(parent)).await?;
        }
        let renamed = self.bounded("rename", from, tokio::fs::rename(from, to)).await;
        if renamed.is_ok() {
            return Ok(());
        }
        self.bounded("copy", from, tokio::fs::copy(from, to)).await?;
        self.bounded("remove", from, tokio::fs::remove_file(from)).await?;
        Ok(())
    }

    /// Removes a file. Returns false if it did not exist.
    pub async fn remove_file(&self, path: &Path) -> Result<bool, ArtifactError> {
        let result = self
            .bounded("remove", path, async {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;
        if result {
            tracing::debug!(path = %path.display(), "removed artifact");
        }
        Ok(result)
    }

    /// Removes a directory tree. Missing directories are fine.
    pub async fn remove_dir(&self, path: &Path) -> Result<(), ArtifactError> {
        self.bounded("remove_dir", path, async {
            match tokio::fs::remove_dir_all(path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        })
        .await
    }

    pub async fn exists(&self, path: &Path) -> Result<bool, ArtifactError> {
        self.bounded("stat", path, tokio::fs::try_exists(path)).await
    }

    pub async fn size(&self, path: &Path) -> Result<u64, ArtifactError> {
        self.bounded("stat", path, async { Ok(tokio::fs::metadata(path).await?.len()) })
            .await
    }

    pub async fn checksum(&self, path: &Path) -> Result<String, ArtifactError> {
        self.bounded("checksum", path, sha256_file(path)).await
    }
}

fn unique_name(source: &Path, extension: &str) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "media".to_string());
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(8);
    if extension.is_empty() {
        format!("{}.{}", stem, token)
    } else {
        format!("{}.{}.{}", stem, token, extension)
    }
}
