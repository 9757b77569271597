//! Orphaned artifact sweep.
//!
//! Files under `encoded/` and `chunks/` that no job or manifest references and
//! that are older than the grace period are removed. The grace period covers
//! outputs that exist on disk before their job row does (a concatenation in
//! progress, segments not yet dispatched).

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::chunks::ChunkManifest;
use crate::store::EncodingStore;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    /// Unreferenced but still inside the grace period.
    pub young: usize,
}

struct FoundFile {
    path: PathBuf,
    modified: SystemTime,
}

fn walk_files(roots: Vec<PathBuf>) -> (Vec<FoundFile>, Vec<PathBuf>) {
    let mut files = Vec::new();
    let mut dirs = Vec::new();
    for root in roots {
        for entry in WalkDir::new(&root).min_depth(1).contents_first(true).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_dir() {
                dirs.push(entry.path().to_path_buf());
            } else if entry.file_type().is_file() {
                if let Ok(meta) = entry.metadata() {
                    files.push(FoundFile {
                        path: entry.path().to_path_buf(),
                        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    });
                }
            }
        }
    }
    (files, dirs)
}

async fn referenced_paths(store: &EncodingStore) -> HashSet<PathBuf> {
    let mut refs = HashSet::new();
    let mut manifests = HashSet::new();
    for job in store.all_jobs().await {
        if let Some(artifact) = job.artifact.filter(|a| !a.as_os_str().is_empty()) {
            refs.insert(artifact);
        }
        if let Some(boundary) = job.chunk_file_path {
            refs.insert(PathBuf::from(boundary));
        }
        if let Some(blob) = job.chunk_manifest {
            manifests.insert(blob);
        }
    }
    for blob in manifests {
        if let Ok(manifest) = ChunkManifest::parse(&blob) {
            refs.extend(manifest.boundaries().iter().map(PathBuf::from));
        }
    }
    for media in store.list_media().await {
        refs.extend(media.preview_path);
    }
    refs
}

/// Removes unreferenced files older than `grace` from `encoded/` and `chunks/`.
pub async fn sweep_orphans(
    store: &EncodingStore,
    artifacts: &ArtifactStore,
    grace: Duration,
) -> Result<SweepReport, ArtifactError> {
    let roots = vec![artifacts.encoded_root(), artifacts.chunks_root()];
    let (files, dirs) = tokio::task::spawn_blocking(move || walk_files(roots))
        .await
        .unwrap_or_default();
    let refs = referenced_paths(store).await;
    let now = SystemTime::now();

    let mut report = SweepReport::default();
    for file in files {
        if refs.contains(&file.path) {
            continue;
        }
        let age = now.duration_since(file.modified).unwrap_or_default();
        if age < grace {
            report.young += 1;
            continue;
        }
        if artifacts.remove_file(&file.path).await? {
            tracing::debug!(path = %file.path.display(), "removed orphaned artifact");
            report.removed.push(file.path);
        }
    }

    // directories come deepest first; only empty ones go
    for dir in dirs {
        if is_empty_dir(&dir).await {
            let _ = tokio::fs::remove_dir(&dir).await;
        }
    }

    if !report.removed.is_empty() {
        tracing::info!(removed = report.removed.len(), young = report.young, "orphan sweep finished");
    }
    Ok(report)
}

async fn is_empty_dir(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}
