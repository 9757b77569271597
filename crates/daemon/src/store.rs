//! Media and encoding job records.
//!
//! Records live in memory behind a `RwLock` and, when a state directory is
//! configured, are written through to one JSON file per record:
//! `state_dir/media/<id>.json` and `state_dir/jobs/<id>.json`.
//!
//! Updates run a closure against a copy of the record and commit only if it
//! returns `Ok`, handing back the record as it was before and after.

use crate::chunks::manifest_digest;
use crate::jobs::{EncodingJob, JobId};
use crate::media::{MediaId, SourceMedia};
use crate::profiles::ProfileId;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("media {0} not found")]
    MediaNotFound(MediaId),

    #[error("encoding {0} not found")]
    JobNotFound(JobId),

    #[error("failed to persist {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Identity of a chunk set: all chunk jobs of one chunked encode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkSetKey {
    pub media_id: MediaId,
    pub profile_id: ProfileId,
    pub digest: String,
}

impl ChunkSetKey {
    /// `None` for whole-file jobs.
    pub fn of(job: &EncodingJob) -> Option<Self> {
        job.chunk_manifest.as_deref().map(|blob| Self {
            media_id: job.media_id.clone(),
            profile_id: job.profile_id,
            digest: manifest_digest(blob),
        })
    }
}

impl std::fmt::Display for ChunkSetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let short = self.digest.get(..12).unwrap_or(&self.digest);
        write!(f, "{}/{}/{}", self.media_id, self.profile_id, short)
    }
}

/// A committed job update.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub before: EncodingJob,
    pub after: EncodingJob,
}

#[derive(Default)]
struct Tables {
    media: HashMap<MediaId, SourceMedia>,
    jobs: HashMap<JobId, EncodingJob>,
    next_seq: u64,
}

pub struct EncodingStore {
    tables: RwLock<Tables>,
    state_dir: Option<PathBuf>,
}

impl EncodingStore {
    /// A store that keeps nothing on disk.
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            state_dir: None,
        }
    }

    /// Opens (or creates) a persistent store, loading every readable record.
    pub async fn open(state_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let state_dir = state_dir.into();
        let mut tables = Tables::default();

        for sub in ["media", "jobs"] {
            let dir = state_dir.join(sub);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| StoreError::Io { path: dir.clone(), source })?;
        }

        for media in load_records::<SourceMedia>(&state_dir.join("media")).await {
            tables.media.insert(media.id.clone(), media);
        }
        for job in load_records::<EncodingJob>(&state_dir.join("jobs")).await {
            tables.next_seq = tables.next_seq.max(job.seq + 1);
            tables.jobs.insert(job.id.clone(), job);
        }

        tracing::info!(
            state_dir = %state_dir.display(),
            media = tables.media.len(),
            jobs = tables.jobs.len(),
            "store loaded"
        );

        Ok(Self {
            tables: RwLock::new(tables),
            state_dir: Some(state_dir),
        })
    }

    fn record_path(&self, kind: &str, id: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(kind).join(format!("{}.json", id)))
    }

    async fn persist<T: Serialize>(&self, kind: &str, id: &str, record: &T) -> Result<(), StoreError> {
        let Some(path) = self.record_path(kind, id) else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| StoreError::Io { path: tmp.clone(), source })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io { path: path.clone(), source })
    }

    async fn unpersist(&self, kind: &str, id: &str) -> Result<(), StoreError> {
        let Some(path) = self.record_path(kind, id) else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(StoreError::Io { path, source: e }),
            _ => Ok(()),
        }
    }

    // ---- media ----

    pub async fn insert_media(&self, media: SourceMedia) -> Result<SourceMedia, StoreError> {
        let mut tables = self.tables.write().await;
        self.persist("media", &media.id, &media).await?;
        tables.media.insert(media.id.clone(), media.clone());
        Ok(media)
    }

    pub async fn get_media(&self, id: &str) -> Option<SourceMedia> {
        self.tables.read().await.media.get(id).cloned()
    }

    pub async fn list_media(&self) -> Vec<SourceMedia> {
        let mut media: Vec<SourceMedia> = self.tables.read().await.media.values().cloned().collect();
        media.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        media
    }

    pub async fn update_media<F>(&self, id: &str, f: F) -> Result<SourceMedia, StoreError>
    where
        F: FnOnce(&mut SourceMedia),
    {
        let mut tables = self.tables.write().await;
        let mut media = tables
            .media
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::MediaNotFound(id.to_string()))?;
        f(&mut media);
        media.touch();
        self.persist("media", id, &media).await?;
        tables.media.insert(id.to_string(), media.clone());
        Ok(media)
    }

    /// Like [`update_media`](Self::update_media), but `f` also sees the
    /// media's jobs in creation order, read under the same write lock. No job
    /// can change between the read and the commit.
    pub async fn update_media_with_jobs<F>(&self, id: &str, f: F) -> Result<SourceMedia, StoreError>
    where
        F: FnOnce(&mut SourceMedia, &[EncodingJob]),
    {
        let mut tables = self.tables.write().await;
        let mut media = tables
            .media
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::MediaNotFound(id.to_string()))?;
        let mut jobs: Vec<EncodingJob> = tables.jobs.values().filter(|j| j.media_id == id).cloned().collect();
        jobs.sort_by_key(|j| j.seq);
        f(&mut media, &jobs);
        media.touch();
        self.persist("media", id, &media).await?;
        tables.media.insert(id.to_string(), media.clone());
        Ok(media)
    }

    pub async fn remove_media(&self, id: &str) -> Result<Option<SourceMedia>, StoreError> {
        let mut tables = self.tables.write().await;
        self.unpersist("media", id).await?;
        Ok(tables.media.remove(id))
    }

    // ---- jobs ----

    /// Inserts a job, assigning its creation sequence number.
    pub async fn insert_job(&self, mut job: EncodingJob) -> Result<EncodingJob, StoreError> {
        let mut tables = self.tables.write().await;
        job.seq = tables.next_seq;
        self.persist("jobs", &job.id, &job).await?;
        tables.next_seq += 1;
        tables.jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Option<EncodingJob> {
        self.tables.read().await.jobs.get(id).cloned()
    }

    /// Applies `f` to a copy of the job and commits it if `f` succeeds.
    pub async fn update_job<F, E>(&self, id: &str, f: F) -> Result<JobUpdate, E>
    where
        F: FnOnce(&mut EncodingJob) -> Result<(), E>,
        E: From<StoreError>,
    {
        let mut tables = self.tables.write().await;
        let before = tables
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))?;
        let mut after = before.clone();
        f(&mut after)?;
        after.touch();
        self.persist("jobs", id, &after).await?;
        tables.jobs.insert(id.to_string(), after.clone());
        Ok(JobUpdate { before, after })
    }

    pub async fn remove_job(&self, id: &str) -> Result<Option<EncodingJob>, StoreError> {
        let mut tables = self.tables.write().await;
        self.unpersist("jobs", id).await?;
        Ok(tables.jobs.remove(id))
    }

    /// Jobs of a (media, profile) pair with the given chunk flag, in creation order.
    pub async fn jobs_for(&self, media_id: &str, profile_id: ProfileId, chunk: bool) -> Vec<EncodingJob> {
        self.select(|j| j.belongs_to(media_id, profile_id) && j.chunk == chunk).await
    }

    /// Chunk jobs of one chunk set, in creation order.
    pub async fn chunk_siblings(&self, key: &ChunkSetKey) -> Vec<EncodingJob> {
        self.select(|j| j.chunk && ChunkSetKey::of(j).as_ref() == Some(key)).await
    }

    /// Number of jobs still referencing a manifest, across every profile
    /// chunked from the same source segments.
    pub async fn manifest_refs(&self, key: &ChunkSetKey) -> usize {
        self.tables
            .read()
            .await
            .jobs
            .values()
            .filter_map(ChunkSetKey::of)
            .filter(|k| k.media_id == key.media_id && k.digest == key.digest)
            .count()
    }

    pub async fn jobs_for_media(&self, media_id: &str) -> Vec<EncodingJob> {
        self.select(|j| j.media_id == media_id).await
    }

    pub async fn all_jobs(&self) -> Vec<EncodingJob> {
        self.select(|_| true).await
    }

    async fn select<P>(&self, pred: P) -> Vec<EncodingJob>
    where
        P: Fn(&EncodingJob) -> bool,
    {
        let mut jobs: Vec<EncodingJob> = self
            .tables
            .read()
            .await
            .jobs
            .values()
            .filter(|j| pred(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }
}

async fn load_records<T: serde::de::DeserializeOwned>(dir: &Path) -> Vec<T> {
    let mut records = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "cannot read state directory");
            return records;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let parsed = tokio::fs::read(&path)
            .await
            .map_err(|e| e.to_string())
            .and_then(|bytes| serde_json::from_slice::<T>(&bytes).map_err(|e| e.to_string()));
        match parsed {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable record"),
        }
    }
    records
}
