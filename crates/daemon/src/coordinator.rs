//! Chunk completion coordinator.
//!
//! Runs on every chunk job that reaches success or fail, holding the lock of
//! the job's (media, profile) pair throughout.
//!
//! On success it checks the chunk set against its manifest. Once complete it
//! concatenates the chunk outputs in boundary order into a new whole-file
//! success job, recounts the set and discards its own result if the set
//! changed meanwhile, supersedes older successes, deletes the chunk rows and,
//! when nothing references the manifest any more, the chunk source files.
//!
//! On failure it records one aggregated fail job for the pair and deletes
//! every other whole-file job and chunk row of the set, so no partial result
//! survives.

use crate::artifacts::ArtifactError;
use crate::chunks::{check_completeness, ChunkManifest, Completeness};
use crate::encode::Concatenator;
use crate::hooks::JobEvent;
use crate::jobs::{EncodingJob, EncodingStatus, JobId};
use crate::ledger::JobLedger;
use crate::store::{ChunkSetKey, StoreError};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// What the coordinator did with a chunk transition.
#[derive(Debug, Clone, PartialEq)]
pub enum ConcatOutcome {
    /// Siblings are still missing or running.
    Incomplete,
    /// The chunk set was concatenated into this job.
    Committed(EncodingJob),
    /// A concurrent change to the chunk set was seen after assembly; the
    /// assembled job and its artifact were thrown away.
    Discarded { job_id: JobId },
    /// The chunk set failed; this aggregated fail job replaces it.
    Failed(EncodingJob),
    /// The triggering job is gone or no longer terminal; another completion
    /// already handled the set.
    Stale,
    /// The triggering job carried an unreadable manifest and was deleted.
    InvalidManifest,
}

pub struct ChunkCoordinator {
    ledger: Arc<JobLedger>,
    concat: Arc<dyn Concatenator>,
}

impl ChunkCoordinator {
    pub fn new(ledger: Arc<JobLedger>, concat: Arc<dyn Concatenator>) -> Self {
        Self { ledger, concat }
    }

    pub async fn on_chunk_transition(&self, job: &EncodingJob) -> Result<ConcatOutcome, CoordinatorError> {
        let Some(key) = ChunkSetKey::of(job) else {
            return Ok(ConcatOutcome::Stale);
        };
        let _guard = self.ledger.locks.lock_pair(&job.media_id, job.profile_id).await;

        // re-read under the lock
        let Some(current) = self.ledger.store.get_job(&job.id).await else {
            return Ok(ConcatOutcome::Stale);
        };
        match current.status {
            EncodingStatus::Success => self.on_success(current, key).await,
            EncodingStatus::Fail => {
                let siblings = self.ledger.store.chunk_siblings(&key).await;
                let reason = format!("chunk {} failed", current.id);
                self.fail_chunk_set(&key, &siblings, &reason).await
            }
            _ => Ok(ConcatOutcome::Stale),
        }
    }

    async fn on_success(&self, trigger: EncodingJob, key: ChunkSetKey) -> Result<ConcatOutcome, CoordinatorError> {
        let blob = trigger.chunk_manifest.clone().unwrap_or_default();
        let manifest = match ChunkManifest::parse(&blob) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(job = %trigger.id, error = %e, "deleting chunk with unreadable manifest");
                self.ledger.delete_job(&trigger.id).await?;
                return Ok(ConcatOutcome::InvalidManifest);
            }
        };

        let siblings = self.ledger.store.chunk_siblings(&key).await;
        let observed = siblings.len();
        let ordered = match check_completeness(&manifest, &siblings) {
            Completeness::Complete(ordered) => ordered,
            Completeness::Incomplete(reasons) => {
                tracing::debug!(set = %key, waiting = reasons.len(), "chunk set incomplete");
                return Ok(ConcatOutcome::Incomplete);
            }
        };

        let Some(media) = self.ledger.store.get_media(&key.media_id).await else {
            return Ok(ConcatOutcome::Stale);
        };

        let inputs: Vec<PathBuf> = ordered.iter().filter_map(|j| j.artifact.clone()).collect();
        let extension = inputs
            .first()
            .and_then(|p| p.extension())
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "mp4".to_string());
        let output = self
            .ledger
            .artifacts
            .allocate_output(&key.media_id, &media.source_path, &extension)
            .await?;

        let tool_log = match self.concat.concat(&inputs, &output).await {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!(set = %key, error = %e, "concatenation failed");
                self.ledger.artifacts.remove_file(&output).await?;
                let reason = format!("concatenation failed: {}", e);
                return self.fail_chunk_set(&key, &siblings, &reason).await;
            }
        };

        let mut assembled = aggregate_job(&key, &ordered, EncodingStatus::Success);
        assembled.logs = format!("{:?}\n{}\n{}", inputs, tool_log, assembled.logs);
        let assembled = match self.store_assembled(assembled, &output).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(set = %key, error = %e, "storing concatenated output failed");
                self.ledger.artifacts.remove_file(&output).await?;
                let reason = format!("storing concatenated output failed: {}", e);
                return self.fail_chunk_set(&key, &siblings, &reason).await;
            }
        };

        // the set must look exactly as it did before assembly
        let recount = self.ledger.store.chunk_siblings(&key).await.len();
        if recount != observed {
            self.ledger.discard_job(&assembled.id).await?;
            self.ledger.metrics.write().await.races_discarded += 1;
            return Ok(ConcatOutcome::Discarded { job_id: assembled.id });
        }

        let older = self
            .ledger
            .store
            .jobs_for(&key.media_id, key.profile_id, false)
            .await
            .into_iter()
            .filter(|j| j.id != assembled.id && j.status == EncodingStatus::Success);
        for old in older {
            self.ledger.delete_job(&old.id).await?;
        }

        for sibling in &siblings {
            self.ledger.discard_job(&sibling.id).await?;
        }
        self.cleanup_sources(&key, &manifest).await?;

        self.ledger.metrics.write().await.chunk_sets_concatenated += 1;
        tracing::info!(set = %key, job = %assembled.id, chunks = manifest.len(), "chunk set concatenated");

        self.ledger.emit(JobEvent::added(assembled.clone(), None)).await;
        Ok(ConcatOutcome::Committed(assembled))
    }

    async fn store_assembled(&self, mut job: EncodingJob, output: &Path) -> Result<EncodingJob, CoordinatorError> {
        job.size_bytes = Some(self.ledger.artifacts.size(output).await?);
        job.artifact = Some(output.to_path_buf());
        Ok(self.ledger.store.insert_job(job).await?)
    }

    async fn fail_chunk_set(
        &self,
        key: &ChunkSetKey,
        siblings: &[EncodingJob],
        reason: &str,
    ) -> Result<ConcatOutcome, CoordinatorError> {
        let mut failed = aggregate_job(key, siblings, EncodingStatus::Fail);
        let paths: Vec<&str> = siblings.iter().filter_map(|j| j.chunk_file_path.as_deref()).collect();
        failed.logs = format!("{}\n{:?}\n{}", reason, paths, failed.logs);
        let failed = self.ledger.store.insert_job(failed).await?;

        let others = self
            .ledger
            .store
            .jobs_for(&key.media_id, key.profile_id, false)
            .await
            .into_iter()
            .filter(|j| j.id != failed.id);
        for other in others {
            self.ledger.delete_job(&other.id).await?;
        }
        for sibling in siblings {
            self.ledger.discard_job(&sibling.id).await?;
        }

        let manifest = siblings
            .iter()
            .find_map(|j| j.chunk_manifest.as_deref())
            .and_then(|blob| ChunkManifest::parse(blob).ok());
        if let Some(manifest) = manifest {
            self.cleanup_sources(key, &manifest).await?;
        }

        self.ledger.metrics.write().await.failed_jobs += 1;
        tracing::warn!(set = %key, job = %failed.id, reason, "chunk set failed");

        self.ledger.emit(JobEvent::added(failed.clone(), None)).await;
        Ok(ConcatOutcome::Failed(failed))
    }

    /// Removes chunk source files once no job references the manifest.
    async fn cleanup_sources(&self, key: &ChunkSetKey, manifest: &ChunkManifest) -> Result<(), CoordinatorError> {
        let refs = self.ledger.store.manifest_refs(key).await;
        if refs > 0 {
            tracing::debug!(set = %key, refs, "chunk sources still referenced");
            return Ok(());
        }
        for boundary in manifest.boundaries() {
            self.ledger.artifacts.remove_file(&PathBuf::from(boundary)).await?;
        }
        tracing::debug!(set = %key, files = manifest.len(), "chunk sources removed");
        Ok(())
    }
}

/// A whole-file job summarising a chunk set's logs, workers and timing.
fn aggregate_job(key: &ChunkSetKey, chunks: &[EncodingJob], status: EncodingStatus) -> EncodingJob {
    let mut job = EncodingJob::new(key.media_id.clone(), key.profile_id);
    job.status = status;
    job.progress = 100;
    job.logs = chunks
        .iter()
        .map(|c| c.logs.as_str())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let workers: BTreeSet<&str> = chunks
        .iter()
        .map(|c| c.worker.as_str())
        .filter(|w| !w.is_empty())
        .collect();
    job.worker = serde_json::json!({ "workers": workers }).to_string();

    let start = chunks.iter().map(|c| c.created_at).min();
    let end = chunks.iter().map(|c| c.updated_at).max();
    if let (Some(start), Some(end)) = (start, end) {
        job.total_run_time = ((end - start).max(0) / 1000) as u64;
    }
    job
}
