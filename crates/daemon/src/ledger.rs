//! Shared handles for components that mutate job records.
//!
//! Deleting a job always removes its artifact. Deleting a whole-file job also
//! announces the delete to the hook list; chunk rows are internal and never
//! announced.

use crate::artifacts::ArtifactStore;
use crate::hooks::{HookList, JobEvent};
use crate::jobs::EncodingJob;
use crate::locks::KeyedLocks;
use crate::metrics::SharedMetrics;
use crate::store::{EncodingStore, StoreError};
use std::sync::Arc;

pub struct JobLedger {
    pub store: Arc<EncodingStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub hooks: HookList,
    pub locks: KeyedLocks,
    pub metrics: SharedMetrics,
}

impl JobLedger {
    pub fn new(
        store: Arc<EncodingStore>,
        artifacts: Arc<ArtifactStore>,
        hooks: HookList,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            store,
            artifacts,
            hooks,
            locks: KeyedLocks::new(),
            metrics,
        }
    }

    pub async fn emit(&self, event: JobEvent) -> usize {
        self.hooks.fire(&event).await
    }

    /// Deletes a job and its artifact, announcing whole-file deletes.
    pub async fn delete_job(&self, id: &str) -> Result<Option<EncodingJob>, StoreError> {
        let removed = self.discard_job(id).await?;
        if let Some(job) = &removed {
            if !job.chunk {
                self.emit(JobEvent::deleted(job.clone())).await;
            }
        }
        Ok(removed)
    }

    /// Deletes a job and its artifact without announcing it.
    pub async fn discard_job(&self, id: &str) -> Result<Option<EncodingJob>, StoreError> {
        let Some(job) = self.store.remove_job(id).await? else {
            return Ok(None);
        };
        if let Some(artifact) = job.artifact.as_ref().filter(|_| job.has_artifact()) {
            if let Err(e) = self.artifacts.remove_file(artifact).await {
                tracing::warn!(job = %job.id, error = %e, "could not remove artifact of deleted job");
            }
        }
        tracing::debug!(job = %job.id, media = %job.media_id, chunk = job.chunk, "job deleted");
        Ok(Some(job))
    }
}
