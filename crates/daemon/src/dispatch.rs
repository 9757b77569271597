//! Job dispatch.
//!
//! The job row is always created before its unit of work is queued so the
//! worker has an id to report against. If the queue refuses the unit the job
//! is failed on the spot; no pending row is left behind without work.

use crate::jobs::{EncodingJob, JobId};
use crate::ledger::JobLedger;
use crate::media::MediaId;
use crate::profiles::{Priority, ProfileId};
use crate::state_machine::{Completion, EncodingStateMachine, StateError};
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job queue is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to enqueue encoding {job_id}: {source}")]
    Enqueue {
        job_id: JobId,
        #[source]
        source: QueueError,
    },

    #[error("failed to enqueue chunking of media {media_id}: {source}")]
    ChunkingEnqueue {
        media_id: MediaId,
        #[source]
        source: QueueError,
    },

    #[error(transparent)]
    State(#[from] StateError),
}

/// One unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkUnit {
    /// Encode a whole file or one chunk into a profile.
    Encode {
        media_id: MediaId,
        profile_id: ProfileId,
        job_id: JobId,
        /// Where the worker reports back.
        callback: String,
        force: bool,
    },
    /// Split a source into chunks and dispatch chunk jobs for each profile.
    Chunkize {
        media_id: MediaId,
        profile_ids: Vec<ProfileId>,
        force: bool,
    },
}

impl WorkUnit {
    pub fn media_id(&self) -> &str {
        match self {
            WorkUnit::Encode { media_id, .. } | WorkUnit::Chunkize { media_id, .. } => media_id,
        }
    }
}

/// The queue work units are handed to. The broker behind it is not ours.
pub trait JobQueue: Send + Sync {
    fn enqueue(&self, unit: WorkUnit, priority: Priority) -> Result<(), QueueError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Chunk details for a chunk job.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkAssignment {
    pub manifest: String,
    pub boundary: String,
    pub checksum: Option<String>,
}

pub struct Dispatcher {
    ledger: Arc<JobLedger>,
    states: Arc<EncodingStateMachine>,
    queue: Arc<dyn JobQueue>,
    callback_base: String,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<JobLedger>,
        states: Arc<EncodingStateMachine>,
        queue: Arc<dyn JobQueue>,
        callback_base: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            states,
            queue,
            callback_base: callback_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn callback_url(&self, job_id: &str) -> String {
        format!("{}/api/encodings/{}", self.callback_base, job_id)
    }

    /// Creates a pending job and queues its encode.
    pub async fn dispatch(
        &self,
        media_id: &str,
        profile_id: ProfileId,
        chunk: Option<ChunkAssignment>,
        priority: Priority,
        force: bool,
    ) -> Result<JobId, DispatchError> {
        let job = match chunk {
            Some(c) => {
                let mut job = EncodingJob::new_chunk(media_id, profile_id, c.manifest, c.boundary);
                job.checksum = c.checksum;
                job
            }
            None => EncodingJob::new(media_id, profile_id),
        };
        self.enqueue_job(job, priority, force).await
    }

    /// Replaces a failed job with a fresh one carrying its retry count.
    pub async fn redispatch(&self, failed: &EncodingJob, priority: Priority) -> Result<JobId, DispatchError> {
        let mut job = EncodingJob::new(failed.media_id.clone(), failed.profile_id);
        job.retries = failed.retries;
        let id = self.enqueue_job(job, priority, true).await?;
        self.ledger.delete_job(&failed.id).await?;
        tracing::info!(old = %failed.id, new = %id, retries = failed.retries, "encoding retried");
        Ok(id)
    }

    async fn enqueue_job(&self, job: EncodingJob, priority: Priority, force: bool) -> Result<JobId, DispatchError> {
        let job = self.ledger.store.insert_job(job).await?;
        let unit = WorkUnit::Encode {
            media_id: job.media_id.clone(),
            profile_id: job.profile_id,
            job_id: job.id.clone(),
            callback: self.callback_url(&job.id),
            force,
        };

        if let Err(source) = self.queue.enqueue(unit, priority) {
            tracing::warn!(job = %job.id, error = %source, "enqueue failed, failing encoding");
            self.states
                .report_complete(&job.id, Completion::failure(format!("enqueue failed: {}", source)))
                .await?;
            return Err(DispatchError::Enqueue { job_id: job.id, source });
        }

        self.ledger.metrics.write().await.dispatched_jobs += 1;
        tracing::info!(
            job = %job.id,
            media = %job.media_id,
            profile = job.profile_id,
            chunk = job.chunk,
            priority = priority.value(),
            "encoding dispatched"
        );
        Ok(job.id)
    }

    /// Queues a chunking request. If it cannot be queued every profile gets
    /// a failed encode recorded instead.
    pub async fn dispatch_chunking(
        &self,
        media_id: &str,
        profile_ids: Vec<ProfileId>,
        force: bool,
    ) -> Result<(), DispatchError> {
        if profile_ids.is_empty() {
            return Ok(());
        }
        let unit = WorkUnit::Chunkize {
            media_id: media_id.to_string(),
            profile_ids: profile_ids.clone(),
            force,
        };
        if let Err(source) = self.queue.enqueue(unit, Priority::Normal) {
            tracing::warn!(media = %media_id, error = %source, "chunking enqueue failed");
            let media_id = media_id.to_string();
            for profile_id in profile_ids {
                self.states
                    .record_failed_encode(&media_id, profile_id, "chunking enqueue failed")
                    .await?;
            }
            return Err(DispatchError::ChunkingEnqueue { media_id, source });
        }
        tracing::info!(media = %media_id, profiles = ?profile_ids, "chunking dispatched");
        Ok(())
    }
}
