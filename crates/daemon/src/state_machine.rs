//! Per-job lifecycle: pending -> running -> success | fail.
//!
//! Transitions come only from worker reports. Every committed status change of
//! a whole-file job fires the hook list exactly once; a report that would not
//! change anything is rejected as an invalid transition, so duplicate
//! callbacks cannot fire hooks twice. Chunk jobs are handed to the chunk
//! coordinator instead.
//!
//! A failed job only has its retry counter bumped. Whether to try again is up
//! to the worker pool, which dispatches a fresh job.

use crate::coordinator::{ChunkCoordinator, ConcatOutcome};
use crate::hooks::JobEvent;
use crate::jobs::{EncodingJob, EncodingStatus, JobId, WorkOutcome};
use crate::ledger::JobLedger;
use crate::media::MediaId;
use crate::profiles::ProfileId;
use crate::store::{JobUpdate, StoreError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("encoding {0} not found")]
    NotFound(JobId),

    #[error("encoding {job}: cannot go from {from} to {to}")]
    InvalidTransition {
        job: JobId,
        from: EncodingStatus,
        to: EncodingStatus,
    },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for StateError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::JobNotFound(id) => StateError::NotFound(id),
            other => StateError::Store(other),
        }
    }
}

/// A worker's final report.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Completion {
    pub outcome: Option<WorkOutcome>,
    /// Stored output, required for a useful success.
    pub artifact: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub logs: String,
    #[serde(default)]
    pub worker: String,
    #[serde(default)]
    pub commands: String,
}

impl Completion {
    pub fn success(artifact: PathBuf, size_bytes: Option<u64>) -> Self {
        Self {
            outcome: Some(WorkOutcome::Success),
            artifact: Some(artifact),
            size_bytes,
            ..Self::default()
        }
    }

    pub fn failure(logs: impl Into<String>) -> Self {
        Self {
            outcome: Some(WorkOutcome::Fail),
            logs: logs.into(),
            ..Self::default()
        }
    }

    pub fn worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }

    pub fn commands(mut self, commands: impl Into<String>) -> Self {
        self.commands = commands.into();
        self
    }

    pub fn logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }

    fn status(&self) -> EncodingStatus {
        self.outcome.map(EncodingStatus::from).unwrap_or(EncodingStatus::Fail)
    }
}

pub struct EncodingStateMachine {
    ledger: Arc<JobLedger>,
    coordinator: Arc<ChunkCoordinator>,
}

impl EncodingStateMachine {
    pub fn new(ledger: Arc<JobLedger>, coordinator: Arc<ChunkCoordinator>) -> Self {
        Self { ledger, coordinator }
    }

    pub fn ledger(&self) -> &Arc<JobLedger> {
        &self.ledger
    }

    /// pending -> running
    pub async fn report_running(&self, id: &str, worker: &str) -> Result<EncodingJob, StateError> {
        let update = self
            .ledger
            .store
            .update_job(id, |job| {
                if job.status != EncodingStatus::Pending {
                    return Err(StateError::InvalidTransition {
                        job: job.id.clone(),
                        from: job.status,
                        to: EncodingStatus::Running,
                    });
                }
                job.status = EncodingStatus::Running;
                job.progress = 0;
                job.worker = worker.to_string();
                Ok(())
            })
            .await?;

        tracing::debug!(job = %id, worker, "encoding running");
        if !update.after.chunk {
            self.ledger
                .emit(JobEvent::added(update.after.clone(), Some(update.before.status)))
                .await;
        }
        Ok(update.after)
    }

    /// Records progress of a running job.
    ///
    /// Returns `Ok(false)` without touching the job when the value is outside
    /// 0..=100 or the job is not running.
    pub async fn report_progress(&self, id: &str, percent: i64) -> Result<bool, StateError> {
        if !(0..=100).contains(&percent) {
            if self.ledger.store.get_job(id).await.is_none() {
                return Err(StateError::NotFound(id.to_string()));
            }
            tracing::debug!(job = %id, percent, "ignoring out of range progress");
            return Ok(false);
        }

        let result = self
            .ledger
            .store
            .update_job(id, |job| {
                if job.status != EncodingStatus::Running {
                    return Err(StateError::InvalidTransition {
                        job: job.id.clone(),
                        from: job.status,
                        to: EncodingStatus::Running,
                    });
                }
                job.set_progress(percent);
                Ok(())
            })
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(StateError::InvalidTransition { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// pending | running -> success | fail
    pub async fn report_complete(&self, id: &str, completion: Completion) -> Result<EncodingJob, StateError> {
        let to = completion.status();
        let update = self
            .ledger
            .store
            .update_job(id, |job| apply_completion(job, &completion, to))
            .await?;

        {
            let mut metrics = self.ledger.metrics.write().await;
            match to {
                EncodingStatus::Success => {
                    metrics.succeeded_jobs += 1;
                    metrics.total_bytes_encoded += update.after.size_bytes.unwrap_or(0);
                }
                _ => metrics.failed_jobs += 1,
            }
        }

        tracing::debug!(
            job = %id,
            media = %update.after.media_id,
            profile = update.after.profile_id,
            chunk = update.after.chunk,
            status = %to,
            "encoding finished"
        );

        if update.after.chunk {
            match self.coordinator.on_chunk_transition(&update.after).await {
                Ok(ConcatOutcome::Discarded { job_id }) => {
                    tracing::info!(job = %job_id, "discarding duplicate concatenation");
                }
                Ok(outcome) => tracing::debug!(job = %id, ?outcome, "chunk handled"),
                Err(e) => tracing::warn!(job = %id, error = %e, "chunk coordination failed"),
            }
            return Ok(update.after);
        }

        self.finish_whole(update).await
    }

    async fn finish_whole(&self, update: JobUpdate) -> Result<EncodingJob, StateError> {
        let job = update.after;
        let event = JobEvent::added(job.clone(), Some(update.before.status));
        if job.status != EncodingStatus::Success {
            self.ledger.emit(event).await;
            return Ok(job);
        }

        // held through the hooks so the add lands before any later supersede
        let _guard = self.ledger.locks.lock_pair(&job.media_id, job.profile_id).await;
        if self.ledger.store.get_job(&job.id).await.is_none() {
            tracing::debug!(job = %job.id, "success already superseded");
            return Ok(job);
        }
        self.supersede(&job).await?;
        self.ledger.emit(event).await;
        Ok(job)
    }

    /// Deletes every other whole-file success of the job's (media, profile).
    ///
    /// Callers hold the pair lock.
    pub(crate) async fn supersede(&self, job: &EncodingJob) -> Result<(), StoreError> {
        let older = self
            .ledger
            .store
            .jobs_for(&job.media_id, job.profile_id, false)
            .await
            .into_iter()
            .filter(|j| j.id != job.id && j.status == EncodingStatus::Success);
        for old in older {
            tracing::debug!(old = %old.id, new = %job.id, "superseding encoding");
            self.ledger.delete_job(&old.id).await?;
        }
        Ok(())
    }

    /// Records a failed encode that never got a job row (e.g. chunking failed).
    pub async fn record_failed_encode(
        &self,
        media_id: &MediaId,
        profile_id: ProfileId,
        logs: &str,
    ) -> Result<EncodingJob, StateError> {
        let mut job = EncodingJob::new(media_id.clone(), profile_id);
        job.status = EncodingStatus::Fail;
        job.progress = 100;
        job.append_logs(logs);
        let job = self.ledger.store.insert_job(job).await?;
        self.ledger.metrics.write().await.failed_jobs += 1;
        self.ledger.emit(JobEvent::added(job.clone(), None)).await;
        Ok(job)
    }
}

fn apply_completion(job: &mut EncodingJob, completion: &Completion, to: EncodingStatus) -> Result<(), StateError> {
    if !job.status.is_active() {
        return Err(StateError::InvalidTransition {
            job: job.id.clone(),
            from: job.status,
            to,
        });
    }
    job.status = to;
    job.append_logs(&completion.logs);
    if !completion.worker.is_empty() {
        job.worker = completion.worker.clone();
    }
    if !completion.commands.is_empty() {
        job.commands = completion.commands.clone();
    }
    match to {
        EncodingStatus::Success => {
            job.progress = 100;
            job.artifact = completion.artifact.clone();
            job.size_bytes = completion.size_bytes;
        }
        _ => job.retries += 1,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::PostEncodeAction;
    use crate::test_support::Harness;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_out_of_range_progress_is_ignored(percent in prop_oneof![-1_000i64..0, 101i64..1_000]) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let h = Harness::new().await;
                let job = h.insert_job(EncodingJob::new("m1", 5)).await;
                h.states.report_running(&job.id, "w1").await.unwrap();
                h.states.report_progress(&job.id, 40).await.unwrap();
                let before = h.store().get_job(&job.id).await.unwrap();

                let accepted = h.states.report_progress(&job.id, percent).await.unwrap();

                assert!(!accepted);
                assert_eq!(h.store().get_job(&job.id).await.unwrap(), before);
            });
        }
    }

    #[tokio::test]
    async fn test_lifecycle_fires_hooks_once_per_transition() {
        let h = Harness::new().await;
        let job = h.insert_job(EncodingJob::new("m1", 5)).await;

        h.states.report_running(&job.id, "w1").await.unwrap();
        assert!(h.states.report_progress(&job.id, 55).await.unwrap());
        let done = h
            .states
            .report_complete(&job.id, h.success_completion("a.mp4").await)
            .await
            .unwrap();

        assert_eq!(done.status, EncodingStatus::Success);
        assert_eq!(done.progress, 100);
        assert_eq!(done.worker, "w1");

        // duplicate callback
        let again = h
            .states
            .report_complete(&job.id, Completion::failure("late"))
            .await;
        assert!(matches!(again, Err(StateError::InvalidTransition { .. })));

        let events = h.recorder.events.lock().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].1, EncodingStatus::Running);
        assert_eq!(events[1].1, EncodingStatus::Success);
        assert_eq!(h.notifier.packaging.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_progress_only_while_running() {
        let h = Harness::new().await;
        let job = h.insert_job(EncodingJob::new("m1", 5)).await;
        assert!(!h.states.report_progress(&job.id, 10).await.unwrap());
        assert!(matches!(
            h.states.report_progress("nope", 10).await,
            Err(StateError::NotFound(_))
        ));
        assert!(matches!(
            h.states.report_progress("nope", 1000).await,
            Err(StateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_running_twice_is_invalid() {
        let h = Harness::new().await;
        let job = h.insert_job(EncodingJob::new("m1", 5)).await;
        h.states.report_running(&job.id, "w1").await.unwrap();
        assert!(matches!(
            h.states.report_running(&job.id, "w2").await,
            Err(StateError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_bumps_retries_without_retrying() {
        let h = Harness::new().await;
        let job = h.insert_job(EncodingJob::new("m1", 5)).await;
        h.states.report_running(&job.id, "w1").await.unwrap();
        let failed = h
            .states
            .report_complete(&job.id, Completion::failure("ffmpeg exited 1"))
            .await
            .unwrap();

        assert_eq!(failed.status, EncodingStatus::Fail);
        assert_eq!(failed.retries, 1);
        assert!(failed.logs.contains("ffmpeg exited 1"));
        assert!(h.queue.units().is_empty());
        assert_eq!(h.store().get_media("m1").await.unwrap().encoding_status, EncodingStatus::Fail);
    }

    #[tokio::test]
    async fn test_new_success_supersedes_older_success() {
        let h = Harness::new().await;

        let first = h.insert_job(EncodingJob::new("m1", 5)).await;
        h.states.report_running(&first.id, "w1").await.unwrap();
        let first_done = h
            .states
            .report_complete(&first.id, h.success_completion("first.mp4").await)
            .await
            .unwrap();
        let first_artifact = first_done.artifact.clone().unwrap();
        assert!(first_artifact.exists());

        let second = h.insert_job(EncodingJob::new("m1", 5)).await;
        h.states.report_running(&second.id, "w1").await.unwrap();
        h.states
            .report_complete(&second.id, h.success_completion("second.mp4").await)
            .await
            .unwrap();

        let left = h.store().jobs_for("m1", 5, false).await;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, second.id);
        assert!(!first_artifact.exists());
    }

    #[tokio::test]
    async fn test_superseded_success_fires_no_hooks() {
        let h = Harness::new().await;
        // profile 1 is the gif preview
        let a = h.insert_job(EncodingJob::new("m1", 1)).await;
        let b = h.insert_job(EncodingJob::new("m1", 1)).await;
        h.states.report_running(&a.id, "w1").await.unwrap();
        h.states.report_running(&b.id, "w2").await.unwrap();

        // a's success is committed but its hooks have not run yet
        let completion = h.success_completion("a.gif").await;
        let a_update = h
            .store()
            .update_job(&a.id, |job| apply_completion(job, &completion, EncodingStatus::Success))
            .await
            .unwrap();

        let b_done = h
            .states
            .report_complete(&b.id, h.success_completion("b.gif").await)
            .await
            .unwrap();
        assert!(h.store().get_job(&a.id).await.is_none());

        h.states.finish_whole(a_update).await.unwrap();

        let media = h.store().get_media("m1").await.unwrap();
        assert_eq!(media.preview_path, b_done.artifact);
        let events = h.recorder.events.lock().await;
        assert!(!events
            .iter()
            .any(|(id, status, action)| id == &a.id
                && *status == EncodingStatus::Success
                && *action == PostEncodeAction::Add));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_completions_leave_consistent_media_status() {
        for _ in 0..30 {
            let h = Arc::new(Harness::new().await);
            let mut jobs = Vec::new();
            for profile in 2..=6 {
                jobs.push(h.insert_job(EncodingJob::new("m1", profile)).await);
            }

            let mut tasks = Vec::new();
            for (i, job) in jobs.into_iter().enumerate() {
                let h = h.clone();
                tasks.push(tokio::spawn(async move {
                    h.states.report_running(&job.id, "w").await.unwrap();
                    let completion = if i == 2 {
                        h.success_completion("ok.mp4").await
                    } else {
                        Completion::failure("encoder crashed")
                    };
                    h.states.report_complete(&job.id, completion).await.unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }

            let statuses: Vec<EncodingStatus> = h
                .store()
                .jobs_for_media("m1")
                .await
                .into_iter()
                .map(|j| j.status)
                .collect();
            let media = h.store().get_media("m1").await.unwrap();
            assert_eq!(media.encoding_status, crate::status::resolve_status(statuses));
            assert_eq!(media.encoding_status, EncodingStatus::Success);
        }
    }

    #[tokio::test]
    async fn test_record_failed_encode() {
        let h = Harness::new().await;
        let job = h
            .states
            .record_failed_encode(&"m1".to_string(), 6, "segmenting failed")
            .await
            .unwrap();
        assert_eq!(job.status, EncodingStatus::Fail);
        assert!(!job.chunk);
        assert_eq!(h.store().get_media("m1").await.unwrap().encoding_status, EncodingStatus::Fail);
    }
}
