//! Post-transition hooks.
//!
//! After a job change is committed, the state machine hands a [`JobEvent`] to
//! every registered hook in turn. Hooks are isolated from each other: a
//! failing hook is logged and counted, the remaining hooks still run, and the
//! committed transition stands.

use crate::jobs::{EncodingJob, EncodingStatus};
use crate::media::SourceMedia;
use crate::metrics::SharedMetrics;
use crate::store::StoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HookError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

/// What happened to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostEncodeAction {
    /// The job was created or changed status.
    Add,
    /// The job was deleted.
    Delete,
}

#[derive(Debug, Clone)]
pub struct JobEvent {
    /// The job as committed (or as it was, for deletes).
    pub job: EncodingJob,
    /// Status before the transition, `None` for new or deleted jobs.
    pub previous: Option<EncodingStatus>,
    pub action: PostEncodeAction,
}

impl JobEvent {
    pub fn added(job: EncodingJob, previous: Option<EncodingStatus>) -> Self {
        Self {
            job,
            previous,
            action: PostEncodeAction::Add,
        }
    }

    pub fn deleted(job: EncodingJob) -> Self {
        Self {
            job,
            previous: None,
            action: PostEncodeAction::Delete,
        }
    }
}

#[async_trait]
pub trait TransitionHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, event: &JobEvent) -> Result<(), HookError>;
}

/// Ordered, error-isolated hook list.
#[derive(Clone)]
pub struct HookList {
    hooks: Vec<Arc<dyn TransitionHook>>,
    metrics: SharedMetrics,
}

impl HookList {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self {
            hooks: Vec::new(),
            metrics,
        }
    }

    pub fn with(mut self, hook: Arc<dyn TransitionHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Runs every hook. Returns how many failed.
    pub async fn fire(&self, event: &JobEvent) -> usize {
        let mut failures = 0;
        for hook in &self.hooks {
            if let Err(e) = hook.on_event(event).await {
                failures += 1;
                tracing::warn!(
                    hook = hook.name(),
                    job = %event.job.id,
                    media = %event.job.media_id,
                    error = %e,
                    "transition hook failed"
                );
            }
        }
        if failures > 0 {
            self.metrics.write().await.hook_failures += failures as u64;
        }
        failures
    }
}

/// User-facing notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    MediaAdded,
}

impl std::fmt::Display for UserAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserAction::MediaAdded => write!(f, "media_added"),
        }
    }
}

/// Outbound calls to subsystems the pipeline does not own: adaptive
/// streaming packaging and user notification delivery.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn packaging_ready(&self, media: &SourceMedia, job: &EncodingJob) -> Result<(), HookError>;

    async fn notify_users(&self, media: &SourceMedia, action: UserAction) -> Result<(), HookError>;
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn packaging_ready(&self, media: &SourceMedia, job: &EncodingJob) -> Result<(), HookError> {
        tracing::info!(media = %media.id, job = %job.id, "packaging ready");
        Ok(())
    }

    async fn notify_users(&self, media: &SourceMedia, action: UserAction) -> Result<(), HookError> {
        tracing::info!(media = %media.id, %action, "notify users");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingHook;
    use super::*;
    use crate::metrics::new_shared_metrics;

    struct FailingHook;

    #[async_trait]
    impl TransitionHook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_event(&self, _event: &JobEvent) -> Result<(), HookError> {
            Err(HookError::Failed("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_block_others() {
        let metrics = new_shared_metrics();
        let recorder = Arc::new(RecordingHook::default());
        let hooks = HookList::new(metrics.clone())
            .with(Arc::new(FailingHook))
            .with(recorder.clone());

        let job = EncodingJob::new("m1", 1);
        let failures = hooks.fire(&JobEvent::added(job.clone(), None)).await;

        assert_eq!(failures, 1);
        assert_eq!(recorder.events.lock().await.len(), 1);
        assert_eq!(metrics.read().await.hook_failures, 1);
    }

    #[tokio::test]
    async fn test_deleted_event_has_no_previous_status() {
        let event = JobEvent::deleted(EncodingJob::new("m1", 1));
        assert_eq!(event.action, PostEncodeAction::Delete);
        assert!(event.previous.is_none());
    }

    #[test]
    fn test_user_action_display() {
        assert_eq!(UserAction::MediaAdded.to_string(), "media_added");
    }
}
