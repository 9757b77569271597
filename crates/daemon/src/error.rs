//! Top-level pipeline errors.

use crate::artifacts::ArtifactError;
use crate::dispatch::DispatchError;
use crate::media::MediaId;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Neither video, audio, image nor pdf. Not retryable.
    #[error("media {media_id} is not a supported type: {reason}")]
    UnsupportedMedia { media_id: MediaId, reason: String },

    /// Recognised media whose metadata could not be read. Not retryable here.
    #[error("probing media {media_id} failed: {reason}")]
    ProbeFailure { media_id: MediaId, reason: String },

    #[error("dispatch failed: {0}")]
    DispatchFailure(#[from] DispatchError),

    /// An external tool exited nonzero or timed out.
    #[error("worker failed: {0}")]
    WorkerFailure(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::WorkerFailure(_) | PipelineError::DispatchFailure(_))
    }
}
