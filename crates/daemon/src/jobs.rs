//! Encoding job records.
//!
//! An encoding job belongs to exactly one source media and one encode profile.
//! Chunk jobs additionally carry the chunk-set manifest they belong to and the
//! boundary (chunk source file) they encode.

use crate::media::MediaId;
use crate::profiles::ProfileId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Identifier of an encoding job.
pub type JobId = String;

/// Status of an encoding job, also used as the media-level aggregate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingStatus {
    /// Job is created and waiting for a worker.
    Pending,
    /// A worker has picked the job up.
    Running,
    /// The worker (or concatenation) failed.
    Fail,
    /// The output artifact was produced.
    Success,
}

impl Default for EncodingStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for EncodingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingStatus::Pending => write!(f, "pending"),
            EncodingStatus::Running => write!(f, "running"),
            EncodingStatus::Fail => write!(f, "fail"),
            EncodingStatus::Success => write!(f, "success"),
        }
    }
}

impl EncodingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EncodingStatus::Success | EncodingStatus::Fail)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EncodingStatus::Pending | EncodingStatus::Running)
    }
}

/// Result a worker reports for a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOutcome {
    Success,
    Fail,
}

impl From<WorkOutcome> for EncodingStatus {
    fn from(outcome: WorkOutcome) -> Self {
        match outcome {
            WorkOutcome::Success => EncodingStatus::Success,
            WorkOutcome::Fail => EncodingStatus::Fail,
        }
    }
}

/// A single encode of one media into one profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingJob {
    pub id: JobId,
    pub media_id: MediaId,
    pub profile_id: ProfileId,
    pub status: EncodingStatus,
    /// Whether this job encodes a single chunk of a chunk set.
    pub chunk: bool,
    /// Serialized chunk-set manifest shared by all sibling chunk jobs.
    pub chunk_manifest: Option<String>,
    /// The manifest boundary (chunk source file) this job encodes.
    pub chunk_file_path: Option<String>,
    /// Encoded output, set on success.
    pub artifact: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    /// 0-100, only meaningful while running.
    pub progress: u8,
    pub retries: u32,
    pub worker: String,
    pub logs: String,
    pub commands: String,
    /// SHA-256 of the chunk source file (chunk jobs only).
    pub checksum: Option<String>,
    /// Seconds between first creation and last update (synthesized jobs).
    pub total_run_time: u64,
    /// Store-assigned creation sequence number.
    #[serde(default)]
    pub seq: u64,
    /// Unix timestamp (milliseconds) when the job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when the job was last updated.
    pub updated_at: i64,
}

impl EncodingJob {
    /// Creates a pending whole-file job.
    pub fn new(media_id: impl Into<MediaId>, profile_id: ProfileId) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            media_id: media_id.into(),
            profile_id,
            status: EncodingStatus::Pending,
            chunk: false,
            chunk_manifest: None,
            chunk_file_path: None,
            artifact: None,
            size_bytes: None,
            progress: 0,
            retries: 0,
            worker: String::new(),
            logs: String::new(),
            commands: String::new(),
            checksum: None,
            total_run_time: 0,
            seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a pending chunk job for one manifest boundary.
    pub fn new_chunk(
        media_id: impl Into<MediaId>,
        profile_id: ProfileId,
        manifest: impl Into<String>,
        boundary: impl Into<String>,
    ) -> Self {
        let mut job = Self::new(media_id, profile_id);
        job.chunk = true;
        job.chunk_manifest = Some(manifest.into());
        job.chunk_file_path = Some(boundary.into());
        job
    }

    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Set the job status and update timestamp.
    pub fn set_status(&mut self, status: EncodingStatus) {
        self.status = status;
        self.touch();
    }

    /// Sets progress if it lies within 0..=100.
    ///
    /// Out of range values are rejected without touching the job.
    pub fn set_progress(&mut self, progress: i64) -> bool {
        match u8::try_from(progress) {
            Ok(p) if p <= 100 => {
                self.progress = p;
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Appends a block to the job logs.
    pub fn append_logs(&mut self, logs: &str) {
        if logs.is_empty() {
            return;
        }
        if !self.logs.is_empty() {
            self.logs.push('\n');
        }
        self.logs.push_str(logs);
    }

    /// True when an output artifact path is recorded and non-empty.
    pub fn has_artifact(&self) -> bool {
        self.artifact
            .as_ref()
            .map(|p| !p.as_os_str().is_empty())
            .unwrap_or(false)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn belongs_to(&self, media_id: &str, profile_id: ProfileId) -> bool {
        self.media_id == media_id && self.profile_id == profile_id
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_set_progress_accepts_only_percentages(value in -1_000i64..1_000) {
            let mut job = EncodingJob::new("media1", 1);
            job.progress = 37;
            let before = job.clone();

            let accepted = job.set_progress(value);

            if (0..=100).contains(&value) {
                prop_assert!(accepted);
                prop_assert_eq!(job.progress as i64, value);
            } else {
                prop_assert!(!accepted);
                prop_assert_eq!(job, before);
            }
        }
    }

    #[test]
    fn test_status_display() {
        assert_eq!(EncodingStatus::Pending.to_string(), "pending");
        assert_eq!(EncodingStatus::Running.to_string(), "running");
        assert_eq!(EncodingStatus::Fail.to_string(), "fail");
        assert_eq!(EncodingStatus::Success.to_string(), "success");
    }

    #[test]
    fn test_status_default_and_predicates() {
        assert_eq!(EncodingStatus::default(), EncodingStatus::Pending);
        assert!(EncodingStatus::Pending.is_active());
        assert!(EncodingStatus::Running.is_active());
        assert!(EncodingStatus::Success.is_terminal());
        assert!(EncodingStatus::Fail.is_terminal());
        assert!(!EncodingStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&EncodingStatus::Success).unwrap();
        assert_eq!(json, "\"success\"");
        let outcome: WorkOutcome = serde_json::from_str("\"fail\"").unwrap();
        assert_eq!(EncodingStatus::from(outcome), EncodingStatus::Fail);
    }

    #[test]
    fn test_new_job_defaults() {
        let job = EncodingJob::new("media1", 3);
        assert_eq!(job.id.len(), 36);
        assert_eq!(job.status, EncodingStatus::Pending);
        assert!(!job.chunk);
        assert!(job.chunk_manifest.is_none());
        assert!(!job.has_artifact());
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.belongs_to("media1", 3));
        assert!(!job.belongs_to("media1", 4));
    }

    #[test]
    fn test_new_chunk_job() {
        let job = EncodingJob::new_chunk("media1", 2, "[\"a\",\"b\"]", "a");
        assert!(job.chunk);
        assert_eq!(job.chunk_manifest.as_deref(), Some("[\"a\",\"b\"]"));
        assert_eq!(job.chunk_file_path.as_deref(), Some("a"));
    }

    #[test]
    fn test_empty_artifact_path_is_not_an_artifact() {
        let mut job = EncodingJob::new("media1", 1);
        job.artifact = Some(PathBuf::new());
        assert!(!job.has_artifact());
        job.artifact = Some(PathBuf::from("/media/encoded/a.mp4"));
        assert!(job.has_artifact());
    }

    #[test]
    fn test_append_logs() {
        let mut job = EncodingJob::new("media1", 1);
        job.append_logs("");
        assert_eq!(job.logs, "");
        job.append_logs("first");
        job.append_logs("second");
        assert_eq!(job.logs, "first\nsecond");
    }
}
