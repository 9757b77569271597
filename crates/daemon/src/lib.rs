//! Encode pipeline
//!
//! Chunked transcoding pipeline and encoding state machine: decides how each
//! video is encoded, dispatches encode jobs, tracks per-job and per-media
//! status, and reassembles chunked encodes exactly once.

pub mod artifacts;
pub mod chunks;
pub mod concurrency;
pub mod coordinator;
pub mod daemon;
pub mod dispatch;
pub mod encode;
pub mod error;
pub mod gc;
pub mod hooks;
pub mod inbox;
pub mod jobs;
pub mod ledger;
pub mod locks;
pub mod media;
pub mod metrics;
pub mod pipeline;
pub mod planner;
pub mod probe;
pub mod profiles;
pub mod server;
pub mod startup;
pub mod state_machine;
pub mod status;
pub mod store;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use encode_pipeline_config as config;
pub use encode_pipeline_config::Config;

pub use artifacts::{ArtifactError, ArtifactStore};
pub use chunks::{check_completeness, ChunkManifest, Completeness};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use coordinator::{ChunkCoordinator, ConcatOutcome, CoordinatorError};
pub use daemon::{Daemon, DaemonError};
pub use dispatch::{DispatchError, Dispatcher, JobQueue, QueueError, WorkUnit};
pub use encode::{Concatenator, FfmpegConcat, ToolCommand, ToolError};
pub use error::PipelineError;
pub use gc::{sweep_orphans, SweepReport};
pub use hooks::{HookList, LogNotifier, Notifier, PostEncodeAction, TransitionHook, UserAction};
pub use inbox::InboxWatcher;
pub use jobs::{EncodingJob, EncodingStatus, JobId, WorkOutcome};
pub use ledger::JobLedger;
pub use media::{MediaId, MediaType, SourceMedia};
pub use metrics::{collect_system_metrics, new_shared_metrics, MetricsSnapshot, SharedMetrics, SystemMetrics};
pub use pipeline::{MediaDetail, MediaSummary, Pipeline};
pub use planner::plan_encodes;
pub use probe::{ProbeError, ProbeReport, Prober};
pub use profiles::{EncodeProfile, Priority, ProfileId, Profiles};
pub use server::{create_router, run_server, AppState, ServerError};
pub use startup::{run_startup_checks, StartupError};
pub use state_machine::{Completion, EncodingStateMachine, StateError};
pub use status::resolve_status;
pub use store::{EncodingStore, StoreError};
pub use worker::{local_queue, WorkerPool};
