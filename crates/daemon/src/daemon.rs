//! Daemon startup and background loops.
//!
//! Wires the store, artifact storage, hooks, state machine, local queue and
//! worker pool together, then serves the HTTP API while the pool drains the
//! queue.

use crate::artifacts::{ArtifactError, ArtifactStore};
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::coordinator::ChunkCoordinator;
use crate::dispatch::Dispatcher;
use crate::encode::FfmpegConcat;
use crate::gc::sweep_orphans;
use crate::hooks::{HookList, LogNotifier, Notifier};
use crate::inbox::InboxWatcher;
use crate::ledger::JobLedger;
use crate::metrics::{collect_system_metrics, new_shared_metrics, SharedMetrics};
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::probe::Prober;
use crate::profiles::Profiles;
use crate::server::{run_server, AppState, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use crate::state_machine::EncodingStateMachine;
use crate::status::AggregateStatusHook;
use crate::store::{EncodingStore, StoreError};
use crate::worker::{local_queue, QueueReceiver, WorkerPool, WorkerSettings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

const METRICS_INTERVAL: Duration = Duration::from_millis(500);
const GC_INTERVAL: Duration = Duration::from_secs(600);
/// Longer than any concatenation or chunk dispatch takes.
const GC_GRACE: Duration = Duration::from_secs(6 * 3600);
const INBOX_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("state store: {0}")]
    Store(#[from] StoreError),

    #[error("artifact storage: {0}")]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

pub struct Daemon {
    pub config: Config,
    pub concurrency_plan: ConcurrencyPlan,
    pub metrics: SharedMetrics,
    pub pipeline: Arc<Pipeline>,
    pub pool: Arc<WorkerPool>,
    queue_rx: QueueReceiver,
}

impl Daemon {
    /// Loads the config file (plus environment overrides), runs the startup
    /// checks and builds every component.
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config).await
    }

    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config).await?;
        Self::new_without_checks(config).await
    }

    /// Builds the daemon without probing for ffmpeg and ffprobe.
    pub async fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let concurrency_plan = derive_plan(&config);
        let metrics = new_shared_metrics();
        let profiles = Arc::new(Profiles::from_config(&config.profiles)?);

        let store = Arc::new(EncodingStore::open(&config.storage.state_dir).await?);
        let artifacts = Arc::new(ArtifactStore::new(
            &config.storage.media_root,
            Duration::from_secs(config.tools.fs_timeout_secs),
        ));
        artifacts.ensure_layout().await?;
        tokio::fs::create_dir_all(&config.storage.temp_dir)
            .await
            .map_err(|source| ArtifactError::Io {
                op: "create temp dir",
                path: config.storage.temp_dir.clone(),
                source,
            })?;

        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let hooks = HookList::new(metrics.clone()).with(Arc::new(AggregateStatusHook::new(
            store.clone(),
            profiles.clone(),
            notifier.clone(),
        )));
        let ledger = Arc::new(JobLedger::new(store, artifacts, hooks, metrics.clone()));

        let concat = Arc::new(FfmpegConcat::new(
            config.tools.ffmpeg.clone(),
            config.storage.temp_dir.clone(),
            Duration::from_secs(config.tools.concat_timeout_secs),
        ));
        let coordinator = Arc::new(ChunkCoordinator::new(ledger.clone(), concat));
        let states = Arc::new(EncodingStateMachine::new(ledger.clone(), coordinator));

        let (queue, queue_rx) = local_queue();
        let dispatcher = Arc::new(Dispatcher::new(
            ledger.clone(),
            states.clone(),
            Arc::new(queue),
            config.server.callback_base_url.clone(),
        ));

        let prober = Prober::new(
            config.tools.ffprobe.clone(),
            Duration::from_secs(config.tools.probe_timeout_secs),
        );
        let pipeline = Arc::new(Pipeline::new(
            ledger,
            states,
            dispatcher,
            profiles,
            prober,
            notifier,
            PipelineSettings::from_config(&config),
        ));
        let pool = Arc::new(WorkerPool::new(
            pipeline.clone(),
            WorkerSettings::from_config(&config, &concurrency_plan),
        ));

        tracing::info!(
            cores = concurrency_plan.total_cores,
            threads_per_job = concurrency_plan.threads_per_job,
            max_concurrent_jobs = concurrency_plan.max_concurrent_jobs,
            "daemon initialised"
        );

        Ok(Self {
            config,
            concurrency_plan,
            metrics,
            pipeline,
            pool,
            queue_rx,
        })
    }

    /// Copies system stats and the local queue length into the snapshot.
    pub async fn refresh_metrics(metrics: &SharedMetrics, pipeline: &Pipeline) {
        let system = collect_system_metrics();
        let queue_len = pipeline.dispatcher().queue_len();
        let mut snapshot = metrics.write().await;
        snapshot.system = system;
        snapshot.queue_len = queue_len;
        snapshot.timestamp_unix_ms = timestamp_ms();
    }

    pub fn start_metrics_updater(&self) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            loop {
                Self::refresh_metrics(&metrics, &pipeline).await;
                tokio::time::sleep(METRICS_INTERVAL).await;
            }
        })
    }

    pub fn start_gc(&self) -> JoinHandle<()> {
        let ledger = self.pipeline.ledger().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = sweep_orphans(&ledger.store, &ledger.artifacts, GC_GRACE).await {
                    tracing::warn!(error = %e, "orphan sweep failed");
                }
            }
        })
    }

    /// Polls the inbox, if one is configured, and ingests stable files.
    pub fn start_inbox(&self) -> Option<JoinHandle<()>> {
        let root = self.config.storage.inbox.clone()?;
        let pipeline = self.pipeline.clone();
        Some(tokio::spawn(async move {
            let mut watcher = InboxWatcher::new(root);
            tracing::info!(inbox = %watcher.root().display(), "watching inbox");
            loop {
                for candidate in watcher.poll() {
                    match pipeline.ingest(&candidate.path, None, false).await {
                        Ok(media) => tracing::info!(media = %media.id, "ingested from inbox"),
                        Err(e) => tracing::warn!(
                            path = %candidate.path.display(),
                            error = %e,
                            "inbox ingest failed"
                        ),
                    }
                }
                tokio::time::sleep(INBOX_INTERVAL).await;
            }
        }))
    }

    /// Starts the pool and background loops, then serves the API.
    pub async fn run(self) -> Result<(), DaemonError> {
        let _updater = self.start_metrics_updater();
        let _gc = self.start_gc();
        let _inbox = self.start_inbox();
        let _pool = tokio::spawn(self.pool.clone().run(self.queue_rx));

        let state = AppState {
            pipeline: self.pipeline.clone(),
            metrics: self.metrics.clone(),
        };
        run_server(&self.config.server.bind, state).await?;
        Ok(())
    }
}

fn timestamp_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::EncodingStatus;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.media_root = dir.path().join("media");
        config.storage.state_dir = dir.path().join("state");
        config.storage.temp_dir = dir.path().join("tmp");
        config.workers.logical_cores = Some(32);
        config.tools.ffmpeg = "definitely-not-ffmpeg".to_string();
        config.tools.ffprobe = "definitely-not-ffprobe".to_string();
        config
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(test_config(&dir)).await.unwrap();

        assert_eq!(daemon.concurrency_plan.threads_per_job, 8);
        assert_eq!(daemon.concurrency_plan.max_concurrent_jobs, 4);
        assert_eq!(daemon.pool.available_permits(), 4);
        assert!(dir.path().join("media/original").is_dir());
        assert!(dir.path().join("tmp").is_dir());
    }

    #[tokio::test]
    async fn test_startup_checks_reject_missing_tools() {
        let dir = TempDir::new().unwrap();
        let result = Daemon::with_config(test_config(&dir)).await;
        assert!(matches!(result, Err(DaemonError::Startup(_))));
    }

    #[tokio::test]
    async fn test_invalid_profile_config_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.profiles[1].codec = Some("mpeg2".to_string());
        let result = Daemon::new_without_checks(config).await;
        assert!(matches!(result, Err(DaemonError::Config(_))));
    }

    #[tokio::test]
    async fn test_encode_lands_in_local_queue() {
        let dir = TempDir::new().unwrap();
        let daemon = Daemon::new_without_checks(test_config(&dir)).await.unwrap();
        let source = dir.path().join("media/original/v.mp4");
        tokio::fs::write(&source, b"x").await.unwrap();
        let mut media = crate::media::SourceMedia::with_id("v", "v", source);
        media.media_type = Some(crate::media::MediaType::Video);
        media.duration = 60;
        media.height = Some(720);
        daemon.pipeline.ledger().store.insert_media(media).await.unwrap();

        let summary = daemon.pipeline.encode("v", Some(vec![2, 5]), false).await.unwrap();
        assert_eq!(summary.whole_jobs.len(), 2);

        Daemon::refresh_metrics(&daemon.metrics, &daemon.pipeline).await;
        let snapshot = daemon.metrics.read().await.clone();
        assert_eq!(snapshot.queue_len, 2);
        assert_eq!(snapshot.dispatched_jobs, 2);
        assert!(snapshot.timestamp_unix_ms > 1_577_836_800_000);

        let jobs = daemon.pipeline.ledger().store.jobs_for_media("v").await;
        assert!(jobs.iter().all(|j| j.status == EncodingStatus::Pending));
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let daemon = Daemon::new_without_checks(test_config(&dir)).await.unwrap();
            let media = crate::media::SourceMedia::with_id("keep", "keep", dir.path().join("k.mp4"));
            daemon.pipeline.ledger().store.insert_media(media).await.unwrap();
        }
        let daemon = Daemon::new_without_checks(test_config(&dir)).await.unwrap();
        assert!(daemon.pipeline.get_media("keep").await.is_ok());
    }
}
