//! In-process worker pool.
//!
//! Implements the dispatch queue locally so the daemon runs end to end: two
//! unbounded channels (high and normal tier, high always drained first) feed
//! a pool whose concurrency is bounded by a semaphore. Workers talk to the
//! state machine exactly like remote workers would, through reports.

use crate::chunks::ChunkManifest;
use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::dispatch::{ChunkAssignment, JobQueue, QueueError, WorkUnit};
use crate::encode::{encode_command, parse_progress_line, segment_command};
use crate::jobs::{EncodingJob, EncodingStatus};
use crate::media::SourceMedia;
use crate::pipeline::Pipeline;
use crate::profiles::{EncodeProfile, Priority, ProfileId};
use crate::state_machine::{Completion, StateError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use uuid::Uuid;

/// Creates a connected queue and receiver.
pub fn local_queue() -> (LocalQueue, QueueReceiver) {
    let (high_tx, high_rx) = mpsc::unbounded_channel();
    let (normal_tx, normal_rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));
    (
        LocalQueue {
            high: high_tx,
            normal: normal_tx,
            pending: pending.clone(),
        },
        QueueReceiver {
            high: high_rx,
            normal: normal_rx,
            pending,
        },
    )
}

pub struct LocalQueue {
    high: mpsc::UnboundedSender<WorkUnit>,
    normal: mpsc::UnboundedSender<WorkUnit>,
    pending: Arc<AtomicUsize>,
}

impl JobQueue for LocalQueue {
    fn enqueue(&self, unit: WorkUnit, priority: Priority) -> Result<(), QueueError> {
        let tx = match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        tx.send(unit).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            QueueError::Closed
        })
    }

    fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

pub struct QueueReceiver {
    high: mpsc::UnboundedReceiver<WorkUnit>,
    normal: mpsc::UnboundedReceiver<WorkUnit>,
    pending: Arc<AtomicUsize>,
}

impl QueueReceiver {
    /// Next unit, high tier first. `None` once both senders are gone.
    pub async fn recv(&mut self) -> Option<WorkUnit> {
        let unit = tokio::select! {
            biased;
            Some(unit) = self.high.recv() => unit,
            Some(unit) = self.normal.recv() => unit,
            else => return None,
        };
        self.pending.fetch_sub(1, Ordering::SeqCst);
        Some(unit)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub name: String,
    pub ffmpeg: String,
    pub threads_per_job: u32,
    pub max_concurrent_jobs: u32,
    pub encode_timeout: Duration,
    pub segment_secs: u64,
    pub temp_dir: PathBuf,
    pub max_retries: u32,
    pub minimum_resolutions: Vec<u32>,
}

impl WorkerSettings {
    pub fn from_config(cfg: &Config, plan: &ConcurrencyPlan) -> Self {
        Self {
            name: format!("local-{}", std::process::id()),
            ffmpeg: cfg.tools.ffmpeg.clone(),
            threads_per_job: plan.threads_per_job,
            max_concurrent_jobs: plan.max_concurrent_jobs,
            encode_timeout: Duration::from_secs(cfg.tools.encode_timeout_secs),
            segment_secs: cfg.pipeline.video_chunks_duration,
            temp_dir: cfg.storage.temp_dir.clone(),
            max_retries: cfg.workers.max_retries,
            minimum_resolutions: cfg.pipeline.minimum_resolutions_to_encode.clone(),
        }
    }
}

pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    settings: WorkerSettings,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<Pipeline>, settings: WorkerSettings) -> Self {
        let permits = settings.max_concurrent_jobs.max(1) as usize;
        Self {
            pipeline,
            settings,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Pulls units until the queue closes, running up to the permit count at once.
    pub async fn run(self: Arc<Self>, mut rx: QueueReceiver) {
        while let Some(unit) = rx.recv().await {
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                break;
            };
            let pool = self.clone();
            tokio::spawn(async move {
                pool.process(unit).await;
                drop(permit);
            });
        }
        tracing::info!("work queue closed, worker pool stopping");
    }

    pub async fn process(&self, unit: WorkUnit) {
        let metrics = self.pipeline.ledger().metrics.clone();
        metrics.write().await.running_jobs += 1;
        match unit {
            WorkUnit::Encode { job_id, .. } => self.run_encode(&job_id).await,
            WorkUnit::Chunkize {
                media_id,
                profile_ids,
                force,
            } => self.run_chunkize(&media_id, &profile_ids, force).await,
        }
        let mut m = metrics.write().await;
        m.running_jobs = m.running_jobs.saturating_sub(1);
    }

    async fn run_encode(&self, job_id: &str) {
        let ledger = self.pipeline.ledger();
        let states = self.pipeline.states();
        let Some(job) = ledger.store.get_job(job_id).await else {
            tracing::debug!(job = %job_id, "encoding gone before it started");
            return;
        };
        let media = ledger.store.get_media(&job.media_id).await;
        let profile = self.pipeline.profiles().get(job.profile_id).cloned();
        let (Some(media), Some(profile)) = (media, profile) else {
            if let Err(e) = states
                .report_complete(job_id, Completion::failure("media or profile no longer exists"))
                .await
            {
                tracing::warn!(job = %job_id, error = %e, "could not fail orphaned encoding");
            }
            return;
        };

        if let Err(e) = states.report_running(job_id, &self.settings.name).await {
            tracing::warn!(job = %job_id, error = %e, "could not start encoding");
            return;
        }

        let completion = self.encode(&job, &media, &profile).await;
        let artifact = completion.artifact.clone();
        match states.report_complete(job_id, completion).await {
            Ok(done) if done.status == EncodingStatus::Fail => self.maybe_retry(&done, &profile).await,
            Ok(_) => {}
            Err(e) => {
                // nobody will own the output any more
                if let Some(path) = artifact {
                    if let Err(e) = ledger.artifacts.remove_file(&path).await {
                        tracing::warn!(path = %path.display(), error = %e, "could not remove unowned output");
                    }
                }
                if !matches!(e, StateError::NotFound(_)) {
                    tracing::warn!(job = %job_id, error = %e, "completion report rejected");
                }
            }
        }
    }

    async fn encode(&self, job: &EncodingJob, media: &SourceMedia, profile: &EncodeProfile) -> Completion {
        let ledger = self.pipeline.ledger();
        let (input, duration) = match job.chunk_file_path.as_deref() {
            Some(boundary) if job.chunk => (PathBuf::from(boundary), self.settings.segment_secs),
            _ => (media.source_path.clone(), media.duration),
        };
        let ext = profile.extension.as_str();

        if let Err(e) = tokio::fs::create_dir_all(&self.settings.temp_dir).await {
            return Completion::failure(format!("temp dir: {}", e));
        }
        let temp = self.settings.temp_dir.join(format!("{}.{}", job.id, ext));
        let cmd = encode_command(&self.settings.ffmpeg, profile, &input, &temp, self.settings.threads_per_job)
            .timeout(self.settings.encode_timeout);
        let command_line = cmd.command_line();

        let (tx, rx) = watch::channel(0u8);
        let forwarder = tokio::spawn(forward_progress(self.pipeline.clone(), job.id.clone(), rx));
        let result = cmd
            .execute_streaming(|line| {
                if let Some(p) = parse_progress_line(line, duration) {
                    let _ = tx.send(p);
                }
            })
            .await;
        drop(tx);
        let _ = forwarder.await;

        let output = match result {
            Ok((output, _)) => output,
            Err(e) => {
                tracing::warn!(job = %job.id, error = %e, "encode failed");
                if let Err(e) = ledger.artifacts.remove_file(&temp).await {
                    tracing::warn!(path = %temp.display(), error = %e, "could not remove temp output");
                }
                return Completion::failure(e.to_string())
                    .worker(self.settings.name.clone())
                    .commands(command_line);
            }
        };

        let stored = async {
            let dest = ledger.artifacts.allocate_output(&job.media_id, &input, ext).await?;
            ledger.artifacts.move_file(&temp, &dest).await?;
            let size = ledger.artifacts.size(&dest).await?;
            Ok::<_, crate::artifacts::ArtifactError>((dest, size))
        }
        .await;

        match stored {
            Ok((dest, size)) => Completion::success(dest, Some(size))
                .worker(self.settings.name.clone())
                .commands(command_line)
                .logs(output.stderr),
            Err(e) => {
                if let Err(e) = ledger.artifacts.remove_file(&temp).await {
                    tracing::warn!(path = %temp.display(), error = %e, "could not remove temp output");
                }
                Completion::failure(format!("storing output: {}", e))
                    .worker(self.settings.name.clone())
                    .commands(command_line)
            }
        }
    }

    async fn maybe_retry(&self, failed: &EncodingJob, profile: &EncodeProfile) {
        // chunk failures fail the whole set; there is nothing left to retry into
        if failed.chunk {
            return;
        }
        // `retries` already counts this failure, so at most max_retries re-dispatches
        if failed.retries > self.settings.max_retries {
            tracing::debug!(job = %failed.id, retries = failed.retries, "retry budget spent");
            return;
        }
        let priority = Priority::for_profile(profile, &self.settings.minimum_resolutions);
        if let Err(e) = self.pipeline.dispatcher().redispatch(failed, priority).await {
            tracing::warn!(job = %failed.id, error = %e, "retry dispatch failed");
        }
    }

    async fn run_chunkize(&self, media_id: &str, profile_ids: &[ProfileId], force: bool) {
        let ledger = self.pipeline.ledger();
        let Some(media) = ledger.store.get_media(media_id).await else {
            tracing::debug!(media = %media_id, "media gone before chunking");
            return;
        };

        let boundaries = match self.segment(&media).await {
            Ok(b) => b,
            Err(reason) => {
                tracing::warn!(media = %media_id, %reason, "chunking failed");
                for &profile_id in profile_ids {
                    if let Err(e) = self
                        .pipeline
                        .states()
                        .record_failed_encode(&media.id, profile_id, &reason)
                        .await
                    {
                        tracing::warn!(
                            media = %media_id,
                            profile = profile_id,
                            error = %e,
                            "could not record failed encode"
                        );
                    }
                }
                return;
            }
        };
        let blob = boundaries.to_blob();

        let mut checksums = Vec::with_capacity(boundaries.len());
        for boundary in boundaries.boundaries() {
            checksums.push(ledger.artifacts.checksum(Path::new(boundary)).await.ok());
        }

        for &profile_id in profile_ids {
            let Some(profile) = self.pipeline.profiles().get(profile_id) else {
                continue;
            };
            let priority = Priority::for_profile(profile, &self.settings.minimum_resolutions);
            for (boundary, checksum) in boundaries.boundaries().iter().zip(&checksums) {
                let assignment = ChunkAssignment {
                    manifest: blob.clone(),
                    boundary: boundary.clone(),
                    checksum: checksum.clone(),
                };
                if let Err(e) = self
                    .pipeline
                    .dispatcher()
                    .dispatch(media_id, profile_id, Some(assignment), priority, force)
                    .await
                {
                    // the failed chunk already fails the set
                    tracing::warn!(media = %media_id, profile = profile_id, error = %e, "chunk dispatch failed");
                    break;
                }
            }
        }
        tracing::info!(
            media = %media_id,
            chunks = boundaries.len(),
            profiles = profile_ids.len(),
            "chunk jobs dispatched"
        );
    }

    /// Splits the source into `chunks/<media>/<token>/part_NNNN.<ext>`.
    async fn segment(&self, media: &SourceMedia) -> Result<ChunkManifest, String> {
        let artifacts = &self.pipeline.ledger().artifacts;
        let ext = media
            .source_path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "mkv".to_string());
        let mut token = Uuid::new_v4().simple().to_string();
        token.truncate(8);
        let dir = artifacts.chunks_dir(&media.id).join(token);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("creating {}: {}", dir.display(), e))?;

        let pattern = dir.join(format!("part_%04d.{}", ext));
        segment_command(&self.settings.ffmpeg, &media.source_path, self.settings.segment_secs, &pattern)
            .timeout(self.settings.encode_timeout)
            .execute()
            .await
            .map_err(|e| e.to_string())?;

        let boundaries = list_chunk_files(&dir)
            .await
            .map_err(|e| format!("listing {}: {}", dir.display(), e))?;
        ChunkManifest::new(boundaries).map_err(|e| e.to_string())
    }
}

async fn forward_progress(pipeline: Arc<Pipeline>, job_id: String, mut rx: watch::Receiver<u8>) {
    while rx.changed().await.is_ok() {
        let percent = *rx.borrow_and_update();
        if let Err(e) = pipeline.states().report_progress(&job_id, i64::from(percent)).await {
            tracing::debug!(job = %job_id, error = %e, "progress not recorded");
            break;
        }
    }
}

/// Segment files of a chunk directory in name (= timeline) order.
async fn list_chunk_files(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path().to_string_lossy().to_string());
        }
    }
    files.sort();
    Ok(files)
}
