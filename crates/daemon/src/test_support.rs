//! Shared fixtures for component tests.

use crate::artifacts::ArtifactStore;
use crate::chunks::ChunkManifest;
use crate::config::default_profiles;
use crate::coordinator::ChunkCoordinator;
use crate::dispatch::{Dispatcher, JobQueue, QueueError, WorkUnit};
use crate::encode::concat::ByteConcat;
use crate::encode::{Concatenator, ToolError};
use crate::hooks::testing::{RecordingHook, RecordingNotifier};
use crate::hooks::HookList;
use crate::jobs::EncodingJob;
use crate::ledger::JobLedger;
use crate::media::{MediaType, SourceMedia};
use crate::metrics::{new_shared_metrics, MetricsSnapshot};
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::probe::Prober;
use crate::profiles::{Priority, Profiles};
use crate::state_machine::{Completion, EncodingStateMachine};
use crate::status::AggregateStatusHook;
use crate::store::EncodingStore;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

/// Queue that records what it is given.
#[derive(Default)]
pub struct RecordingQueue {
    units: Mutex<Vec<(WorkUnit, Priority)>>,
    closed: AtomicBool,
}

impl RecordingQueue {
    pub fn units(&self) -> Vec<(WorkUnit, Priority)> {
        self.units.lock().unwrap().clone()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, unit: WorkUnit, priority: Priority) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.units.lock().unwrap().push((unit, priority));
        Ok(())
    }

    fn len(&self) -> usize {
        self.units.lock().unwrap().len()
    }
}

/// Concatenator that sneaks an extra job into the store before joining.
pub struct InjectingConcat {
    store: Arc<EncodingStore>,
    extra: tokio::sync::Mutex<Option<EncodingJob>>,
    inner: ByteConcat,
}

impl InjectingConcat {
    pub fn new(store: Arc<EncodingStore>, extra: EncodingJob) -> Self {
        Self {
            store,
            extra: tokio::sync::Mutex::new(Some(extra)),
            inner: ByteConcat::default(),
        }
    }
}

#[async_trait]
impl Concatenator for InjectingConcat {
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<String, ToolError> {
        if let Some(extra) = self.extra.lock().await.take() {
            self.store.insert_job(extra).await.unwrap();
        }
        self.inner.concat(inputs, output).await
    }
}

/// A chunk set inserted by [`Harness::chunk_set`].
pub struct ChunkSetFixture {
    pub blob: String,
    pub boundaries: Vec<String>,
    pub jobs: Vec<EncodingJob>,
}

/// Wires every component over a temp dir, an in-memory store, the default
/// profiles, recording hooks and a recording queue. Media `m1` is a probed
/// 1080p video of ten minutes.
pub struct Harness {
    pub dir: TempDir,
    pub ledger: Arc<JobLedger>,
    pub coordinator: Arc<ChunkCoordinator>,
    pub states: Arc<EncodingStateMachine>,
    pub dispatcher: Arc<Dispatcher>,
    pub queue: Arc<RecordingQueue>,
    pub recorder: Arc<RecordingHook>,
    pub notifier: Arc<RecordingNotifier>,
    pub profiles: Arc<Profiles>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_concat(Arc::new(ByteConcat::default())).await
    }

    pub async fn with_concat(concat: Arc<dyn Concatenator>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = Arc::new(ArtifactStore::new(dir.path().join("media"), Duration::from_secs(5)));
        artifacts.ensure_layout().await.unwrap();
        let store = Arc::new(EncodingStore::in_memory());
        let metrics = new_shared_metrics();
        let profiles = Arc::new(Profiles::from_config(&default_profiles()).unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let recorder = Arc::new(RecordingHook::default());

        let hooks = HookList::new(metrics.clone())
            .with(Arc::new(AggregateStatusHook::new(
                store.clone(),
                profiles.clone(),
                notifier.clone(),
            )))
            .with(recorder.clone());
        let ledger = Arc::new(JobLedger::new(store, artifacts, hooks, metrics));
        let coordinator = Arc::new(ChunkCoordinator::new(ledger.clone(), concat));
        let states = Arc::new(EncodingStateMachine::new(ledger.clone(), coordinator.clone()));
        let queue = Arc::new(RecordingQueue::default());
        let dispatcher = Arc::new(Dispatcher::new(
            ledger.clone(),
            states.clone(),
            queue.clone(),
            "http://127.0.0.1:7878",
        ));

        let h = Self {
            dir,
            ledger,
            coordinator,
            states,
            dispatcher,
            queue,
            recorder,
            notifier,
            profiles,
        };
        h.insert_video("m1", 600, 1080).await;
        h
    }

    /// A pipeline over this harness. `false` stands in for ffprobe: it exits 1
    /// for anything, like ffprobe on a file it cannot read.
    pub fn pipeline(&self, threshold: u64, ffmpeg: &str) -> Pipeline {
        Pipeline::new(
            self.ledger.clone(),
            self.states.clone(),
            self.dispatcher.clone(),
            self.profiles.clone(),
            Prober::new("false", Duration::from_secs(5)),
            self.notifier.clone(),
            PipelineSettings {
                chunk_threshold_secs: threshold,
                chunkize: true,
                minimum_resolutions: vec![240, 360],
                ffmpeg: ffmpeg.to_string(),
                thumbnail_timeout: Duration::from_secs(5),
                sprite_timeout: Duration::from_secs(5),
            },
        )
    }

    pub fn store(&self) -> &Arc<EncodingStore> {
        &self.ledger.store
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.ledger.artifacts
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.ledger.metrics.read().await.clone()
    }

    /// Inserts a probed video whose source file exists in `original/`.
    pub async fn insert_video(&self, id: &str, duration: u64, height: u32) -> SourceMedia {
        let source = self.artifacts().original_dir().join(format!("{id}.mp4"));
        tokio::fs::write(&source, b"source").await.unwrap();
        let mut media = SourceMedia::with_id(id, "clip", source);
        media.media_type = Some(MediaType::Video);
        media.duration = duration;
        media.height = Some(height);
        media.size_bytes = 6;
        self.store().insert_media(media).await.unwrap()
    }

    pub async fn insert_job(&self, job: EncodingJob) -> EncodingJob {
        self.store().insert_job(job).await.unwrap()
    }

    /// A successful completion backed by a real file in `encoded/m1/`.
    pub async fn success_completion(&self, name: &str) -> Completion {
        let ext = Path::new(name)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "mp4".to_string());
        let path = self
            .artifacts()
            .allocate_output("m1", Path::new(name), &ext)
            .await
            .unwrap();
        tokio::fs::write(&path, name.as_bytes()).await.unwrap();
        Completion::success(path, Some(name.len() as u64))
    }

    /// Creates `n` chunk source files and one pending chunk job per file.
    /// Chunk `i` contains `part{i}`.
    pub async fn chunk_set(&self, media_id: &str, profile_id: u32, n: usize) -> ChunkSetFixture {
        let mut token = Uuid::new_v4().simple().to_string();
        token.truncate(8);
        let dir = self.artifacts().chunks_dir(media_id).join(token);
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let mut boundaries = Vec::new();
        for i in 0..n {
            let path = dir.join(format!("part_{i:04}.mp4"));
            tokio::fs::write(&path, format!("part{i}")).await.unwrap();
            boundaries.push(path.to_string_lossy().to_string());
        }
        let blob = ChunkManifest::new(boundaries.clone()).unwrap().to_blob();

        let mut jobs = Vec::new();
        for boundary in &boundaries {
            let job = EncodingJob::new_chunk(media_id, profile_id, blob.clone(), boundary.clone());
            jobs.push(self.insert_job(job).await);
        }
        ChunkSetFixture { blob, boundaries, jobs }
    }

    pub fn chunk_output(&self, boundary: &str) -> PathBuf {
        PathBuf::from(format!("{boundary}.out.mp4"))
    }

    /// Drives a job through running to success or fail like a worker would.
    /// Reports against jobs that were deleted meanwhile are ignored.
    pub async fn run_chunk(&self, job: &EncodingJob, ok: bool) {
        if self.states.report_running(&job.id, "test-worker").await.is_err() {
            return;
        }
        let completion = match (ok, job.chunk_file_path.as_deref()) {
            (false, _) => Completion::failure("encoder crashed"),
            (true, Some(boundary)) => {
                let source = tokio::fs::read(boundary).await.unwrap_or_default();
                let mut encoded = b"enc:".to_vec();
                encoded.extend_from_slice(&source);
                let output = self.chunk_output(boundary);
                tokio::fs::write(&output, &encoded).await.unwrap();
                Completion::success(output, Some(encoded.len() as u64))
            }
            (true, None) => self.success_completion("whole.mp4").await,
        };
        let _ = self.states.report_complete(&job.id, completion).await;
    }
}
