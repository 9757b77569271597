//! Media-level aggregate status and the encodings overview.
//!
//! The aggregate is recomputed from scratch on every whole-file job event:
//! no jobs is pending, any success is success, otherwise any running is
//! running, otherwise fail. Only mp4 jobs count.

use crate::hooks::{HookError, JobEvent, Notifier, PostEncodeAction, TransitionHook};
use crate::jobs::{EncodingJob, EncodingStatus, JobId};
use crate::media::SourceMedia;
use crate::profiles::{Extension, Profiles};
use crate::store::{EncodingStore, StoreError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Folds job statuses into the media-level status.
pub fn resolve_status<I>(statuses: I) -> EncodingStatus
where
    I: IntoIterator<Item = EncodingStatus>,
{
    let mut any = false;
    let mut running = false;
    for status in statuses {
        any = true;
        match status {
            EncodingStatus::Success => return EncodingStatus::Success,
            EncodingStatus::Running => running = true,
            _ => {}
        }
    }
    match (any, running) {
        (false, _) => EncodingStatus::Pending,
        (true, true) => EncodingStatus::Running,
        (true, false) => EncodingStatus::Fail,
    }
}

/// Keeps the media record in step with its jobs and triggers packaging.
pub struct AggregateStatusHook {
    store: Arc<EncodingStore>,
    profiles: Arc<Profiles>,
    notifier: Arc<dyn Notifier>,
}

impl AggregateStatusHook {
    pub fn new(store: Arc<EncodingStore>, profiles: Arc<Profiles>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            profiles,
            notifier,
        }
    }

    fn mp4_statuses<'a>(&'a self, jobs: &'a [EncodingJob]) -> impl Iterator<Item = EncodingStatus> + 'a {
        jobs.iter()
            .filter(|j| !j.chunk)
            .filter(|j| {
                self.profiles
                    .get(j.profile_id)
                    .map(|p| p.extension == Extension::Mp4)
                    .unwrap_or(false)
            })
            .map(|j| j.status)
    }
}

#[async_trait]
impl TransitionHook for AggregateStatusHook {
    fn name(&self) -> &str {
        "aggregate-status"
    }

    async fn on_event(&self, event: &JobEvent) -> Result<(), HookError> {
        let job = &event.job;
        if job.chunk {
            return Ok(());
        }
        let profile = self.profiles.get(job.profile_id);
        let is_gif = profile.map(|p| p.is_gif()).unwrap_or(false);

        // resolved against the jobs as they are at commit time, so a late hook
        // cannot write back a stale status
        let mut status = EncodingStatus::Pending;
        let mut current = false;
        let result = self
            .store
            .update_media_with_jobs(&job.media_id, |m, jobs| {
                status = resolve_status(self.mp4_statuses(jobs));
                current = job.status == EncodingStatus::Success
                    && jobs
                        .iter()
                        .any(|j| j.id == job.id && j.status == EncodingStatus::Success);
                m.encoding_status = status;
                if is_gif {
                    match event.action {
                        PostEncodeAction::Add if current => {
                            m.preview_path = job.artifact.clone();
                        }
                        PostEncodeAction::Delete if m.preview_path == job.artifact => {
                            m.preview_path = None;
                        }
                        _ => {}
                    }
                }
            })
            .await;
        let media = match result {
            Ok(media) => media,
            // cascade deletes remove the media first
            Err(StoreError::MediaNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(media = %media.id, %status, "aggregate status resolved");

        let is_h264 = profile.map(|p| p.is_h264()).unwrap_or(false);
        if event.action == PostEncodeAction::Add && current && is_h264 {
            self.notifier.packaging_ready(&media, job).await?;
        }
        Ok(())
    }
}

/// One cell of the encodings overview.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EncodingInfo {
    pub title: String,
    pub url: Option<String>,
    pub progress: u8,
    pub size: Option<u64>,
    pub encoding_id: Option<JobId>,
    pub status: Option<EncodingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_run_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commands: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_started: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_time: Option<i64>,
}

/// resolution -> codec -> info
pub type EncodingsInfo = BTreeMap<u32, BTreeMap<String, EncodingInfo>>;

/// Public URL of an artifact below the media root.
pub fn artifact_url(media_root: &Path, artifact: &Path) -> Option<String> {
    let rel = artifact.strip_prefix(media_root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Some(format!("/media/{}", parts.join("/")))
}

/// Builds the per resolution and codec overview of a video's encodings.
///
/// Gif encodings are left out. With `full`, operator fields are included and
/// chunked encodes still in flight show up with their average chunk progress.
pub fn encodings_info(
    media: &SourceMedia,
    jobs: &[EncodingJob],
    profiles: &Profiles,
    media_root: &Path,
    full: bool,
) -> EncodingsInfo {
    let mut ret = EncodingsInfo::new();
    if !media.is_video() {
        return ret;
    }

    for job in jobs.iter().filter(|j| !j.chunk && j.media_id == media.id) {
        let Some(profile) = profiles.get(job.profile_id) else {
            continue;
        };
        let (Some(resolution), Some(codec)) = (profile.resolution, profile.codec) else {
            continue;
        };

        let mut info = EncodingInfo {
            title: profile.name.clone(),
            url: job
                .artifact
                .as_deref()
                .filter(|_| job.has_artifact())
                .and_then(|a| artifact_url(media_root, a)),
            progress: job.progress,
            size: job.size_bytes,
            encoding_id: Some(job.id.clone()),
            status: Some(job.status),
            ..EncodingInfo::default()
        };
        if full {
            info.logs = Some(job.logs.clone());
            info.worker = Some(job.worker.clone());
            info.retries = Some(job.retries);
            info.total_run_time = Some(job.total_run_time).filter(|t| *t > 0);
            info.commands = Some(job.commands.clone()).filter(|c| !c.is_empty());
            info.time_started = Some(job.created_at);
            info.updated_time = Some(job.updated_at);
        }
        ret.entry(resolution.height())
            .or_default()
            .insert(codec.as_str().to_string(), info);
    }

    if full {
        let mut in_flight: BTreeMap<(u32, String), (String, Vec<u8>)> = BTreeMap::new();
        for job in jobs.iter().filter(|j| j.chunk && j.media_id == media.id) {
            let Some(profile) = profiles.get(job.profile_id) else {
                continue;
            };
            let (Some(resolution), Some(codec)) = (profile.resolution, profile.codec) else {
                continue;
            };
            let key = (resolution.height(), codec.as_str().to_string());
            let has_final = ret
                .get(&key.0)
                .map(|codecs| codecs.contains_key(&key.1))
                .unwrap_or(false);
            if !has_final {
                in_flight
                    .entry(key)
                    .or_insert_with(|| (profile.name.clone(), Vec::new()))
                    .1
                    .push(job.progress);
            }
        }

        for ((resolution, codec), (title, progress)) in in_flight {
            let avg = progress.iter().map(|p| *p as u32).sum::<u32>() / progress.len().max(1) as u32;
            ret.entry(resolution).or_default().insert(
                codec,
                EncodingInfo {
                    title,
                    progress: avg as u8,
                    ..EncodingInfo::default()
                },
            );
        }
    }

    ret
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_profiles;
    use crate::hooks::testing::RecordingNotifier;
    use crate::media::MediaType;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn status_strategy() -> impl Strategy<Value = EncodingStatus> {
        prop_oneof![
            Just(EncodingStatus::Pending),
            Just(EncodingStatus::Running),
            Just(EncodingStatus::Fail),
            Just(EncodingStatus::Success),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_any_success_wins(statuses in prop::collection::vec(status_strategy(), 0..10)) {
            let resolved = resolve_status(statuses.iter().copied());
            if statuses.is_empty() {
                prop_assert_eq!(resolved, EncodingStatus::Pending);
            } else if statuses.contains(&EncodingStatus::Success) {
                prop_assert_eq!(resolved, EncodingStatus::Success);
            } else if statuses.contains(&EncodingStatus::Running) {
                prop_assert_eq!(resolved, EncodingStatus::Running);
            } else {
                prop_assert_eq!(resolved, EncodingStatus::Fail);
            }
        }
    }

    #[test]
    fn test_mixed_statuses_resolve_to_success() {
        let statuses = [EncodingStatus::Fail, EncodingStatus::Success, EncodingStatus::Running];
        assert_eq!(resolve_status(statuses), EncodingStatus::Success);
        assert_eq!(resolve_status([EncodingStatus::Pending]), EncodingStatus::Fail);
        assert_eq!(resolve_status([]), EncodingStatus::Pending);
    }

    fn profiles() -> Arc<Profiles> {
        Arc::new(Profiles::from_config(&default_profiles()).unwrap())
    }

    async fn video(store: &EncodingStore) -> SourceMedia {
        let mut media = SourceMedia::with_id("m1", "clip", PathBuf::from("/media/original/clip.mp4"));
        media.media_type = Some(MediaType::Video);
        media.duration = 60;
        media.height = Some(1080);
        store.insert_media(media).await.unwrap()
    }

    #[tokio::test]
    async fn test_hook_resolves_status_and_packages_h264_success_once() {
        let store = Arc::new(EncodingStore::in_memory());
        let notifier = Arc::new(RecordingNotifier::default());
        let hook = AggregateStatusHook::new(store.clone(), profiles(), notifier.clone());
        video(&store).await;

        // profile 5 is h264 720p in the default set
        let mut job = EncodingJob::new("m1", 5);
        job.status = EncodingStatus::Success;
        job.artifact = Some(PathBuf::from("/media/encoded/m1/clip.a.mp4"));
        let job = store.insert_job(job).await.unwrap();

        hook.on_event(&JobEvent::added(job.clone(), Some(EncodingStatus::Running)))
            .await
            .unwrap();

        let media = store.get_media("m1").await.unwrap();
        assert_eq!(media.encoding_status, EncodingStatus::Success);
        assert_eq!(notifier.packaging.lock().await.as_slice(), &[job.id.clone()]);

        // deletes never package
        hook.on_event(&JobEvent::deleted(job)).await.unwrap();
        assert_eq!(notifier.packaging.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_gif_sets_and_clears_preview() {
        let store = Arc::new(EncodingStore::in_memory());
        let hook = AggregateStatusHook::new(store.clone(), profiles(), Arc::new(RecordingNotifier::default()));
        video(&store).await;

        let mut gif = EncodingJob::new("m1", 1);
        gif.status = EncodingStatus::Success;
        gif.artifact = Some(PathBuf::from("/media/encoded/m1/clip.b.gif"));
        let gif = store.insert_job(gif).await.unwrap();

        hook.on_event(&JobEvent::added(gif.clone(), None)).await.unwrap();
        let media = store.get_media("m1").await.unwrap();
        assert_eq!(media.preview_path, gif.artifact);
        // gif does not count towards the mp4 family
        assert_eq!(media.encoding_status, EncodingStatus::Pending);

        store.remove_job(&gif.id).await.unwrap();
        hook.on_event(&JobEvent::deleted(gif)).await.unwrap();
        assert_eq!(store.get_media("m1").await.unwrap().preview_path, None);
    }

    #[tokio::test]
    async fn test_event_for_removed_job_neither_packages_nor_previews() {
        let store = Arc::new(EncodingStore::in_memory());
        let notifier = Arc::new(RecordingNotifier::default());
        let hook = AggregateStatusHook::new(store.clone(), profiles(), notifier.clone());
        video(&store).await;

        for profile in [1, 6] {
            let mut job = EncodingJob::new("m1", profile);
            job.status = EncodingStatus::Success;
            job.artifact = Some(PathBuf::from(format!("/media/encoded/m1/gone.{profile}")));
            // never inserted: already superseded
            hook.on_event(&JobEvent::added(job, Some(EncodingStatus::Running)))
                .await
                .unwrap();
        }

        let media = store.get_media("m1").await.unwrap();
        assert_eq!(media.preview_path, None);
        assert_eq!(media.encoding_status, EncodingStatus::Pending);
        assert!(notifier.packaging.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_hook_ignores_missing_media_and_chunks() {
        let store = Arc::new(EncodingStore::in_memory());
        let hook = AggregateStatusHook::new(store.clone(), profiles(), Arc::new(RecordingNotifier::default()));
        hook.on_event(&JobEvent::added(EncodingJob::new("gone", 6), None))
            .await
            .unwrap();
        hook.on_event(&JobEvent::added(EncodingJob::new_chunk("gone", 6, "[\"a\"]", "a"), None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_encodings_info() {
        let store = EncodingStore::in_memory();
        let media = video(&store).await;
        let profiles = profiles();
        let root = Path::new("/media");

        let mut done = EncodingJob::new("m1", 5);
        done.status = EncodingStatus::Success;
        done.progress = 100;
        done.size_bytes = Some(2048);
        done.artifact = Some(PathBuf::from("/media/encoded/m1/clip.a.mp4"));
        done.total_run_time = 12;

        let gif = EncodingJob::new("m1", 1);

        // 1080p h264 (profile 6) still chunking
        let mut c1 = EncodingJob::new_chunk("m1", 6, "[\"a\",\"b\"]", "a");
        c1.progress = 100;
        let mut c2 = EncodingJob::new_chunk("m1", 6, "[\"a\",\"b\"]", "b");
        c2.progress = 50;

        let jobs = vec![done.clone(), gif, c1, c2];

        let brief = encodings_info(&media, &jobs, &profiles, root, false);
        assert_eq!(brief.len(), 1);
        let cell = &brief[&720]["h264"];
        assert_eq!(cell.url.as_deref(), Some("/media/encoded/m1/clip.a.mp4"));
        assert_eq!(cell.encoding_id.as_deref(), Some(done.id.as_str()));
        assert_eq!(cell.size, Some(2048));
        assert!(cell.logs.is_none());

        let full = encodings_info(&media, &jobs, &profiles, root, true);
        assert_eq!(full[&720]["h264"].total_run_time, Some(12));
        assert_eq!(full[&720]["h264"].retries, Some(0));
        let chunking = &full[&1080]["h264"];
        assert_eq!(chunking.progress, 75);
        assert!(chunking.encoding_id.is_none());
    }

    #[test]
    fn test_encodings_info_empty_for_non_video() {
        let media = SourceMedia::with_id("p", "doc", PathBuf::from("/media/original/doc.pdf"));
        let info = encodings_info(&media, &[EncodingJob::new("p", 6)], &profiles(), Path::new("/media"), true);
        assert!(info.is_empty());
    }

    #[test]
    fn test_artifact_url() {
        assert_eq!(
            artifact_url(Path::new("/srv/media"), Path::new("/srv/media/encoded/m1/a.mp4")).as_deref(),
            Some("/media/encoded/m1/a.mp4")
        );
        assert_eq!(artifact_url(Path::new("/srv/media"), Path::new("/tmp/a.mp4")), None);
    }
}
