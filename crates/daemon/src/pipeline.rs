//! Media ingest and encode orchestration.
//!
//! Probe -> profile selection -> chunk planning -> dispatch. The pipeline never
//! waits for encodes; everything after dispatch happens through worker reports.

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::encode::{sprite_command, thumbnail_command};
use crate::error::PipelineError;
use crate::hooks::{Notifier, UserAction};
use crate::jobs::{EncodingStatus, JobId};
use crate::ledger::JobLedger;
use crate::media::{MediaId, MediaType, SourceMedia};
use crate::planner::plan_encodes;
use crate::probe::{ProbeError, Prober};
use crate::profiles::{select_profiles, EncodeProfile, ProfileId, Profiles};
use crate::state_machine::EncodingStateMachine;
use crate::status::{encodings_info, EncodingsInfo};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const THUMBNAIL_WIDTH: u32 = 640;

/// Knobs the pipeline reads from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub chunk_threshold_secs: u64,
    pub chunkize: bool,
    pub minimum_resolutions: Vec<u32>,
    pub ffmpeg: String,
    pub thumbnail_timeout: Duration,
    /// Sprites decode the whole video, so they get the encode budget.
    pub sprite_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            chunk_threshold_secs: cfg.pipeline.chunkize_video_duration,
            chunkize: cfg.pipeline.chunkize,
            minimum_resolutions: cfg.pipeline.minimum_resolutions_to_encode.clone(),
            ffmpeg: cfg.tools.ffmpeg.clone(),
            thumbnail_timeout: Duration::from_secs(cfg.tools.probe_timeout_secs),
            sprite_timeout: Duration::from_secs(cfg.tools.encode_timeout_secs),
        }
    }
}

/// What an encode request dispatched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncodeSummary {
    pub whole_jobs: Vec<JobId>,
    pub chunked_profiles: Vec<ProfileId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSummary {
    pub id: MediaId,
    pub title: String,
    pub media_type: Option<MediaType>,
    pub encoding_status: EncodingStatus,
    pub duration: u64,
}

impl From<&SourceMedia> for MediaSummary {
    fn from(m: &SourceMedia) -> Self {
        Self {
            id: m.id.clone(),
            title: m.title.clone(),
            media_type: m.media_type,
            encoding_status: m.encoding_status,
            duration: m.duration,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDetail {
    #[serde(flatten)]
    pub media: SourceMedia,
    pub encodings_info: EncodingsInfo,
}

pub struct Pipeline {
    ledger: Arc<JobLedger>,
    states: Arc<EncodingStateMachine>,
    dispatcher: Arc<Dispatcher>,
    profiles: Arc<Profiles>,
    prober: Prober,
    notifier: Arc<dyn Notifier>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        ledger: Arc<JobLedger>,
        states: Arc<EncodingStateMachine>,
        dispatcher: Arc<Dispatcher>,
        profiles: Arc<Profiles>,
        prober: Prober,
        notifier: Arc<dyn Notifier>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger,
            states,
            dispatcher,
            profiles,
            prober,
            notifier,
            settings,
        }
    }

    pub fn ledger(&self) -> &Arc<JobLedger> {
        &self.ledger
    }

    pub fn states(&self) -> &Arc<EncodingStateMachine> {
        &self.states
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn profiles(&self) -> &Arc<Profiles> {
        &self.profiles
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Brings a file into the store, probes it and starts its encodes.
    pub async fn ingest(&self, path: &Path, title: Option<String>, copy: bool) -> Result<SourceMedia, PipelineError> {
        let title = title.unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        let imported = self.ledger.artifacts.import_original(path, copy).await?;
        let media = self
            .ledger
            .store
            .insert_media(SourceMedia::new(title, imported.clone()))
            .await?;
        tracing::info!(media = %media.id, path = %path.display(), "ingesting media");

        let report = match self.prober.probe(&imported).await {
            Ok(report) => report,
            Err(ProbeError::Unsupported(reason)) => {
                let rejected = self.ledger.artifacts.quarantine(&imported).await?;
                self.ledger
                    .store
                    .update_media(&media.id, |m| {
                        m.mark_probe_failed();
                        m.source_path = rejected;
                    })
                    .await?;
                tracing::warn!(media = %media.id, %reason, "unsupported media rejected");
                return Err(PipelineError::UnsupportedMedia {
                    media_id: media.id,
                    reason,
                });
            }
            Err(e) => {
                self.ledger.store.update_media(&media.id, |m| m.mark_probe_failed()).await?;
                tracing::warn!(media = %media.id, error = %e, "probe failed");
                return Err(PipelineError::ProbeFailure {
                    media_id: media.id,
                    reason: e.to_string(),
                });
            }
        };

        let media = self
            .ledger
            .store
            .update_media(&media.id, |m| m.apply_probe(&report))
            .await?;

        match report.media_type {
            MediaType::Video => {
                if let Err(e) = self.make_thumbnails(&media).await {
                    tracing::warn!(media = %media.id, error = %e, "thumbnail extraction failed");
                }
                if let Err(e) = self.make_sprites(&media).await {
                    tracing::warn!(media = %media.id, error = %e, "sprite sheet failed");
                }
                self.encode(&media.id, None, false).await?;
            }
            MediaType::Image => {
                if let Err(e) = self.copy_image_thumbnails(&media).await {
                    tracing::warn!(media = %media.id, error = %e, "image thumbnail copy failed");
                }
            }
            MediaType::Audio | MediaType::Pdf => {}
        }

        let media = self.get_media(&media.id).await?;
        if let Err(e) = self.notifier.notify_users(&media, UserAction::MediaAdded).await {
            tracing::warn!(media = %media.id, error = %e, "user notification failed");
        }
        Ok(media)
    }

    /// Selects, plans and dispatches encodes for a video.
    ///
    /// Without `force`, profiles that already have a success or an encode in
    /// flight are left alone.
    pub async fn encode(
        &self,
        media_id: &str,
        profile_ids: Option<Vec<ProfileId>>,
        force: bool,
    ) -> Result<EncodeSummary, PipelineError> {
        let media = self.get_media(media_id).await?;
        if !media.is_video() {
            return Ok(EncodeSummary::default());
        }

        let mut candidates: Vec<EncodeProfile> = self
            .profiles
            .active()
            .into_iter()
            .filter(|p| profile_ids.as_ref().map_or(true, |ids| ids.contains(&p.id)))
            .collect();
        if !force {
            let existing = self.ledger.store.jobs_for_media(media_id).await;
            candidates.retain(|p| {
                !existing.iter().any(|j| {
                    j.profile_id == p.id
                        && (j.is_active() || (!j.chunk && j.status == EncodingStatus::Success))
                })
            });
        }

        let selected = select_profiles(&candidates, media.height, &self.settings.minimum_resolutions);
        let plan = plan_encodes(
            media.duration,
            selected,
            self.settings.chunk_threshold_secs,
            self.settings.chunkize,
        );

        let mut summary = EncodeSummary::default();
        let mut first_error = None;
        for s in &plan.whole {
            match self
                .dispatcher
                .dispatch(media_id, s.profile.id, None, s.priority, force)
                .await
            {
                Ok(id) => summary.whole_jobs.push(id),
                Err(e) => {
                    tracing::warn!(media = %media_id, profile = s.profile.id, error = %e, "dispatch failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        summary.chunked_profiles = plan.chunked.iter().map(|s| s.profile.id).collect();
        if let Err(e) = self
            .dispatcher
            .dispatch_chunking(media_id, summary.chunked_profiles.clone(), force)
            .await
        {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(summary),
        }
    }

    pub async fn get_media(&self, media_id: &str) -> Result<SourceMedia, PipelineError> {
        self.ledger
            .store
            .get_media(media_id)
            .await
            .ok_or_else(|| PipelineError::NotFound(format!("media {}", media_id)))
    }

    pub async fn list_media(&self) -> Vec<MediaSummary> {
        self.ledger.store.list_media().await.iter().map(MediaSummary::from).collect()
    }

    pub async fn media_info(&self, media_id: &str, full: bool) -> Result<MediaDetail, PipelineError> {
        let media = self.get_media(media_id).await?;
        let jobs = self.ledger.store.jobs_for_media(media_id).await;
        let info = encodings_info(&media, &jobs, &self.profiles, self.ledger.artifacts.root(), full);
        Ok(MediaDetail {
            media,
            encodings_info: info,
        })
    }

    /// Deletes a media with every job, artifact and derived file.
    pub async fn delete_media(&self, media_id: &str) -> Result<SourceMedia, PipelineError> {
        let media = self.get_media(media_id).await?;
        let artifacts = &self.ledger.artifacts;

        for job in self.ledger.store.jobs_for_media(media_id).await {
            self.ledger.discard_job(&job.id).await?;
        }
        for file in [
            Some(&media.source_path),
            media.thumbnail_path.as_ref(),
            media.poster_path.as_ref(),
            media.sprites_path.as_ref(),
            media.preview_path.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            artifacts.remove_file(file).await?;
        }
        for dir in [
            artifacts.encoded_dir(media_id),
            artifacts.chunks_dir(media_id),
            artifacts.hls_dir(media_id),
        ] {
            artifacts.remove_dir(&dir).await?;
        }

        self.ledger.store.remove_media(media_id).await?;
        tracing::info!(media = %media_id, "media deleted");
        Ok(media)
    }

    /// Deletes one encoding and its artifact.
    pub async fn delete_encoding(&self, job_id: &str) -> Result<(), PipelineError> {
        match self.ledger.delete_job(job_id).await? {
            Some(_) => Ok(()),
            None => Err(PipelineError::NotFound(format!("encoding {}", job_id))),
        }
    }

    async fn make_thumbnails(&self, media: &SourceMedia) -> Result<(), PipelineError> {
        let time = choose_thumbnail_time(media.thumbnail_time, media.duration, &mut rand::thread_rng());
        let dir = self.ledger.artifacts.thumbnails_dir();
        let thumbnail = thumbnail_path(&dir, &media.id, "jpg");
        let poster = thumbnail_path(&dir, &format!("{}_poster", media.id), "jpg");

        for (output, width) in [(&thumbnail, Some(THUMBNAIL_WIDTH)), (&poster, None)] {
            thumbnail_command(&self.settings.ffmpeg, &media.source_path, time, output, width)
                .timeout(self.settings.thumbnail_timeout)
                .execute()
                .await
                .map_err(|e| PipelineError::WorkerFailure(e.to_string()))?;
        }

        self.ledger
            .store
            .update_media(&media.id, |m| {
                m.thumbnail_time = Some(time);
                m.thumbnail_path = Some(thumbnail);
                m.poster_path = Some(poster);
            })
            .await?;
        Ok(())
    }

    async fn make_sprites(&self, media: &SourceMedia) -> Result<(), PipelineError> {
        let sprites = thumbnail_path(
            &self.ledger.artifacts.thumbnails_dir(),
            &format!("{}_sprites", media.id),
            "jpg",
        );
        sprite_command(&self.settings.ffmpeg, &media.source_path, media.duration, &sprites)
            .timeout(self.settings.sprite_timeout)
            .execute()
            .await
            .map_err(|e| PipelineError::WorkerFailure(e.to_string()))?;

        self.ledger
            .store
            .update_media(&media.id, |m| m.sprites_path = Some(sprites))
            .await?;
        Ok(())
    }

    async fn copy_image_thumbnails(&self, media: &SourceMedia) -> Result<(), PipelineError> {
        let dir = self.ledger.artifacts.thumbnails_dir();
        let ext = media
            .source_path
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_else(|| "jpg".to_string());
        let thumbnail = thumbnail_path(&dir, &media.id, &ext);
        let poster = thumbnail_path(&dir, &format!("{}_poster", media.id), &ext);
        for target in [&thumbnail, &poster] {
            tokio::fs::copy(&media.source_path, target)
                .await
                .map_err(|e| PipelineError::WorkerFailure(format!("copy thumbnail: {}", e)))?;
        }
        self.ledger
            .store
            .update_media(&media.id, |m| {
                m.thumbnail_path = Some(thumbnail);
                m.poster_path = Some(poster);
            })
            .await?;
        Ok(())
    }
}

/// Uses the requested time when it lies inside the video, otherwise a random
/// point in `[0, duration - 0.1]`.
pub fn choose_thumbnail_time<R: Rng>(requested: Option<f64>, duration: u64, rng: &mut R) -> f64 {
    let duration = duration as f64;
    match requested {
        Some(t) if t >= 0.0 && t < duration => t,
        _ => {
            let max = (duration - 0.1).max(0.0);
            if max > 0.0 {
                rng.gen_range(0.0..=max)
            } else {
                0.0
            }
        }
    }
}

fn thumbnail_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", stem, ext))
}
