//! Source media records.

use crate::jobs::{current_timestamp_ms, EncodingStatus};
use crate::probe::ProbeReport;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// Identifier of a source media record.
pub type MediaId = String;

/// Kind of media, as classified by the probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Video,
    Audio,
    Image,
    Pdf,
}

impl MediaType {
    /// Only video sources are transcoded; everything else is done after probing.
    pub fn needs_transcoding(&self) -> bool {
        matches!(self, MediaType::Video)
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Video => write!(f, "video"),
            MediaType::Audio => write!(f, "audio"),
            MediaType::Image => write!(f, "image"),
            MediaType::Pdf => write!(f, "pdf"),
        }
    }
}

/// An uploaded source file and the metadata extracted from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceMedia {
    pub id: MediaId,
    pub title: String,
    /// Location of the original upload inside the artifact store.
    pub source_path: PathBuf,
    /// `None` until probed, or when the probe rejected the file.
    pub media_type: Option<MediaType>,
    /// Duration in whole seconds (0 for images and pdfs).
    pub duration: u64,
    /// Video height in pixels.
    pub height: Option<u32>,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    /// Aggregate status derived from the media's mp4 encodings.
    pub encoding_status: EncodingStatus,
    /// Requested thumbnail position in seconds.
    pub thumbnail_time: Option<f64>,
    pub thumbnail_path: Option<PathBuf>,
    pub poster_path: Option<PathBuf>,
    /// Tiled frame sheet for seek previews.
    #[serde(default)]
    pub sprites_path: Option<PathBuf>,
    /// Animated preview produced by the gif profile.
    pub preview_path: Option<PathBuf>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SourceMedia {
    /// Creates an unprobed record with a fresh 12 character token as id.
    pub fn new(title: impl Into<String>, source_path: PathBuf) -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(12);
        Self::with_id(id, title, source_path)
    }

    pub fn with_id(id: impl Into<String>, title: impl Into<String>, source_path: PathBuf) -> Self {
        let now = current_timestamp_ms();
        Self {
            id: id.into(),
            title: title.into(),
            source_path,
            media_type: None,
            duration: 0,
            height: None,
            size_bytes: 0,
            checksum: None,
            encoding_status: EncodingStatus::Pending,
            thumbnail_time: None,
            thumbnail_path: None,
            poster_path: None,
            sprites_path: None,
            preview_path: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    /// Copies probe results onto the record.
    ///
    /// Image, pdf and audio sources need no transcoding, so their encoding
    /// status becomes success immediately.
    pub fn apply_probe(&mut self, report: &ProbeReport) {
        self.media_type = Some(report.media_type);
        self.duration = report.duration;
        self.height = report.height;
        self.size_bytes = report.size_bytes;
        self.checksum = report.checksum.clone();
        if !report.media_type.needs_transcoding() {
            self.encoding_status = EncodingStatus::Success;
        }
        self.touch();
    }

    /// Marks the record as rejected by the probe.
    pub fn mark_probe_failed(&mut self) {
        self.media_type = None;
        self.encoding_status = EncodingStatus::Fail;
        self.touch();
    }

    pub fn is_video(&self) -> bool {
        self.media_type == Some(MediaType::Video)
    }
}
