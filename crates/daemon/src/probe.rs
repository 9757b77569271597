//! Source media probing.
//!
//! Images and pdfs are recognised by their magic bytes. Everything else goes
//! through ffprobe and is classified as video or audio from its streams.
//! A file ffprobe cannot read, or one without audio or video streams, is
//! unsupported. A readable file whose duration or dimensions are missing is a
//! metadata failure.

use crate::artifacts::sha256_file;
use crate::encode::tool::{ToolCommand, ToolError};
use crate::media::MediaType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Not a video, audio, image or pdf. Never retried.
    #[error("unsupported media: {0}")]
    Unsupported(String),

    /// Recognised media whose metadata could not be extracted.
    #[error("metadata extraction failed: {0}")]
    Metadata(String),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Classification and metadata of a probed source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeReport {
    pub media_type: MediaType,
    /// Whole seconds: rounded for video, truncated for audio, 0 otherwise.
    pub duration: u64,
    pub height: Option<u32>,
    pub size_bytes: u64,
    pub checksum: Option<String>,
}

/// What ffprobe found in a file.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSummary {
    /// Height of the first real video stream (cover art excluded).
    pub video_height: Option<u32>,
    pub has_video: bool,
    pub has_audio: bool,
    pub duration_secs: Option<f64>,
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub height: Option<u32>,
        pub duration: Option<String>,
        pub disposition: Option<Disposition>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Disposition {
        #[serde(default)]
        pub attached_pic: u8,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Recognises media that needs no ffprobe from its leading bytes.
pub fn sniff_media_type(header: &[u8]) -> Option<MediaType> {
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

    if header.starts_with(b"%PDF") {
        Some(MediaType::Pdf)
    } else if header.starts_with(PNG)
        || header.starts_with(&[0xff, 0xd8, 0xff])
        || header.starts_with(b"GIF87a")
        || header.starts_with(b"GIF89a")
        || (header.len() >= 12 && &header[0..4] == b"RIFF" && &header[8..12] == b"WEBP")
    {
        Some(MediaType::Image)
    } else {
        None
    }
}

/// Parses ffprobe JSON output into a stream summary.
pub fn parse_ffprobe_output(json_str: &str) -> Result<StreamSummary, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput = serde_json::from_str(json_str)
        .map_err(|e| ProbeError::Metadata(format!("unreadable ffprobe output: {}", e)))?;

    let mut summary = StreamSummary {
        video_height: None,
        has_video: false,
        has_audio: false,
        duration_secs: None,
    };
    let mut stream_duration = None;

    for stream in ffprobe.streams.unwrap_or_default() {
        match stream.codec_type.as_deref() {
            Some("video") => {
                let cover_art = stream
                    .disposition
                    .as_ref()
                    .map(|d| d.attached_pic == 1)
                    .unwrap_or(false);
                if cover_art || summary.has_video {
                    continue;
                }
                summary.has_video = true;
                summary.video_height = stream.height.filter(|h| *h > 0);
                stream_duration = stream.duration.as_deref().and_then(parse_secs);
            }
            Some("audio") => {
                summary.has_audio = true;
                if stream_duration.is_none() {
                    stream_duration = stream.duration.as_deref().and_then(parse_secs);
                }
            }
            _ => {}
        }
    }

    summary.duration_secs = ffprobe
        .format
        .and_then(|f| f.duration)
        .as_deref()
        .and_then(parse_secs)
        .or(stream_duration);

    Ok(summary)
}

fn parse_secs(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0)
}

/// Classifies a stream summary into a report.
pub fn classify(summary: &StreamSummary, size_bytes: u64) -> Result<ProbeReport, ProbeError> {
    if summary.has_video {
        let duration = summary
            .duration_secs
            .ok_or_else(|| ProbeError::Metadata("video without duration".to_string()))?;
        let height = summary
            .video_height
            .ok_or_else(|| ProbeError::Metadata("video without height".to_string()))?;
        return Ok(ProbeReport {
            media_type: MediaType::Video,
            duration: duration.round() as u64,
            height: Some(height),
            size_bytes,
            checksum: None,
        });
    }

    if summary.has_audio {
        let duration = summary
            .duration_secs
            .ok_or_else(|| ProbeError::Metadata("audio without duration".to_string()))?;
        return Ok(ProbeReport {
            media_type: MediaType::Audio,
            duration: duration.trunc() as u64,
            height: None,
            size_bytes,
            checksum: None,
        });
    }

    Err(ProbeError::Unsupported("no audio or video streams".to_string()))
}

/// Runs the probe against files on disk.
#[derive(Debug, Clone)]
pub struct Prober {
    ffprobe: String,
    timeout: Duration,
}

impl Prober {
    pub fn new(ffprobe: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            timeout,
        }
    }

    pub async fn probe(&self, path: &Path) -> Result<ProbeReport, ProbeError> {
        let size_bytes = tokio::fs::metadata(path).await?.len();
        if size_bytes == 0 {
            return Err(ProbeError::Unsupported("empty file".to_string()));
        }

        let mut header = [0u8; 16];
        let mut file = tokio::fs::File::open(path).await?;
        let read = file.read(&mut header).await?;
        drop(file);

        let mut report = match sniff_media_type(&header[..read]) {
            Some(media_type) => ProbeReport {
                media_type,
                duration: 0,
                height: None,
                size_bytes,
                checksum: None,
            },
            None => {
                let summary = self.run_ffprobe(path).await?;
                classify(&summary, size_bytes)?
            }
        };

        report.checksum = Some(sha256_file(path).await?);
        tracing::debug!(
            path = %path.display(),
            media_type = %report.media_type,
            duration = report.duration,
            height = ?report.height,
            "probed"
        );
        Ok(report)
    }

    async fn run_ffprobe(&self, path: &Path) -> Result<StreamSummary, ProbeError> {
        let output = ToolCommand::new(&self.ffprobe)
            .args(["-v", "quiet", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(path.to_string_lossy().to_string())
            .timeout(self.timeout)
            .execute()
            .await;

        match output {
            Ok(out) => parse_ffprobe_output(&out.stdout),
            // ffprobe ran and could not make sense of the file
            Err(ToolError::Failed { stderr, .. }) => Err(ProbeError::Unsupported(if stderr.is_empty() {
                "not recognised by ffprobe".to_string()
            } else {
                stderr
            })),
            Err(e) => Err(e.into()),
        }
    }
}
