//! Startup checks
//!
//! Preflight checks run before the daemon accepts work:
//! - ffprobe is invocable
//! - ffmpeg is invocable and at least version 4

use crate::config::Config;
use crate::encode::{ToolCommand, ToolError};
use std::time::Duration;
use thiserror::Error;

/// Oldest ffmpeg major version whose segment and concat muxers we rely on.
pub const MIN_FFMPEG_MAJOR: u32 = 4;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available; is it installed and in PATH? {source}")]
    ToolUnavailable {
        tool: String,
        #[source]
        source: ToolError,
    },

    #[error("FFmpeg version requirement not met: {0}")]
    FfmpegVersion(String),
}

/// Extracts the major version from `<tool> -version` output.
///
/// Handles plain (`ffmpeg version 6.1.1 ...`) and n-prefixed
/// (`ffmpeg version n7.0-12-g...`) version strings, for ffmpeg and ffprobe.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let line = version_output
        .lines()
        .map(str::to_lowercase)
        .find(|line| line.contains(" version "))?;

    let version_part = line.split(" version ").nth(1)?.split_whitespace().next()?.to_string();
    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

async fn version_output(tool: &str) -> Result<String, StartupError> {
    let output = ToolCommand::new(tool)
        .arg("-version")
        .timeout(VERSION_TIMEOUT)
        .execute()
        .await
        .map_err(|source| StartupError::ToolUnavailable {
            tool: tool.to_string(),
            source,
        })?;
    Ok(output.stdout)
}

pub async fn check_ffprobe_available(ffprobe: &str) -> Result<(), StartupError> {
    version_output(ffprobe).await?;
    Ok(())
}

pub async fn check_ffmpeg_version(ffmpeg: &str) -> Result<u32, StartupError> {
    let output = version_output(ffmpeg).await?;
    let major = parse_ffmpeg_version(&output).ok_or_else(|| {
        StartupError::FfmpegVersion(format!(
            "could not parse version from: {}",
            output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::FfmpegVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        )));
    }
    Ok(major)
}

pub async fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    check_ffprobe_available(&cfg.tools.ffprobe).await?;
    let major = check_ffmpeg_version(&cfg.tools.ffmpeg).await?;
    tracing::info!(ffmpeg = %cfg.tools.ffmpeg, major, "startup checks passed");
    Ok(())
}
