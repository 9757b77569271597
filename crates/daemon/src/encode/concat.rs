//! Lossless concatenation of encoded chunks.

use crate::encode::ffmpeg::{concat_command, concat_list};
use crate::encode::tool::ToolError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Joins encoded chunk files, in the given order, into one output file.
#[async_trait]
pub trait Concatenator: Send + Sync {
    /// Returns the tool output (for the job logs) on success.
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<String, ToolError>;
}

/// Stream-copy concatenation through ffmpeg's concat demuxer.
#[derive(Debug, Clone)]
pub struct FfmpegConcat {
    ffmpeg: String,
    temp_dir: PathBuf,
    timeout: Duration,
}

impl FfmpegConcat {
    pub fn new(ffmpeg: impl Into<String>, temp_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            temp_dir,
            timeout,
        }
    }
}

#[async_trait]
impl Concatenator for FfmpegConcat {
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<String, ToolError> {
        let io_err = |source| ToolError::Io {
            tool: "concat".to_string(),
            source,
        };

        tokio::fs::create_dir_all(&self.temp_dir).await.map_err(io_err)?;
        let list = self.temp_dir.join(format!("concat-{}.txt", Uuid::new_v4().simple()));
        tokio::fs::write(&list, concat_list(inputs)).await.map_err(io_err)?;

        let result = concat_command(&self.ffmpeg, &list, output)
            .timeout(self.timeout)
            .execute()
            .await;

        if let Err(e) = tokio::fs::remove_file(&list).await {
            tracing::debug!(list = %list.display(), error = %e, "could not remove concat list");
        }

        let out = result?;
        Ok(format!("{}{}", out.stdout, out.stderr))
    }
}

/// Byte-level concatenation, for tests that must not depend on ffmpeg.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ByteConcat {
    pub fail: bool,
}

#[cfg(test)]
#[async_trait]
impl Concatenator for ByteConcat {
    async fn concat(&self, inputs: &[PathBuf], output: &Path) -> Result<String, ToolError> {
        if self.fail {
            return Err(ToolError::Failed {
                tool: "concat".to_string(),
                code: Some(1),
                stderr: "forced failure".to_string(),
            });
        }
        let mut joined = Vec::new();
        for input in inputs {
            let bytes = tokio::fs::read(input).await.map_err(|source| ToolError::Io {
                tool: "concat".to_string(),
                source,
            })?;
            joined.extend_from_slice(&bytes);
        }
        tokio::fs::write(output, joined).await.map_err(|source| ToolError::Io {
            tool: "concat".to_string(),
            source,
        })?;
        Ok(format!("joined {} files", inputs.len()))
    }
}
