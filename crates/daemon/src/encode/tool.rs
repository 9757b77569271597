//! Bounded execution of external tools (ffmpeg, ffprobe).
//!
//! Every invocation carries a timeout. A timed out process is killed and
//! reported as a failure, the same as a nonzero exit.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Error type for tool invocations
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{tool}: failed to spawn: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool}: timed out after {after:?}")]
    Timeout { tool: String, after: Duration },

    #[error("{tool}: exited with status {code:?}: {stderr}")]
    Failed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool}: I/O error: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured output of a finished tool.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// An external tool invocation with a time bound.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_timeout(&self) -> Duration {
        self.timeout
    }

    /// Space separated command line, recorded on jobs for operators.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn tool_name(&self) -> String {
        std::path::Path::new(&self.program)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.clone())
    }

    fn spawn(&self) -> Result<tokio::process::Child, ToolError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                tool: self.tool_name(),
                source,
            })
    }

    /// Runs the tool to completion, capturing stdout and stderr.
    pub async fn execute(&self) -> Result<ToolOutput, ToolError> {
        self.execute_streaming(|_| {}).await.map(|(mut out, stdout)| {
            out.stdout = stdout;
            out
        })
    }

    /// Runs the tool, handing each stdout line to `on_line` as it arrives.
    ///
    /// Returns the captured output together with the joined stdout lines.
    pub async fn execute_streaming<F>(&self, mut on_line: F) -> Result<(ToolOutput, String), ToolError>
    where
        F: FnMut(&str) + Send,
    {
        let tool = self.tool_name();
        let mut child = self.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let run = async {
            let mut captured = String::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    on_line(&line);
                    captured.push_str(&line);
                    captured.push('\n');
                }
            }
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, captured))
        };

        let (status, captured) = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(done)) => done,
            Ok(Err(source)) => return Err(ToolError::Io { tool, source }),
            Err(_) => {
                // dropping the child kills it
                return Err(ToolError::Timeout {
                    tool,
                    after: self.timeout,
                });
            }
        };

        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(ToolError::Failed {
                tool,
                code: status.code(),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok((
            ToolOutput {
                stdout: String::new(),
                stderr,
            },
            captured,
        ))
    }
}
