//! Bounded external command execution.
//!
//! Runs one command in a working directory, capturing stdout and stderr
//! interleaved (line granularity, arrival order) into a single stream with a
//! hard size cap, and enforcing a wall-clock timeout. A non-zero exit is a
//! build failure carrying the captured output; a timeout kills the process.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::errors::BuildFailure;

use super::models::CommandSpec;

pub const TRUNCATION_MARKER: &str = "\n[output truncated: capture limit reached]\n";

/// How long to keep draining pipes after the child is gone. A child that
/// hands its pipes to a long-lived grandchild must not stall the build.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Result of a command that ran to completion with exit code zero.
#[derive(Debug)]
pub struct CommandOutput {
    /// stdout and stderr, interleaved in arrival order.
    pub output: String,
    pub exit_code: i32,
}

/// Shared capture buffer with a hard cap. Once the cap is hit, further
/// output is dropped and a single truncation marker is recorded.
struct CaptureBuf {
    buf: String,
    cap: usize,
    truncated: bool,
}

impl CaptureBuf {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
            truncated: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.buf.len() + line.len() + 1 > self.cap {
            self.truncated = true;
            self.buf.push_str(TRUNCATION_MARKER);
            return;
        }
        self.buf.push_str(line);
        self.buf.push('\n');
    }
}

#[derive(Clone)]
pub struct CommandRunner {
    output_cap: usize,
}

impl CommandRunner {
    pub fn new(output_cap: usize) -> Self {
        Self { output_cap }
    }

    /// Run `spec` in `dir`, waiting at most `limit`. The child is killed on
    /// timeout and on drop, so a failed run never outlives its build.
    pub async fn run(
        &self,
        spec: &CommandSpec,
        dir: &Path,
        limit: Duration,
    ) -> Result<CommandOutput, BuildFailure> {
        let command = spec.to_string();
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BuildFailure::Command {
                command: command.clone(),
                exit_code: -1,
                output: format!("Failed to spawn `{}`: {}\n", spec.program, e),
            })?;

        let sink = Arc::new(Mutex::new(CaptureBuf::new(self.output_cap)));
        let stdout_task = child.stdout.take().map(|s| drain(s, Arc::clone(&sink)));
        let stderr_task = child.stderr.take().map(|s| drain(s, Arc::clone(&sink)));

        let status = match timeout(limit, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(BuildFailure::Command {
                    command,
                    exit_code: -1,
                    output: format!("Failed to wait for command: {}\n", e),
                });
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!("Failed to kill timed-out command `{}`: {}", command, e);
                }
                let _ = timeout(DRAIN_GRACE, join_drains(stdout_task, stderr_task)).await;
                let output = sink.lock().await.buf.clone();
                return Err(BuildFailure::Timeout {
                    command,
                    timeout_secs: limit.as_secs(),
                    output,
                });
            }
        };

        // The pipes may still hold buffered output after exit; drain before
        // reading the capture.
        let _ = timeout(DRAIN_GRACE, join_drains(stdout_task, stderr_task)).await;
        let output = sink.lock().await.buf.clone();
        let exit_code = status.code().unwrap_or(-1);

        if status.success() {
            Ok(CommandOutput { output, exit_code })
        } else {
            Err(BuildFailure::Command {
                command,
                exit_code,
                output,
            })
        }
    }
}

fn drain(
    stream: impl AsyncRead + Unpin + Send + 'static,
    sink: Arc<Mutex<CaptureBuf>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.lock().await.push_line(&line);
        }
    })
}

async fn join_drains(
    stdout_task: Option<tokio::task::JoinHandle<()>>,
    stderr_task: Option<tokio::task::JoinHandle<()>>,
) {
    if let Some(task) = stdout_task {
        let _ = task.await;
    }
    if let Some(task) = stderr_task {
        let _ = task.await;
    }
}
