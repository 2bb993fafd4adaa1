//! Sprocket Exec
//!
//! Timed child-process execution and scratch workspace lifecycle.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

const WORKSPACE_PREFIX: &str = "sprocket";

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("failed to write stdin payload to '{command}': {source}")]
    Stdin {
        command: String,
        source: std::io::Error,
    },
    #[error("failed to wait for '{command}': {source}")]
    Wait {
        command: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("failed to create scratch workspace at {path}: {source}")]
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Outcome of a timed child process. Timeout is a distinct variant rather
/// than an absent exit code, so callers cannot forget to handle it.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Completed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    /// The process was killed at the deadline. stdout/stderr hold whatever
    /// the process had emitted up to that point.
    TimedOut { stdout: String, stderr: String },
}

impl ProcessOutcome {
    pub fn stdout(&self) -> &str {
        match self {
            Self::Completed { stdout, .. } | Self::TimedOut { stdout, .. } => stdout,
        }
    }

    pub fn stderr(&self) -> &str {
        match self {
            Self::Completed { stderr, .. } | Self::TimedOut { stderr, .. } => stderr,
        }
    }
}

#[derive(Debug, Default)]
pub struct SpawnOptions {
    pub current_dir: Option<PathBuf>,
    /// Written to the child's stdin right after spawn; the pipe is closed
    /// once the payload has been flushed.
    pub stdin_payload: Option<Vec<u8>>,
}

/// Run a command with a wall-clock deadline measured from spawn.
///
/// stdout and stderr are drained by concurrent reader tasks so the child
/// never stalls on a full OS pipe buffer, and the stdin payload is written
/// by a concurrent task so the deadline also covers a child that never
/// drains it. On timeout the child is killed and reaped before the
/// captured output is returned.
pub async fn run_with_timeout(
    program: &str,
    args: &[String],
    deadline: Duration,
    options: SpawnOptions,
) -> Result<ProcessOutcome, SpawnError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &options.current_dir {
        command.current_dir(dir);
    }
    if options.stdin_payload.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }

    let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
        command: program.to_string(),
        source,
    })?;

    let stdin_task = options.stdin_payload.and_then(|payload| {
        child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // Dropping the handle closes the pipe so the child sees EOF.
                stdin.write_all(&payload).await
            })
        })
    });

    let stdout_task = child.stdout.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    });
    let stderr_task = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    });

    let exit_code = match timeout(deadline, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(|source| SpawnError::Wait {
                command: program.to_string(),
                source,
            })?;
            Some(status.code().unwrap_or(-1))
        }
        Err(_) => {
            debug!("'{}' exceeded {:?}, killing", program, deadline);
            let _ = child.start_kill();
            let _ = child.wait().await;
            None
        }
    };

    let stdout = collect_pipe(stdout_task).await;
    let stderr = collect_pipe(stderr_task).await;

    if let Some(handle) = stdin_task {
        // A child may exit without draining its stdin; that is not a failure.
        if let Ok(Err(source)) = handle.await {
            if source.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(SpawnError::Stdin {
                    command: program.to_string(),
                    source,
                });
            }
        }
    }

    match exit_code {
        Some(exit_code) => Ok(ProcessOutcome::Completed {
            exit_code,
            stdout,
            stderr,
        }),
        None => Ok(ProcessOutcome::TimedOut { stdout, stderr }),
    }
}

async fn collect_pipe(task: Option<tokio::task::JoinHandle<Vec<u8>>>) -> String {
    match task {
        Some(handle) => {
            let bytes = handle.await.unwrap_or_default();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        None => String::new(),
    }
}

pub fn truncate_output(content: &str, max_chars: usize) -> String {
    let mut chars = content.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}\n...[truncated]", truncated)
    } else {
        truncated
    }
}

/// An isolated temporary directory for one pipeline invocation.
///
/// Every acquire must be paired with exactly one `release`; release is
/// idempotent and swallows filesystem errors since it runs on cleanup and
/// failure paths.
#[derive(Debug)]
pub struct ScratchWorkspace {
    path: PathBuf,
    released: AtomicBool,
}

impl ScratchWorkspace {
    pub async fn acquire() -> Result<Self, WorkspaceError> {
        Self::acquire_in(std::env::temp_dir()).await
    }

    /// Create the workspace under a caller-chosen root instead of the
    /// system temp dir.
    pub async fn acquire_in(root: impl Into<PathBuf>) -> Result<Self, WorkspaceError> {
        let path = root
            .into()
            .join(format!("{}-{}", WORKSPACE_PREFIX, uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| WorkspaceError::Create {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            released: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
                warn!(
                    "failed to remove scratch workspace {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}
