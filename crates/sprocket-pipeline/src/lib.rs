//! Sprocket Pipeline
//!
//! Staged execution of the external tool inside a scratch workspace:
//! fetch inputs, materialize them as files, run the tool under a deadline,
//! collect what it wrote to `output/`. The workspace outlives a successful
//! run so the caller can consume the artifacts before invoking cleanup.

use async_trait::async_trait;
use sprocket_exec::{
    run_with_timeout, truncate_output, ProcessOutcome, ScratchWorkspace, SpawnError,
    SpawnOptions, WorkspaceError,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::debug;

pub const OUTPUT_DIR_NAME: &str = "output";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to create scratch workspace: {0}")]
    Workspace(#[from] WorkspaceError),
    #[error("failed to stage workspace files: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to fetch input {index}: {cause}")]
    Fetch { index: usize, cause: anyhow::Error },
    #[error("unsupported input type \"{content_type}\"")]
    UnsupportedInputType { content_type: String },
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("tool timed out after {elapsed:?}")]
    Timeout {
        elapsed: Duration,
        stdout: String,
        stderr: String,
    },
    #[error("tool exited with code {exit_code}: {stdout}")]
    ToolError {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
}

/// One input to stage into the workspace.
#[derive(Debug, Clone)]
pub enum InputSource {
    Url(String),
    Bytes { content_type: String, data: Vec<u8> },
}

/// Supported output-format flags, each tied to the artifact extension the
/// tool produces for it. Unknown flags are rejected at parse time, before
/// any process is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Pdf,
    Midi,
    Mp3,
}

impl OutputFormat {
    pub fn parse(flag: &str) -> Option<Self> {
        match flag.to_lowercase().as_str() {
            "png" => Some(Self::Png),
            "pdf" => Some(Self::Pdf),
            "midi" => Some(Self::Midi),
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }

    /// The argument passed to the tool.
    pub fn flag(&self) -> &'static str {
        match self {
            Self::Png => "-fpng",
            Self::Pdf => "-fpdf",
            Self::Midi => "-fmidi",
            Self::Mp3 => "-fmp3",
        }
    }

    /// The file extension the tool writes for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Pdf => "pdf",
            Self::Midi => "mid",
            Self::Mp3 => "mp3",
        }
    }
}

#[derive(Debug)]
pub struct ExecutionRequest {
    pub inputs: Vec<InputSource>,
    pub formats: Vec<OutputFormat>,
    pub tool_args: Vec<String>,
    pub timeout: Duration,
}

pub struct FetchedInput {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Byte-source collaborator for input staging. Fetches carry no individual
/// timeout; only the tool invocation is time-bounded.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedInput>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedInput> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_lowercase())
            .unwrap_or_default();
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedInput {
            content_type,
            bytes,
        })
    }
}

/// Result of a successful run. Owns the scratch workspace: the artifact
/// paths stay valid until `cleanup` is invoked.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub tool_output: String,
    pub artifacts: Vec<PathBuf>,
    workspace: ScratchWorkspace,
}

impl ExecutionOutcome {
    pub fn workspace_path(&self) -> &Path {
        self.workspace.path()
    }

    /// Release the scratch workspace. Idempotent; never fails.
    pub async fn cleanup(&self) {
        self.workspace.release().await;
    }
}

pub struct ArtifactPipeline {
    fetcher: Arc<dyn Fetcher>,
    tool_binary: String,
    max_output_chars: usize,
    workspace_root: Option<PathBuf>,
}

impl ArtifactPipeline {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        tool_binary: impl Into<String>,
        max_output_chars: usize,
    ) -> Self {
        Self {
            fetcher,
            tool_binary: tool_binary.into(),
            max_output_chars,
            workspace_root: None,
        }
    }

    /// Create scratch workspaces under `root` instead of the system temp dir.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    /// Stage inputs, run the tool, collect output artifacts. Every failure
    /// path releases the workspace before returning; on success the
    /// workspace transfers to the returned outcome for deferred cleanup.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, PipelineError> {
        let workspace = match &self.workspace_root {
            Some(root) => ScratchWorkspace::acquire_in(root.clone()).await?,
            None => ScratchWorkspace::acquire().await?,
        };
        match self.run_in(&workspace, request).await {
            Ok((tool_output, artifacts)) => Ok(ExecutionOutcome {
                tool_output,
                artifacts,
                workspace,
            }),
            Err(e) => {
                workspace.release().await;
                Err(e)
            }
        }
    }

    async fn run_in(
        &self,
        workspace: &ScratchWorkspace,
        request: ExecutionRequest,
    ) -> Result<(String, Vec<PathBuf>), PipelineError> {
        let input_count = request.inputs.len();
        let mut jobs: Vec<tokio::task::JoinHandle<anyhow::Result<FetchedInput>>> =
            Vec::with_capacity(input_count);
        for source in request.inputs {
            match source {
                InputSource::Bytes { content_type, data } => {
                    jobs.push(tokio::spawn(async move {
                        Ok(FetchedInput {
                            content_type,
                            bytes: data,
                        })
                    }));
                }
                InputSource::Url(url) => {
                    let fetcher = self.fetcher.clone();
                    jobs.push(tokio::spawn(async move { fetcher.fetch(&url).await }));
                }
            }
        }

        let padding_digits = input_count.to_string().len();
        for (index, job) in jobs.into_iter().enumerate() {
            let fetched = job
                .await
                .map_err(|e| PipelineError::Fetch {
                    index,
                    cause: anyhow::Error::new(e),
                })?
                .map_err(|cause| PipelineError::Fetch { index, cause })?;
            let extension = extension_for(&fetched.content_type).ok_or_else(|| {
                PipelineError::UnsupportedInputType {
                    content_type: fetched.content_type.clone(),
                }
            })?;
            let filename = format!("{:0width$}.{}", index, extension, width = padding_digits);
            tokio::fs::write(workspace.path().join(&filename), &fetched.bytes).await?;
            debug!("staged input {} as {}", index, filename);
        }

        let output_dir = workspace.path().join(OUTPUT_DIR_NAME);
        tokio::fs::create_dir(&output_dir).await?;

        let mut args = vec![workspace.path().display().to_string()];
        args.extend(request.formats.iter().map(|f| f.flag().to_string()));
        args.extend(request.tool_args);

        let outcome = run_with_timeout(
            &self.tool_binary,
            &args,
            request.timeout,
            SpawnOptions {
                current_dir: Some(workspace.path().to_path_buf()),
                ..Default::default()
            },
        )
        .await?;

        match outcome {
            ProcessOutcome::TimedOut { stdout, stderr } => Err(PipelineError::Timeout {
                elapsed: request.timeout,
                stdout: truncate_output(&stdout, self.max_output_chars),
                stderr: truncate_output(&stderr, self.max_output_chars),
            }),
            ProcessOutcome::Completed {
                exit_code,
                stdout,
                stderr,
            } if exit_code != 0 => Err(PipelineError::ToolError {
                exit_code,
                stdout: truncate_output(&stdout, self.max_output_chars),
                stderr: truncate_output(&stderr, self.max_output_chars),
            }),
            ProcessOutcome::Completed { stdout, .. } => {
                let mut artifacts = Vec::new();
                let mut entries = tokio::fs::read_dir(&output_dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    artifacts.push(entry.path());
                }
                artifacts.sort();
                Ok((stdout, artifacts))
            }
        }
    }
}

fn extension_for(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/png" => Some("png"),
        "image/jpeg" => Some("jpeg"),
        "image/tiff" => Some("tiff"),
        "image/bmp" => Some("bmp"),
        _ => None,
    }
}
