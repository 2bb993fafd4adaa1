//! Sprocket CLI
//!
//! Command-line interface for the Sprocket tool pipeline: run the external
//! tool over staged inputs and keep a per-user history of published
//! artifacts so later invocations can say `$LAST`.

mod logging;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use sprocket_config::Config;
use sprocket_history::{expand_references, HistoryKey, HistoryStore};
use sprocket_pipeline::{
    ArtifactPipeline, ExecutionRequest, HttpFetcher, InputSource, OutputFormat, PipelineError,
};
use sprocket_storage::KvStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::info;

const DB_FILE: &str = "sprocket.db";
const ARTIFACTS_DIR: &str = "artifacts";

#[derive(Parser)]
#[command(name = "sprocket")]
#[command(about = "Bounded external-tool pipeline with per-user result history", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (takes precedence over the config file)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tool over the given inputs (URLs or $LAST tokens)
    Run {
        /// Tenant the invocation belongs to
        #[arg(long, default_value = "local")]
        tenant: String,

        /// User whose history records the result
        #[arg(long, default_value = "local")]
        user: String,

        /// Requested output formats (png, pdf, midi, mp3)
        #[arg(long = "format")]
        formats: Vec<String>,

        /// Tool timeout in seconds (config default when omitted)
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Extra tool arguments as one shell-quoted string
        #[arg(long, default_value = "")]
        args: String,

        /// Input URLs or $LAST / $LAST-<n> reference tokens
        inputs: Vec<String>,
    },

    /// Show recorded result history
    History {
        #[arg(long, default_value = "local")]
        tenant: String,

        #[arg(long, default_value = "local")]
        user: String,

        /// Look back this many invocations instead of listing everything
        #[arg(long)]
        offset: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref().map(Path::new))?;
    let level = effective_log_level(cli.log_level.as_deref(), config.core.log_level.as_deref());
    logging::init_logging(&level)?;

    match cli.command {
        Commands::Run {
            tenant,
            user,
            formats,
            timeout_secs,
            args,
            inputs,
        } => run_command(&config, tenant, user, formats, timeout_secs, args, inputs).await,
        Commands::History {
            tenant,
            user,
            offset,
        } => history_command(&config, tenant, user, offset).await,
    }
}

/// Command-line flag beats the config file; "info" when neither is set.
fn effective_log_level(flag: Option<&str>, configured: Option<&str>) -> String {
    flag.or(configured).unwrap_or("info").to_string()
}

fn open_history(config: &Config) -> Result<HistoryStore> {
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
    let kv = KvStore::open(data_dir.join(DB_FILE))?;
    HistoryStore::new(Arc::new(Mutex::new(kv)), config.history.capacity)
        .map_err(|e| anyhow!("invalid history capacity: {}", e))
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    config: &Config,
    tenant: String,
    user: String,
    formats: Vec<String>,
    timeout_secs: Option<u64>,
    args: String,
    inputs: Vec<String>,
) -> Result<()> {
    let store = open_history(config)?;
    let key = HistoryKey::new(tenant, user);

    let mut parsed_formats = Vec::with_capacity(formats.len());
    for flag in &formats {
        let format = OutputFormat::parse(flag)
            .ok_or_else(|| anyhow!("unknown output format \"{}\"", flag))?;
        parsed_formats.push(format);
    }

    let tool_args = shlex::split(&args).ok_or_else(|| anyhow!("invalid tool argument syntax"))?;

    let resolved = expand_references(&store, &key, &inputs).await?;
    if resolved.is_empty() {
        bail!("nothing to process");
    }

    let pipeline = ArtifactPipeline::new(
        Arc::new(HttpFetcher::new()),
        config.tool.binary.clone(),
        config.tool.max_output_chars,
    );
    let timeout = Duration::from_secs(timeout_secs.unwrap_or(config.tool.timeout_secs));

    let outcome = match pipeline
        .execute(ExecutionRequest {
            inputs: resolved.into_iter().map(InputSource::Url).collect(),
            formats: parsed_formats,
            tool_args,
            timeout,
        })
        .await
    {
        Ok(outcome) => outcome,
        Err(PipelineError::Timeout {
            elapsed,
            stdout,
            stderr,
        }) => {
            print_diagnostics(&stdout, &stderr);
            bail!("tool timed out after {:?}", elapsed);
        }
        Err(PipelineError::ToolError {
            exit_code,
            stdout,
            stderr,
        }) => {
            print_diagnostics(&stdout, &stderr);
            bail!("tool exited with code {}", exit_code);
        }
        Err(e) => return Err(e.into()),
    };

    // Publish before cleanup: recorded references must outlive the
    // scratch workspace.
    let published = match publish_artifacts(config, &outcome.artifacts).await {
        Ok(published) => published,
        Err(e) => {
            outcome.cleanup().await;
            return Err(e);
        }
    };

    if !outcome.tool_output.trim().is_empty() {
        println!("{}", outcome.tool_output.trim());
    }
    for path in &published {
        println!("{}", path.display());
    }

    outcome.cleanup().await;

    let refs: Vec<String> = published.iter().map(|p| p.display().to_string()).collect();
    // One-shot process: wait for the history write instead of detaching.
    let persisted = store.record_result_set(&key, refs).await;
    let _ = persisted.await;

    info!("run finished with {} artifact(s)", published.len());
    Ok(())
}

fn print_diagnostics(stdout: &str, stderr: &str) {
    if !stdout.trim().is_empty() {
        eprintln!("{}", stdout.trim());
    }
    if !stderr.trim().is_empty() {
        eprintln!("{}", stderr.trim());
    }
}

async fn history_command(
    config: &Config,
    tenant: String,
    user: String,
    offset: Option<usize>,
) -> Result<()> {
    let store = open_history(config)?;
    let key = HistoryKey::new(tenant, user);

    match offset {
        Some(offset) => match store.resolve_last(&key, offset).await {
            Some(refs) => {
                for reference in refs {
                    println!("{}", reference);
                }
                Ok(())
            }
            None => bail!("no result recorded at offset {}", offset),
        },
        None => {
            let sets = store.chronological(&key).await;
            if sets.is_empty() {
                println!("(no history)");
            }
            for (index, set) in sets.iter().enumerate() {
                println!("{}: {}", index, set.join(" "));
            }
            Ok(())
        }
    }
}

async fn publish_artifacts(config: &Config, artifacts: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let dir = config.data_dir()?.join(ARTIFACTS_DIR);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create artifacts dir {}", dir.display()))?;

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();

    let mut published = Vec::with_capacity(artifacts.len());
    for (index, artifact) in artifacts.iter().enumerate() {
        let name = artifact
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("artifact-{}", index));
        let target = dir.join(format!("{}-{}", stamp, name));
        tokio::fs::copy(artifact, &target)
            .await
            .with_context(|| format!("failed to publish {}", artifact.display()))?;
        published.push(target);
    }
    Ok(published)
}

#[cfg(test)]
mod tests {
    use super::effective_log_level;

    #[test]
    fn log_level_flag_beats_config() {
        assert_eq!(effective_log_level(Some("debug"), Some("warn")), "debug");
        assert_eq!(effective_log_level(None, Some("warn")), "warn");
        assert_eq!(effective_log_level(None, None), "info");
    }
}
