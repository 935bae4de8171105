//! Run command implementation
//!
//! Loads the configuration, resolves the image tag and drives the
//! provisioning pipeline against the real container runtime and console.

use crate::cli::{OutputFormat, RunOptions};
use crate::signals::shutdown_signal;
use crate::ui::summary::render_report;
use anyhow::{Context, Result};
use mcprep_core::config::ConfigLoader;
use mcprep_core::console::RconConnector;
use mcprep_core::git::resolve_image_tag;
use mcprep_core::pipeline::{ensure_rcon_password, Pipeline};
use mcprep_core::runtime::CliRuntime;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Exit code used when the run was interrupted by a signal
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Run command arguments
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub base_dir: PathBuf,
    pub config: Option<PathBuf>,
    pub options: RunOptions,
    pub output: OutputFormat,
}

/// A run that completed without panicking but did not succeed
#[derive(Debug)]
pub enum RunFailed {
    /// The report lists at least one stage failure
    Stages { failures: usize },
    /// A shutdown signal arrived before the run finished
    Interrupted,
}

impl RunFailed {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunFailed::Stages { .. } => 1,
            RunFailed::Interrupted => INTERRUPTED_EXIT_CODE,
        }
    }
}

impl std::fmt::Display for RunFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunFailed::Stages { failures } => write!(f, "run finished with {} failure(s)", failures),
            RunFailed::Interrupted => f.write_str("run interrupted"),
        }
    }
}

impl std::error::Error for RunFailed {}

/// Map a finished run to the command outcome; an interruption wins
fn run_outcome(interrupted: bool, failures: usize) -> std::result::Result<(), RunFailed> {
    if interrupted {
        Err(RunFailed::Interrupted)
    } else if failures > 0 {
        Err(RunFailed::Stages { failures })
    } else {
        Ok(())
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    Ok(cwd.join(path))
}

/// Execute the run command
#[instrument(skip(args))]
pub async fn execute_run(args: RunArgs) -> Result<()> {
    debug!("Run args: {:?}", args);

    // Bind mount sources must be absolute
    let base_dir = absolute(&args.base_dir)?;
    let mut config = ConfigLoader::load(&base_dir, args.config.as_deref())?;

    if let Some(runtime) = args.options.runtime {
        config.runtime.kind = runtime.into();
    }
    if let Some(tag) = args.options.image_tag {
        config.image.tag = Some(tag);
    }

    let repo_dir = if base_dir.is_dir() {
        base_dir.clone()
    } else {
        std::env::current_dir().context("Failed to determine current directory")?
    };
    let tag = resolve_image_tag(config.image.tag.as_deref(), &repo_dir).await;
    config.image.tag = Some(tag);
    ensure_rcon_password(&mut config);

    let runtime = CliRuntime::new(config.runtime.kind, config.runtime.path.clone());
    let connector = RconConnector::new(config.console_config());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let pipeline = Pipeline::new(&runtime, connector, config, &base_dir).with_cancel(cancel_rx);
    let run_id = pipeline.run_id().to_string();
    info!("Run id: {}", run_id);

    // The pipeline keeps running after a signal until its containers are removed
    let listener = tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                warn!("Shutdown requested; removing containers of run {}", run_id);
                let _ = cancel_tx.send(true);
            }
            Err(e) => warn!("Cannot listen for shutdown signals: {}", e),
        }
    });
    let report = pipeline.run().await;
    listener.abort();

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_report(&report)),
    }

    run_outcome(report.interrupted, report.failures.len()).map_err(Into::into)
}
