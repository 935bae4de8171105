//! Bump-version command implementation

use crate::cli::OutputFormat;
use crate::ui::summary::render_bump;
use anyhow::{Context, Result};
use mcprep_core::bump::{bump_version, BumpRequest};
use mcprep_core::config::ConfigLoader;
use std::path::PathBuf;
use tracing::{debug, instrument, warn};

/// Bump-version command arguments
#[derive(Debug, Clone)]
pub struct BumpArgs {
    pub old: String,
    pub new: String,
    pub no_git: bool,
    pub base_dir: PathBuf,
    pub config: Option<PathBuf>,
    pub output: OutputFormat,
}

/// Execute the bump-version command
///
/// Version files come from the `[bump]` section and are resolved against the
/// current directory, which is also where git runs.
#[instrument(skip(args), fields(old = %args.old, new = %args.new))]
pub async fn execute_bump(args: BumpArgs) -> Result<()> {
    debug!("Bump args: {:?}", args);

    let config = ConfigLoader::load(&args.base_dir, args.config.as_deref())?;
    let repo_dir = std::env::current_dir().context("Failed to determine current directory")?;

    let outcome = bump_version(&BumpRequest {
        old: &args.old,
        new: &args.new,
        repo_dir: &repo_dir,
        files: &config.bump.files,
        skip_git: args.no_git,
    })
    .await?;

    if outcome.updated.is_empty() {
        warn!("No file contained version {}", args.old);
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => print!("{}", render_bump(&args.old, &args.new, &outcome)),
    }
    Ok(())
}
