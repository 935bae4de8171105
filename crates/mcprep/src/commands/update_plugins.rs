//! Update-plugins command implementation
//!
//! Installs or updates the jars listed in `<base-dir>/plugins.ini`.

use crate::cli::OutputFormat;
use crate::ui::summary::render_updates;
use anyhow::{bail, Result};
use mcprep_core::http::ReqwestClient;
use mcprep_core::plugin_registry::{PluginRegistry, REGISTRY_FILE};
use mcprep_core::plugin_update::PluginUpdater;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, instrument};

/// Per-request limit for API lookups and jar downloads
const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// Update-plugins command arguments
#[derive(Debug, Clone)]
pub struct UpdatePluginsArgs {
    pub only: Option<String>,
    pub check: bool,
    pub base_dir: PathBuf,
    pub output: OutputFormat,
}

#[instrument(skip(args))]
pub async fn execute_update_plugins(args: UpdatePluginsArgs) -> Result<()> {
    debug!("Update-plugins args: {:?}", args);

    let mut registry = PluginRegistry::load(&args.base_dir.join(REGISTRY_FILE))?;
    let client = ReqwestClient::with_timeout(Some(HTTP_TIMEOUT))?;
    let updates = PluginUpdater::new(client, &args.base_dir)
        .check_only(args.check)
        .update(&mut registry, args.only.as_deref())
        .await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&updates)?),
        OutputFormat::Text => print!("{}", render_updates(&updates)),
    }

    let failed = updates.iter().filter(|u| u.status.is_failure()).count();
    if failed > 0 {
        bail!("{} plugin update(s) failed", failed);
    }
    Ok(())
}
