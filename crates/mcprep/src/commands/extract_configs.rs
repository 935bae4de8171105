//! Extract-configs command implementation
//!
//! Seeds per-plugin config directories from the jars in
//! `<base-dir>/<role>/plugins`.

use crate::cli::OutputFormat;
use crate::ui::summary::render_seed;
use anyhow::{bail, Result};
use mcprep_core::lifecycle::Role;
use mcprep_core::plugin_configs::{seed_plugin_configs, SeedSummary};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};

/// Extract-configs command arguments
#[derive(Debug, Clone)]
pub struct ExtractConfigsArgs {
    /// Restrict to one role; both when unset
    pub role: Option<Role>,
    pub base_dir: PathBuf,
    pub output: OutputFormat,
}

/// Seed result for one role's plugin directory
#[derive(Debug, Serialize)]
pub struct RoleSeed {
    pub role: Role,
    pub plugins_dir: PathBuf,
    #[serde(flatten)]
    pub summary: SeedSummary,
}

pub fn execute_extract_configs(args: ExtractConfigsArgs) -> Result<()> {
    debug!("Extract-configs args: {:?}", args);

    let roles: Vec<Role> = match args.role {
        Some(role) => vec![role],
        None => Role::ALL.to_vec(),
    };

    let mut results = Vec::with_capacity(roles.len());
    for role in roles {
        let plugins_dir = args.base_dir.join(role.as_str()).join("plugins");
        let summary = seed_plugin_configs(&plugins_dir)?;
        info!(
            "Seeded {} plugin(s) for the {} instance",
            summary.seeded.len(),
            role
        );
        results.push(RoleSeed {
            role,
            plugins_dir,
            summary,
        });
    }

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
        OutputFormat::Text => {
            for result in &results {
                print!("{}", render_seed(result));
            }
        }
    }

    let failed: usize = results.iter().map(|r| r.summary.failed.len()).sum();
    if failed > 0 {
        bail!("{} plugin jar(s) could not be seeded", failed);
    }
    Ok(())
}
