use crate::commands::bump::{execute_bump, BumpArgs};
use crate::commands::extract_configs::{execute_extract_configs, ExtractConfigsArgs};
use crate::commands::run::{execute_run, RunArgs};
use crate::commands::update_plugins::{execute_update_plugins, UpdatePluginsArgs};
use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use mcprep_core::config::DEFAULT_BASE_DIR;
use mcprep_core::lifecycle::Role;
use mcprep_core::runtime::RuntimeKind;
use std::path::PathBuf;

/// Runtime selection options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum RuntimeOption {
    /// Docker runtime
    Docker,
    /// Podman runtime
    Podman,
}

impl From<RuntimeOption> for RuntimeKind {
    fn from(runtime: RuntimeOption) -> Self {
        match runtime {
            RuntimeOption::Docker => RuntimeKind::Docker,
            RuntimeOption::Podman => RuntimeKind::Podman,
        }
    }
}

/// Instance role options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum RoleOption {
    Build,
    Map,
}

impl From<RoleOption> for Role {
    fn from(role: RoleOption) -> Self {
        match role {
            RoleOption::Build => Role::Build,
            RoleOption::Map => Role::Map,
        }
    }
}

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum OutputFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log format options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON structured format
    Json,
}

/// Log level options
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    /// Error messages only
    Error,
    /// Warning and error messages
    Warn,
    /// Informational messages and above
    Info,
    /// Debug messages and above
    Debug,
    /// All messages including trace
    Trace,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Options for the provisioning run
#[derive(Debug, Clone, Args)]
pub struct RunOptions {
    /// Image tag (default: derived from the current git branch, MCPREP_IMAGE_TAG overrides)
    #[arg(long, value_name = "TAG")]
    pub image_tag: Option<String>,

    /// Container runtime to use (can be set via MCPREP_RUNTIME env var)
    #[arg(long, value_enum)]
    pub runtime: Option<RuntimeOption>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Provision the build and map servers, extract the world and patch configs
    Run {
        #[command(flatten)]
        options: RunOptions,
    },

    /// Replace a version string in the version files, then commit and tag it
    BumpVersion {
        /// Version currently in the files
        old: String,
        /// Version to write
        new: String,
        /// Only edit files; do not commit or tag
        #[arg(long)]
        no_git: bool,
    },

    /// Copy default config files out of plugin jars into per-plugin directories
    ExtractConfigs {
        /// Only seed the plugins of one role (default: both)
        #[arg(long, value_enum)]
        role: Option<RoleOption>,
    },

    /// Download or update the plugins listed in <base-dir>/plugins.ini
    UpdatePlugins {
        /// Only act on a single plugin
        #[arg(long, value_name = "PLUGIN")]
        only: Option<String>,
        /// Report available updates without installing them
        #[arg(long)]
        check: bool,
    },
}

#[derive(Debug, Parser)]
#[command(name = "mcprep")]
#[command(about = "Prepare Minecraft worlds and plugin configs in throwaway containers")]
#[command(
    long_about = "Prepare Minecraft worlds and plugin configs in throwaway containers.\n\n\
    Without a subcommand, `mcprep` runs the full pipeline: start the build and map servers, \
    wait for them, issue the world setup commands, copy the world out, patch plugin configs, \
    fix file ownership and remove the containers."
)]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Log format (text or json, defaults to text, can be set via MCPREP_LOG_FORMAT env var)
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Log level
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Directory holding build/, map/, world/ and mcprep.toml
    #[arg(long, global = true, value_name = "PATH", default_value = DEFAULT_BASE_DIR)]
    pub base_dir: PathBuf,

    /// Configuration file path (default: <base-dir>/mcprep.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Output format for results written to stdout
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(flatten)]
    pub run: RunOptions,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    pub async fn dispatch(self) -> Result<()> {
        let log_format = match self.log_format {
            Some(LogFormat::Text) => Some("text"),
            Some(LogFormat::Json) => Some("json"),
            None => None,
        };

        if std::env::var_os("MCPREP_LOG").is_none() && std::env::var_os("RUST_LOG").is_none() {
            let level = self.log_level.as_str();
            std::env::set_var("RUST_LOG", format!("mcprep={},mcprep_core={}", level, level));
        }
        mcprep_core::logging::init(log_format)?;
        tracing::debug!("CLI initialized with log level: {}", self.log_level.as_str());

        match self.command {
            None => {
                execute_run(RunArgs {
                    base_dir: self.base_dir,
                    config: self.config,
                    options: self.run,
                    output: self.output,
                })
                .await
            }
            Some(Commands::Run { options }) => {
                execute_run(RunArgs {
                    base_dir: self.base_dir,
                    config: self.config,
                    options,
                    output: self.output,
                })
                .await
            }
            Some(Commands::BumpVersion { old, new, no_git }) => {
                execute_bump(BumpArgs {
                    old,
                    new,
                    no_git,
                    base_dir: self.base_dir,
                    config: self.config,
                    output: self.output,
                })
                .await
            }
            Some(Commands::ExtractConfigs { role }) => execute_extract_configs(ExtractConfigsArgs {
                role: role.map(Role::from),
                base_dir: self.base_dir,
                output: self.output,
            }),
            Some(Commands::UpdatePlugins { only, check }) => {
                execute_update_plugins(UpdatePluginsArgs {
                    only,
                    check,
                    base_dir: self.base_dir,
                    output: self.output,
                })
                .await
            }
        }
    }
}
