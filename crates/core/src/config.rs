//! Run configuration
//!
//! Settings come from `mcprep.toml` in the base directory (or an explicit
//! path). Every field has a default, so an absent default file yields the
//! stock pipeline. Environment variables prefixed with `MCPREP_` override a
//! few values after parsing, and the result is validated before use.
//!
//! ```toml
//! [runtime]
//! kind = "podman"
//!
//! [readiness]
//! interval_secs = 5
//! timeout_secs = 300
//!
//! [[patches]]
//! file = "map/plugins/BlueMap/core.conf"
//! [patches.operation]
//! format = "line-substitution"
//! pattern = '^\s*accept-download\s*[:=]'
//! replacement = "accept-download: true"
//! append_if_missing = true
//! ```

use crate::artifact::Artifact;
use crate::console::{default_rejection_markers, ConsoleConfig, MAX_COMMAND_LEN};
use crate::errors::{ConfigError, PrepError, Result};
use crate::lifecycle::{InstanceSpec, Role};
use crate::patch::{ConfigPatchOp, FieldAssignment, PatchOperation};
use crate::readiness::PollConfig;
use crate::runtime::{BindMount, PortBinding, RuntimeKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Name of the configuration file looked up in the base directory
pub const CONFIG_FILE_NAME: &str = "mcprep.toml";

/// Default base directory, relative to the working directory
pub const DEFAULT_BASE_DIR: &str = "minecraft-docker";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub kind: RuntimeKind,
    /// Explicit binary path; defaults to the kind's name on `PATH`
    pub path: Option<String>,
    pub stop_timeout_secs: u32,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            kind: RuntimeKind::Docker,
            path: None,
            stop_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageSettings {
    pub repository: String,
    /// Explicit tag; when unset the tag is derived from the git branch
    pub tag: Option<String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            repository: "minecraft-docker".to_string(),
            tag: None,
        }
    }
}

impl ImageSettings {
    /// `repository:tag`, using `latest` when no tag has been resolved
    pub fn reference(&self) -> String {
        format!(
            "{}:{}",
            self.repository,
            self.tag.as_deref().unwrap_or("latest")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RconSettings {
    pub host: String,
    pub port: u16,
    /// Empty means a random password is generated per run
    pub password: String,
    pub io_timeout_secs: u64,
    pub rejection_markers: Vec<String>,
}

impl Default for RconSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25575,
            password: String::new(),
            io_timeout_secs: 10,
            rejection_markers: default_rejection_markers(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            timeout_secs: 300,
        }
    }
}

/// One bind mount as written in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSetting {
    /// Host path, relative to the base directory unless absolute
    pub host: PathBuf,
    pub container: String,
}

/// Per-role container settings
///
/// Role-specific defaults apply only when the whole section is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSettings {
    /// Path whose existence means the server finished starting
    pub ready_path: String,
    #[serde(default)]
    pub mounts: Vec<MountSetting>,
    #[serde(default)]
    pub ports: Vec<PortBinding>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl InstanceSettings {
    fn build_default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("EULA".to_string(), "TRUE".to_string());
        Self {
            ready_path: "/mc/world/level.dat".to_string(),
            mounts: vec![MountSetting {
                host: PathBuf::from("build/plugins"),
                container: "/mc/plugins".to_string(),
            }],
            ports: vec![PortBinding {
                host: 25575,
                container: 25575,
            }],
            env,
        }
    }

    fn map_default() -> Self {
        let mut env = BTreeMap::new();
        env.insert("EULA".to_string(), "TRUE".to_string());
        Self {
            ready_path: "/mc/plugins/BlueMap/core.conf".to_string(),
            mounts: vec![MountSetting {
                host: PathBuf::from("map/plugins"),
                container: "/mc/plugins".to_string(),
            }],
            ports: Vec::new(),
            env,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancesSettings {
    #[serde(default = "InstanceSettings::build_default")]
    pub build: InstanceSettings,
    #[serde(default = "InstanceSettings::map_default")]
    pub map: InstanceSettings,
}

impl Default for InstancesSettings {
    fn default() -> Self {
        Self {
            build: InstanceSettings::build_default(),
            map: InstanceSettings::map_default(),
        }
    }
}

impl InstancesSettings {
    pub fn get(&self, role: Role) -> &InstanceSettings {
        match role {
            Role::Build => &self.build,
            Role::Map => &self.map,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionSettings {
    /// Host paths to normalize, relative to the base directory
    pub paths: Vec<PathBuf>,
    pub mode: u32,
    /// Owner override; the invoking user is used when unset
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            paths: vec![
                PathBuf::from("build"),
                PathBuf::from("map"),
                PathBuf::from("world"),
            ],
            mode: 0o644,
            uid: None,
            gid: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BumpSettings {
    /// Files in which the version string is replaced, relative to the repo root
    pub files: Vec<PathBuf>,
}

impl Default for BumpSettings {
    fn default() -> Self {
        Self {
            files: vec![PathBuf::from("Dockerfile")],
        }
    }
}

/// Full run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepConfig {
    pub runtime: RuntimeSettings,
    pub image: ImageSettings,
    pub rcon: RconSettings,
    pub readiness: ReadinessSettings,
    pub instances: InstancesSettings,
    /// Console commands issued against the build instance, in order
    pub commands: Vec<String>,
    pub artifacts: Vec<Artifact>,
    pub patches: Vec<ConfigPatchOp>,
    pub permissions: PermissionSettings,
    pub bump: BumpSettings,
}

impl Default for PrepConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeSettings::default(),
            image: ImageSettings::default(),
            rcon: RconSettings::default(),
            readiness: ReadinessSettings::default(),
            instances: InstancesSettings::default(),
            commands: default_commands(),
            artifacts: default_artifacts(),
            patches: default_patches(),
            permissions: PermissionSettings::default(),
            bump: BumpSettings::default(),
        }
    }
}

/// World setup issued to the build instance
pub fn default_commands() -> Vec<String> {
    [
        "gamerule doDaylightCycle false",
        "gamerule doWeatherCycle false",
        "gamerule doMobSpawning false",
        "gamerule doFireTick false",
        "gamerule mobGriefing false",
        "time set day",
        "weather clear",
        "mv create plotworld normal -g PlotSquared",
        "mv modify set gamemode creative plotworld",
        "mv modify set difficulty peaceful plotworld",
        "mv modify set monsters false plotworld",
        "save-all flush",
        "save-off",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect()
}

fn default_artifacts() -> Vec<Artifact> {
    vec![Artifact {
        role: Role::Build,
        source: "/mc/plotworld".to_string(),
        destination: PathBuf::from("world/plotworld"),
    }]
}

fn default_patches() -> Vec<ConfigPatchOp> {
    vec![
        ConfigPatchOp {
            file: PathBuf::from("build/plugins/Essentials/config.yml"),
            operation: PatchOperation::StructuredDocument {
                field: "disabled-commands".to_string(),
                assign: FieldAssignment::ExtendUnique(vec![
                    serde_yaml::Value::String("gamemode".to_string()),
                    serde_yaml::Value::String("customtext".to_string()),
                ]),
            },
        },
        ConfigPatchOp {
            file: PathBuf::from("map/plugins/BlueMap/core.conf"),
            operation: PatchOperation::LineSubstitution {
                pattern: r"^\s*accept-download\s*[:=]".to_string(),
                replacement: "accept-download: true".to_string(),
                append_if_missing: true,
            },
        },
    ]
}

fn validation(message: impl Into<String>) -> PrepError {
    PrepError::Config(ConfigError::Validation {
        message: message.into(),
    })
}

impl PrepConfig {
    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_secs(self.readiness.interval_secs),
            timeout: Duration::from_secs(self.readiness.timeout_secs),
        }
    }

    pub fn console_config(&self) -> ConsoleConfig {
        ConsoleConfig {
            host: self.rcon.host.clone(),
            port: self.rcon.port,
            password: self.rcon.password.clone(),
            io_timeout: Duration::from_secs(self.rcon.io_timeout_secs),
            rejection_markers: self.rcon.rejection_markers.clone(),
        }
    }

    /// Container spec for `role` with host paths resolved against `base_dir`
    pub fn instance_spec(&self, role: Role, base_dir: &Path) -> InstanceSpec {
        let settings = self.instances.get(role);
        InstanceSpec {
            role,
            image: self.image.reference(),
            mounts: settings
                .mounts
                .iter()
                .map(|m| BindMount {
                    host: resolve(base_dir, &m.host),
                    container: m.container.clone(),
                })
                .collect(),
            ports: settings.ports.clone(),
            env: settings.env.clone(),
        }
    }

    /// Apply `MCPREP_*` overrides using `lookup` to read variables
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(password) = lookup("MCPREP_RCON_PASSWORD") {
            debug!("RCON password overridden from environment");
            self.rcon.password = password;
        }
        if let Some(kind) = lookup("MCPREP_RUNTIME") {
            self.runtime.kind = kind
                .parse::<RuntimeKind>()
                .map_err(|e| validation(format!("MCPREP_RUNTIME: {}", e)))?;
        }
        if let Some(tag) = lookup("MCPREP_IMAGE_TAG").filter(|t| !t.trim().is_empty()) {
            self.image.tag = Some(tag);
        }
        Ok(())
    }

    /// Check invariants that serde cannot express
    pub fn validate(&self, base_dir: &Path) -> Result<()> {
        if self.readiness.interval_secs == 0 {
            return Err(validation("readiness.interval_secs must be greater than 0"));
        }
        if self.readiness.timeout_secs < self.readiness.interval_secs {
            return Err(validation(
                "readiness.timeout_secs must be at least readiness.interval_secs",
            ));
        }
        if self.rcon.port == 0 {
            return Err(validation("rcon.port must not be 0"));
        }
        if self.permissions.mode > 0o7777 {
            return Err(validation(format!(
                "permissions.mode {:o} is not a valid permission mode",
                self.permissions.mode
            )));
        }
        if self.image.repository.trim().is_empty() {
            return Err(validation("image.repository must not be empty"));
        }

        let mut host_mounts: HashMap<PathBuf, Role> = HashMap::new();
        for role in Role::ALL {
            let settings = self.instances.get(role);
            require_absolute(&format!("instances.{}.ready_path", role), &settings.ready_path)?;
            for mount in &settings.mounts {
                require_absolute(&format!("instances.{}.mounts", role), &mount.container)?;
                let host = resolve(base_dir, &mount.host);
                if let Some(owner) = host_mounts.insert(host.clone(), role) {
                    return Err(validation(format!(
                        "host path {} is mounted by both the {} and {} instances",
                        host.display(),
                        owner,
                        role
                    )));
                }
            }
        }

        for (index, command) in self.commands.iter().enumerate() {
            if command.trim().is_empty() {
                return Err(validation(format!("commands[{}] is empty", index)));
            }
            if command.len() > MAX_COMMAND_LEN {
                return Err(validation(format!(
                    "commands[{}] exceeds {} bytes",
                    index, MAX_COMMAND_LEN
                )));
            }
        }

        for artifact in &self.artifacts {
            require_absolute("artifacts.source", &artifact.source)?;
        }

        for op in &self.patches {
            match &op.operation {
                PatchOperation::LineSubstitution { pattern, .. } => {
                    regex::Regex::new(pattern).map_err(|e| {
                        validation(format!(
                            "patch for {}: invalid pattern: {}",
                            op.file.display(),
                            e
                        ))
                    })?;
                }
                PatchOperation::StructuredDocument { field, .. } => {
                    if field.split('.').any(|s| s.trim().is_empty()) {
                        return Err(validation(format!(
                            "patch for {}: invalid field path '{}'",
                            op.file.display(),
                            field
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

fn require_absolute(what: &str, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(validation(format!(
            "{} must be an absolute container path, got '{}'",
            what, path
        )));
    }
    Ok(())
}

/// Resolve a configured host path against the base directory
pub fn resolve(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load, apply environment overrides and validate
    ///
    /// An explicit path must exist. Without one, `<base_dir>/mcprep.toml` is
    /// used when present and the defaults otherwise.
    pub fn load(base_dir: &Path, explicit: Option<&Path>) -> Result<PrepConfig> {
        Self::load_with_env(base_dir, explicit, |name| std::env::var(name).ok())
    }

    /// [`ConfigLoader::load`] with an injectable environment lookup
    pub fn load_with_env<F>(base_dir: &Path, explicit: Option<&Path>, lookup: F) -> Result<PrepConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match explicit {
            Some(path) => Self::load_from_path(path)?,
            None => {
                let default_path = base_dir.join(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::load_from_path(&default_path)?
                } else {
                    debug!(
                        "No {} in {}, using defaults",
                        CONFIG_FILE_NAME,
                        base_dir.display()
                    );
                    PrepConfig::default()
                }
            }
        };

        config.apply_env_overrides(lookup)?;
        config.validate(base_dir)?;
        Ok(config)
    }

    /// Parse one TOML file
    pub fn load_from_path(path: &Path) -> Result<PrepConfig> {
        debug!("Loading configuration from {}", path.display());

        if !path.exists() {
            return Err(PrepError::Config(ConfigError::NotFound {
                path: path.display().to_string(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            debug!("Failed to read configuration file: {}", e);
            PrepError::Config(ConfigError::Io(e))
        })?;

        let config: PrepConfig = toml::from_str(&content).map_err(|e| {
            PrepError::Config(ConfigError::Parsing {
                message: format!("{}: {}", path.display(), e),
            })
        })?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
