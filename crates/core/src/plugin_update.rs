//! Plugin downloads and updates
//!
//! For every enabled registry entry and each of its targets the updater
//! downloads the plugin's jar into `<base>/temp`, compares the `plugin.yml`
//! version with the jar already installed in `<base>/<target>/plugins`, and
//! replaces the installed jar when they differ. Old jars are found through
//! the entry's cleanup globs. The temp directory is removed afterwards and
//! the registry remembers the URL each plugin was installed from.

use crate::errors::{PrepError, Result};
use crate::http::HttpClient;
use crate::lifecycle::Role;
use crate::patch::{ConfigPatchOp, ConfigPatcher, PatchOperation, PatchOutcome};
use crate::plugin_configs::{is_plain_name, plugin_version};
use crate::plugin_registry::{PluginEntry, PluginRegistry};
use crate::plugin_sources::{latest_url, SourceIndex, SOURCES_FILE};
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

const TEMP_DIR: &str = "temp";
const PLUGINS_DIR: &str = "plugins";

/// What happened to one plugin in one target directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateStatus {
    /// No earlier version was present
    Installed { version: String },
    Updated { from: String, to: String },
    UpToDate { version: String },
    /// Check-only run: this would be installed or updated
    Available { from: Option<String>, to: String },
    /// Neither a registry URL nor an upstream release was found
    NoUrl,
    Failed { reason: String },
}

impl UpdateStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginUpdate {
    pub plugin: String,
    pub target: Role,
    pub url: Option<String>,
    #[serde(flatten)]
    pub status: UpdateStatus,
}

/// Anchored regex for a file-name glob with `*` and `?`
fn glob_regex(pattern: &str) -> Option<Regex> {
    let mut expr = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str("[^/]*"),
            '?' => expr.push_str("[^/]"),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}

/// Files directly inside `dir` whose names match any of `globs`, sorted
pub fn matching_jars(dir: &Path, globs: &[String]) -> Vec<PathBuf> {
    let patterns: Vec<Regex> = globs.iter().filter_map(|g| glob_regex(g)).collect();
    if patterns.is_empty() {
        return Vec::new();
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut jars: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| patterns.iter().any(|p| p.is_match(name)))
        })
        .collect();
    jars.sort();
    jars
}

/// Last path segment of a download URL, without query or fragment
fn jar_file_name(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let name = path.trim_end_matches('/').rsplit('/').next()?;
    Some(name.to_string()).filter(|n| n.ends_with(".jar") && is_plain_name(n))
}

/// BlueMap refuses to render until its resource download is accepted
fn accept_bluemap_download(plugins_dir: &Path) {
    let op = ConfigPatchOp {
        file: PathBuf::from("BlueMap/core.conf"),
        operation: PatchOperation::LineSubstitution {
            pattern: r"^\s*accept-download\s*[:=]".to_string(),
            replacement: "accept-download: true".to_string(),
            append_if_missing: true,
        },
    };
    match ConfigPatcher::new(plugins_dir).apply(&op) {
        Ok(PatchOutcome::Applied) => info!("Set accept-download in {}/BlueMap/core.conf", plugins_dir.display()),
        Ok(PatchOutcome::Unchanged) => debug!("BlueMap download already accepted"),
        Ok(PatchOutcome::Skipped) => debug!("No BlueMap core.conf yet; the map instance generates it"),
        Err(e) => warn!("Could not patch BlueMap core.conf: {}", e),
    }
}

/// Installs and updates registry plugins below `base_dir`
pub struct PluginUpdater<H: HttpClient> {
    client: H,
    base_dir: PathBuf,
    check_only: bool,
}

impl<H: HttpClient> PluginUpdater<H> {
    pub fn new(client: H, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            base_dir: base_dir.into(),
            check_only: false,
        }
    }

    /// Report what would change without touching the plugin directories
    pub fn check_only(mut self, check_only: bool) -> Self {
        self.check_only = check_only;
        self
    }

    fn temp_dir(&self) -> PathBuf {
        self.base_dir.join(TEMP_DIR)
    }

    fn plugins_dir(&self, target: Role) -> PathBuf {
        self.base_dir.join(target.as_str()).join(PLUGINS_DIR)
    }

    /// Process the enabled entries (or only `only`) and save the registry
    #[instrument(skip(self, registry), fields(base = %self.base_dir.display()))]
    pub async fn update(
        &self,
        registry: &mut PluginRegistry,
        only: Option<&str>,
    ) -> Result<Vec<PluginUpdate>> {
        let selected = registry.select(only)?;
        let sources = if selected.iter().any(|e| e.enabled && e.prefer_newer) {
            SourceIndex::load(&self.base_dir.join(SOURCES_FILE))?
        } else {
            SourceIndex::default()
        };

        let temp_dir = self.temp_dir();
        std::fs::create_dir_all(&temp_dir).map_err(|e| PrepError::io(&temp_dir, e))?;

        let mut results = Vec::new();
        for entry in &selected {
            if !entry.enabled {
                debug!("Plugin {} is disabled", entry.name);
                continue;
            }
            for target in &entry.targets {
                let update = self.update_target(entry, *target, &sources).await;
                match &update.status {
                    UpdateStatus::Failed { reason } => {
                        warn!("{}/{}: {}", target, entry.name, reason)
                    }
                    status => info!("{}/{}: {:?}", target, entry.name, status),
                }
                if matches!(
                    update.status,
                    UpdateStatus::Installed { .. } | UpdateStatus::Updated { .. }
                ) {
                    if let Some(url) = &update.url {
                        registry.record_url(&entry.name, url);
                    }
                }
                results.push(update);
            }
        }

        match std::fs::remove_dir_all(&temp_dir) {
            Ok(()) => debug!("Removed temp dir {}", temp_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", temp_dir.display(), e),
        }
        if !self.check_only {
            registry.save()?;
        }
        Ok(results)
    }

    async fn update_target(&self, entry: &PluginEntry, target: Role, sources: &SourceIndex) -> PluginUpdate {
        let url = if entry.prefer_newer {
            latest_url(&self.client, sources, &entry.name, entry.prefer_beta).await
        } else {
            entry.url.clone()
        };
        let status = match &url {
            None => UpdateStatus::NoUrl,
            Some(url) => self
                .install(entry, target, url)
                .await
                .unwrap_or_else(|e| UpdateStatus::Failed {
                    reason: e.to_string(),
                }),
        };
        PluginUpdate {
            plugin: entry.name.clone(),
            target,
            url,
            status,
        }
    }

    async fn install(&self, entry: &PluginEntry, target: Role, url: &str) -> Result<UpdateStatus> {
        let Some(jar_name) = jar_file_name(url) else {
            return Ok(UpdateStatus::Failed {
                reason: format!("cannot derive a jar file name from {}", url),
            });
        };
        let plugins_dir = self.plugins_dir(target);
        std::fs::create_dir_all(&plugins_dir).map_err(|e| PrepError::io(&plugins_dir, e))?;

        let downloaded = self.temp_dir().join(&jar_name);
        debug!("Downloading {} to {}", url, downloaded.display());
        let body = self.client.get(url).await?;
        std::fs::write(&downloaded, body).map_err(|e| PrepError::io(&downloaded, e))?;

        let Some(new_version) = plugin_version(&downloaded) else {
            return Ok(UpdateStatus::Failed {
                reason: format!("{} is not a plugin jar with a version", jar_name),
            });
        };

        let installed = matching_jars(&plugins_dir, &entry.cleanup_globs);
        let current = installed.first().and_then(|jar| plugin_version(jar));
        if current.as_deref() == Some(new_version.as_str()) {
            debug!("Versions match [{}], no update required", new_version);
            return Ok(UpdateStatus::UpToDate {
                version: new_version,
            });
        }
        if self.check_only {
            return Ok(UpdateStatus::Available {
                from: current,
                to: new_version,
            });
        }

        for old in &installed {
            std::fs::remove_file(old).map_err(|e| PrepError::io(old, e))?;
            debug!("Removed {}", old.display());
        }
        let destination = plugins_dir.join(&jar_name);
        std::fs::rename(&downloaded, &destination).map_err(|e| PrepError::io(&destination, e))?;
        info!("Installed {} {} into {}", entry.name, new_version, plugins_dir.display());

        if entry.name == "bluemap" {
            accept_bluemap_download(&plugins_dir);
        }

        Ok(match current {
            Some(from) => UpdateStatus::Updated {
                from,
                to: new_version,
            },
            None => UpdateStatus::Installed {
                version: new_version,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::mock::MockHttpClient;
    use crate::plugin_registry::REGISTRY_FILE;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn jar_bytes(name: &str, version: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("plugin.yml", SimpleFileOptions::default())
            .unwrap();
        writer
            .write_all(format!("name: {}\nversion: '{}'\n", name, version).as_bytes())
            .unwrap();
        writer.finish().unwrap().into_inner()
    }

    fn registry(base: &Path, content: &str) -> PluginRegistry {
        let path = base.join(REGISTRY_FILE);
        std::fs::write(&path, content).unwrap();
        PluginRegistry::load(&path).unwrap()
    }

    const BLUEMAP: &str = "\
[plugin:bluemap]
enabled = true
targets = map
cleanup_globs = bluemap-*.jar
url = https://cdn.example/bluemap-5.3-spigot.jar
";

    #[test]
    fn test_glob_matching() {
        let temp = TempDir::new().unwrap();
        for name in ["bluemap-5.2-spigot.jar", "BlueMap-5.1.jar", "bluemap.txt", "other-1.0.jar"] {
            std::fs::write(temp.path().join(name), "x").unwrap();
        }
        let globs = vec!["bluemap-*.jar".to_string(), "BlueMap-?.?.jar".to_string()];
        let found: Vec<String> = matching_jars(temp.path(), &globs)
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(found, vec!["BlueMap-5.1.jar", "bluemap-5.2-spigot.jar"]);
        assert!(matching_jars(temp.path(), &[]).is_empty());
    }

    #[test]
    fn test_jar_file_name() {
        assert_eq!(
            jar_file_name("https://cdn.example/a/EssentialsX-2.20.1.jar?raw=1").as_deref(),
            Some("EssentialsX-2.20.1.jar")
        );
        assert_eq!(jar_file_name("https://cdn.example/download"), None);
        assert_eq!(jar_file_name("https://cdn.example/plugins/"), None);
    }

    #[tokio::test]
    async fn test_fresh_install_records_url_and_accepts_bluemap_download() {
        let temp = TempDir::new().unwrap();
        let base = temp.path();
        std::fs::create_dir_all(base.join("map/plugins/BlueMap")).unwrap();
        std::fs::write(
            base.join("map/plugins/BlueMap/core.conf"),
            "accept-download: false\nrender-thread-count: 1\n",
        )
        .unwrap();
        let content = BLUEMAP.replace("url = https://cdn.example/bluemap-5.3-spigot.jar\n", "prefer_newer = true\n");
        let mut registry = registry(base, &content);
        std::fs::write(
            base.join(SOURCES_FILE),
            r#"{"bluemap": ["https://modrinth.com/plugin/bluemap"]}"#,
        )
        .unwrap();

        let client = MockHttpClient::new();
        client.respond(
            "https://api.modrinth.com/v2/project/bluemap/version",
            r#"[{"version_number": "5.3", "files": [{"url": "https://cdn.example/bluemap-5.3-spigot.jar"}]}]"#,
        );
        client.respond("https://cdn.example/bluemap-5.3-spigot.jar", jar_bytes("BlueMap", "5.3"));

        let updater = PluginUpdater::new(&client, base);
        let results = updater.update(&mut registry, None).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].target, Role::Map);
        assert_eq!(
            results[0].status,
            UpdateStatus::Installed {
                version: "5.3".to_string()
            }
        );
        assert!(base.join("map/plugins/bluemap-5.3-spigot.jar").is_file());
        assert!(!base.join("build/plugins/bluemap-5.3-spigot.jar").exists());
        assert!(!base.join(TEMP_DIR).exists());
        assert_eq!(
            std::fs::read_to_string(base.join("map/plugins/BlueMap/core.conf")).unwrap(),
            "accept-download: true\nrender-thread-count: 1\n"
        );
        let saved = std::fs::read_to_string(base.join(REGISTRY_FILE)).unwrap();
        assert!(saved.contains("url = https://cdn.example/bluemap-5.3-spigot.jar"));
    }

    #[tokio::test]
    async fn test_newer_version_replaces_old_jars() {
        let temp = TempDir::new().unwrap();
        let base = temp.path();
        std::fs::create_dir_all(base.join("map/plugins")).unwrap();
        std::fs::write(base.join("map/plugins/bluemap-5.2-spigot.jar"), jar_bytes("BlueMap", "5.2")).unwrap();
        std::fs::write(base.join("map/plugins/Chunky-1.3.jar"), jar_bytes("Chunky", "1.3")).unwrap();
        let mut registry = registry(base, BLUEMAP);

        let client = MockHttpClient::new();
        client.respond("https://cdn.example/bluemap-5.3-spigot.jar", jar_bytes("BlueMap", "5.3"));

        let results = PluginUpdater::new(&client, base)
            .update(&mut registry, Some("BlueMap"))
            .await
            .unwrap();

        assert_eq!(
            results[0].status,
            UpdateStatus::Updated {
                from: "5.2".to_string(),
                to: "5.3".to_string()
            }
        );
        assert!(!base.join("map/plugins/bluemap-5.2-spigot.jar").exists());
        assert!(base.join("map/plugins/bluemap-5.3-spigot.jar").is_file());
        assert!(base.join("map/plugins/Chunky-1.3.jar").is_file());
        // URL unchanged, so the registry file is left alone
        assert_eq!(std::fs::read_to_string(base.join(REGISTRY_FILE)).unwrap(), BLUEMAP);
    }

    #[tokio::test]
    async fn test_same_version_and_check_only_leave_plugins() {
        let temp = TempDir::new().unwrap();
        let base = temp.path();
        std::fs::create_dir_all(base.join("map/plugins")).unwrap();
        let old = base.join("map/plugins/bluemap-5.2-spigot.jar");
        std::fs::write(&old, jar_bytes("BlueMap", "5.3")).unwrap();
        let mut registry = registry(base, BLUEMAP);

        let client = MockHttpClient::new();
        client.respond("https://cdn.example/bluemap-5.3-spigot.jar", jar_bytes("BlueMap", "5.3"));
        let results = PluginUpdater::new(&client, base)
            .update(&mut registry, None)
            .await
            .unwrap();
        assert_eq!(
            results[0].status,
            UpdateStatus::UpToDate {
                version: "5.3".to_string()
            }
        );
        assert!(old.is_file());

        std::fs::write(&old, jar_bytes("BlueMap", "5.2")).unwrap();
        let results = PluginUpdater::new(&client, base)
            .check_only(true)
            .update(&mut registry, None)
            .await
            .unwrap();
        assert_eq!(
            results[0].status,
            UpdateStatus::Available {
                from: Some("5.2".to_string()),
                to: "5.3".to_string()
            }
        );
        assert!(old.is_file());
        assert!(!base.join("map/plugins/bluemap-5.3-spigot.jar").exists());
    }

    #[tokio::test]
    async fn test_failures_are_reported_per_target() {
        let temp = TempDir::new().unwrap();
        let base = temp.path();
        let mut registry = registry(
            base,
            "\
[plugin:essentials]
enabled = true
targets = build, map
url = https://cdn.example/EssentialsX-2.20.1.jar

[plugin:nourl]
enabled = true

[plugin:disabled]
url = https://cdn.example/Disabled-1.0.jar
",
        );
        let client = MockHttpClient::new();
        client.respond("https://cdn.example/EssentialsX-2.20.1.jar", b"not a zip".to_vec());

        let results = PluginUpdater::new(&client, base)
            .update(&mut registry, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results[0].status.is_failure());
        assert_eq!(results[1].target, Role::Map);
        assert!(results[1].status.is_failure());
        assert_eq!(results[2].plugin, "nourl");
        assert_eq!(results[2].status, UpdateStatus::NoUrl);
        assert!(!client
            .requested()
            .iter()
            .any(|u| u.contains("Disabled")));
        assert!(!base.join("build/plugins/EssentialsX-2.20.1.jar").exists());
        assert!(!base.join(TEMP_DIR).exists());
    }

    #[tokio::test]
    async fn test_unknown_only_is_an_error() {
        let temp = TempDir::new().unwrap();
        let mut registry = registry(temp.path(), BLUEMAP);
        let err = PluginUpdater::new(MockHttpClient::new(), temp.path())
            .update(&mut registry, Some("dynmap"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("dynmap"));
    }
}
