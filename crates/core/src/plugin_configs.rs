//! Plugin config seeding
//!
//! Copies the default configuration files bundled inside plugin jars into a
//! per-plugin directory next to the jar, so they can be edited and patched
//! before the server ever starts. The directory is named after the `name`
//! declared in the jar's `plugin.yml`.

use crate::errors::{PrepError, Result};
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Extensions treated as configuration files
pub const CONFIG_EXTENSIONS: [&str; 4] = ["yml", "conf", "json", "txt"];

/// Plugins that generate their own configuration on first start
const SELF_CONFIGURING: [&str; 1] = ["bluemap"];

/// Jar descriptors, not configuration
const DESCRIPTORS: [&str; 3] = ["plugin.yml", "paper-plugin.yml", "bungee.yml"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeededPlugin {
    pub jar: PathBuf,
    pub name: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub seeded: Vec<SeededPlugin>,
    /// Plugins that were deliberately left alone
    pub skipped: Vec<String>,
    /// Jars that could not be read, with the reason
    pub failed: Vec<(PathBuf, String)>,
}

/// Seed config directories for every jar directly inside `plugins_dir`
///
/// A missing directory yields an empty summary.
#[instrument(fields(dir = %plugins_dir.display()))]
pub fn seed_plugin_configs(plugins_dir: &Path) -> Result<SeedSummary> {
    let mut summary = SeedSummary::default();

    let entries = match std::fs::read_dir(plugins_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} does not exist, nothing to seed", plugins_dir.display());
            return Ok(summary);
        }
        Err(e) => return Err(PrepError::io(plugins_dir, e)),
    };

    let mut jars: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "jar"))
        .collect();
    jars.sort();

    for jar in jars {
        let name = plugin_name(&jar);
        if SELF_CONFIGURING.contains(&name.to_lowercase().as_str()) {
            debug!("Skipping {} ({})", name, jar.display());
            summary.skipped.push(name);
            continue;
        }

        match seed_one(&jar, &name, plugins_dir) {
            Ok(files) => {
                info!("Seeded {} config files for {}", files.len(), name);
                summary.seeded.push(SeededPlugin { jar, name, files });
            }
            Err(e) => {
                warn!("Failed to seed configs from {}: {}", jar.display(), e);
                summary.failed.push((jar, e.to_string()));
            }
        }
    }

    Ok(summary)
}

/// Declared plugin name, or the jar file name up to the first `-`
///
/// A declared name that is not a single plain path component is ignored.
pub fn plugin_name(jar: &Path) -> String {
    match declared_name(jar) {
        Some(name) if is_plain_name(&name) => return name,
        Some(name) => warn!(
            "Ignoring unsafe plugin name {:?} declared by {}",
            name,
            jar.display()
        ),
        None => {}
    }
    let stem = jar
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    stem.split('-').next().unwrap_or_default().to_string()
}

/// True when `name` names exactly one entry directly inside a directory
pub(crate) fn is_plain_name(name: &str) -> bool {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name.contains(':') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Version declared in the jar's `plugin.yml`
pub fn plugin_version(jar: &Path) -> Option<String> {
    let doc = read_descriptor(jar)?;
    let version = match doc.get("version")? {
        serde_yaml::Value::String(v) => v.trim().to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(version).filter(|v| !v.is_empty())
}

fn read_descriptor(jar: &Path) -> Option<serde_yaml::Value> {
    let file = File::open(jar).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    let mut descriptor = archive.by_name("plugin.yml").ok()?;
    let mut content = String::new();
    descriptor.read_to_string(&mut content).ok()?;
    serde_yaml::from_str(&content).ok()
}

fn declared_name(jar: &Path) -> Option<String> {
    read_descriptor(jar)?
        .get("name")
        .and_then(|n| n.as_str())
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}

fn is_config_entry(entry_name: &str) -> bool {
    if DESCRIPTORS.contains(&entry_name) {
        return false;
    }
    Path::new(entry_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| CONFIG_EXTENSIONS.contains(&ext))
}

fn clear_subdirectories(dir: &Path) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| PrepError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| PrepError::io(dir, e))?;
        let file_type = entry.file_type().map_err(|e| PrepError::io(entry.path(), e))?;
        if file_type.is_dir() {
            std::fs::remove_dir_all(entry.path()).map_err(|e| PrepError::io(entry.path(), e))?;
            debug!("Cleared {}", entry.path().display());
        }
    }
    Ok(())
}

/// Extract config entries of `jar` flattened into `<plugins_dir>/<name>`
fn seed_one(jar: &Path, name: &str, plugins_dir: &Path) -> Result<Vec<String>> {
    let target = plugins_dir.join(name);
    std::fs::create_dir_all(&target).map_err(|e| PrepError::io(&target, e))?;
    clear_subdirectories(&target)?;

    let file = File::open(jar).map_err(|e| PrepError::io(jar, e))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| PrepError::precondition(format!("{} is not a valid jar: {}", jar.display(), e)))?;

    let mut written = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| PrepError::precondition(format!("{}: {}", jar.display(), e)))?;
        if entry.is_dir() || !is_config_entry(entry.name()) {
            continue;
        }
        let Some(base_name) = Path::new(entry.name())
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
        else {
            continue;
        };

        let dest = target.join(&base_name);
        let mut out = File::create(&dest).map_err(|e| PrepError::io(&dest, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| PrepError::io(&dest, e))?;
        written.push(base_name);
    }

    Ok(written)
}
