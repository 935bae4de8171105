//! Plugin registry (`plugins.ini`)
//!
//! One `[plugin:<name>]` section per managed plugin, plus optional defaults
//! in `[general]`:
//!
//! ```ini
//! [general]
//! prefer_beta = false
//! prefer_newer = false
//!
//! [plugin:bluemap]
//! enabled = true
//! targets = map
//! cleanup_globs = bluemap-*.jar, BlueMap-*.jar
//! url = https://github.com/BlueMap-Minecraft/BlueMap/releases/download/v5.3/bluemap-5.3-spigot.jar
//! ```
//!
//! Keys are case-insensitive and may use `=` or `:`. Booleans accept
//! `1/yes/true/on` and `0/no/false/off`. Saving rewrites the file in the same
//! `key = value` layout; comments are not preserved.

use crate::errors::{PluginError, PrepError, Result};
use crate::lifecycle::Role;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const REGISTRY_FILE: &str = "plugins.ini";

const GENERAL_SECTION: &str = "general";
const PLUGIN_PREFIX: &str = "plugin:";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct IniSection {
    name: String,
    entries: Vec<(String, String)>,
}

impl IniSection {
    fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }
}

/// Ordered sections of ordered `key = value` pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct IniDocument {
    sections: Vec<IniSection>,
}

impl IniDocument {
    fn parse(content: &str) -> std::result::Result<Self, String> {
        let mut doc = Self::default();
        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                if doc.section(name).is_some() {
                    return Err(format!("line {}: duplicate section [{}]", idx + 1, name));
                }
                doc.sections.push(IniSection {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                continue;
            }

            let Some(section) = doc.sections.last_mut() else {
                return Err(format!("line {}: entry outside of a section", idx + 1));
            };
            let Some(split) = line.find(['=', ':']) else {
                return Err(format!("line {}: expected 'key = value'", idx + 1));
            };
            let key = line[..split].trim().to_lowercase();
            let value = line[split + 1..].trim().to_string();
            section.set(&key, value);
        }
        Ok(doc)
    }

    fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name == name)
    }

    fn section_mut(&mut self, name: &str) -> Option<&mut IniSection> {
        self.sections.iter_mut().find(|s| s.name == name)
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&format!("[{}]\n", section.name));
            for (key, value) in &section.entries {
                out.push_str(&format!("{} = {}\n", key, value));
            }
            out.push('\n');
        }
        out
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// One managed plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginEntry {
    /// Lowercased name from the section header
    pub name: String,
    pub enabled: bool,
    /// Instances whose plugin directory receives the jar
    pub targets: Vec<Role>,
    /// File-name patterns of this plugin's jars, used to find and remove old versions
    pub cleanup_globs: Vec<String>,
    /// Consider pre-releases when looking up the newest version
    pub prefer_beta: bool,
    /// Look up the newest release upstream instead of using `url`
    pub prefer_newer: bool,
    /// Last installed download URL
    pub url: Option<String>,
    #[serde(skip)]
    section: String,
}

/// The parsed registry file
#[derive(Debug, Clone)]
pub struct PluginRegistry {
    path: PathBuf,
    document: IniDocument,
    entries: Vec<PluginEntry>,
    dirty: bool,
}

impl PluginRegistry {
    /// Load `path`; a missing file is an empty registry
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} does not exist, registry is empty", path.display());
                String::new()
            }
            Err(e) => return Err(PrepError::io(path, e)),
        };

        let registry_error = |message: String| PluginError::Registry {
            path: path.display().to_string(),
            message,
        };
        let document = IniDocument::parse(&content).map_err(registry_error)?;
        let entries = entries_of(&document).map_err(registry_error)?;
        debug!("Loaded {} plugin(s) from {}", entries.len(), path.display());

        Ok(Self {
            path: path.to_path_buf(),
            document,
            entries,
            dirty: false,
        })
    }

    pub fn entries(&self) -> &[PluginEntry] {
        &self.entries
    }

    /// Entries to act on: all of them, or just `only`
    pub fn select(&self, only: Option<&str>) -> Result<Vec<PluginEntry>> {
        match only {
            None => Ok(self.entries.clone()),
            Some(name) => {
                let name = name.to_lowercase();
                self.entries
                    .iter()
                    .find(|e| e.name == name)
                    .map(|e| vec![e.clone()])
                    .ok_or_else(|| PluginError::UnknownPlugin { name }.into())
            }
        }
    }

    /// Remember the URL a plugin was installed from
    pub fn record_url(&mut self, plugin: &str, url: &str) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.name == plugin) else {
            return;
        };
        if entry.url.as_deref() == Some(url) {
            return;
        }
        entry.url = Some(url.to_string());
        if let Some(section) = self.document.section_mut(&entry.section) {
            section.set("url", url.to_string());
            self.dirty = true;
        }
    }

    /// Write the registry back if anything changed; returns whether it did
    pub fn save(&mut self) -> Result<bool> {
        if !self.dirty {
            return Ok(false);
        }
        std::fs::write(&self.path, self.document.render())
            .map_err(|e| PrepError::io(&self.path, e))?;
        self.dirty = false;
        info!("Updated {}", self.path.display());
        Ok(true)
    }
}

fn entries_of(document: &IniDocument) -> std::result::Result<Vec<PluginEntry>, String> {
    let general = document.section(GENERAL_SECTION);
    let flag = |section: &IniSection, key: &str, fallback: bool| -> std::result::Result<bool, String> {
        match section.get(key) {
            None => Ok(fallback),
            Some(value) => parse_bool(value)
                .ok_or_else(|| format!("[{}] {}: not a boolean: '{}'", section.name, key, value)),
        }
    };

    let (beta_default, newer_default) = match general {
        Some(general) => (
            flag(general, "prefer_beta", false)?,
            flag(general, "prefer_newer", false)?,
        ),
        None => (false, false),
    };

    let mut entries = Vec::new();
    for section in &document.sections {
        let Some(name) = section.name.strip_prefix(PLUGIN_PREFIX) else {
            continue;
        };

        let targets = split_list(section.get("targets").unwrap_or("build"))
            .iter()
            .map(|target| match target.to_lowercase().as_str() {
                "build" => Ok(Role::Build),
                "map" => Ok(Role::Map),
                other => Err(format!("[{}] unknown target '{}'", section.name, other)),
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        entries.push(PluginEntry {
            name: name.trim().to_lowercase(),
            enabled: flag(section, "enabled", false)?,
            targets,
            cleanup_globs: split_list(section.get("cleanup_globs").unwrap_or_default()),
            prefer_beta: flag(section, "prefer_beta", beta_default)?,
            prefer_newer: flag(section, "prefer_newer", newer_default)?,
            url: section
                .get("url")
                .map(str::to_string)
                .filter(|u| !u.is_empty()),
            section: section.name.clone(),
        });
    }
    Ok(entries)
}
