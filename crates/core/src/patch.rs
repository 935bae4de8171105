//! Idempotent config file patches
//!
//! A [`ConfigPatchOp`] names a target file and one operation:
//!
//! - `line-substitution` replaces the first line matching a regex, optionally
//!   appending the replacement when nothing matches.
//! - `structured-document` parses the file as YAML, assigns a value at a dotted
//!   field path and writes the document back only if the value tree changed.
//!
//! Applying an op to a file that is already in the target state leaves the
//! file byte-for-byte unchanged. Missing target files are skipped.

use crate::errors::PatchError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// One patch to one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPatchOp {
    pub file: PathBuf,
    pub operation: PatchOperation,
}

/// What to change in the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "kebab-case")]
pub enum PatchOperation {
    LineSubstitution {
        pattern: String,
        replacement: String,
        #[serde(default)]
        append_if_missing: bool,
    },
    StructuredDocument {
        field: String,
        assign: FieldAssignment,
    },
}

/// Assignment at a structured field path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldAssignment {
    /// Replace the value
    Set(Value),
    /// Append to a sequence, dropping duplicates (first occurrence wins)
    ExtendUnique(Vec<Value>),
}

/// Result of applying one op
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOutcome {
    Applied,
    Unchanged,
    Skipped,
}

/// Applies ops relative to a base directory
#[derive(Debug, Clone)]
pub struct ConfigPatcher {
    base_dir: PathBuf,
}

impl ConfigPatcher {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Target path of `op` resolved against the base directory
    pub fn target(&self, op: &ConfigPatchOp) -> PathBuf {
        if op.file.is_absolute() {
            op.file.clone()
        } else {
            self.base_dir.join(&op.file)
        }
    }

    #[instrument(skip(self, op), fields(file = %op.file.display()))]
    pub fn apply(&self, op: &ConfigPatchOp) -> Result<PatchOutcome, PatchError> {
        let path = self.target(op);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Skipping patch, {} does not exist", path.display());
                return Ok(PatchOutcome::Skipped);
            }
            Err(e) => return Err(io_error(&path, e)),
        };

        let patched = match &op.operation {
            PatchOperation::LineSubstitution {
                pattern,
                replacement,
                append_if_missing,
            } => substitute_line(&content, pattern, replacement, *append_if_missing)?,
            PatchOperation::StructuredDocument { field, assign } => {
                patch_document(&path, &content, field, assign)?
            }
        };

        match patched {
            Some(updated) if updated != content => {
                std::fs::write(&path, updated).map_err(|e| io_error(&path, e))?;
                info!("Patched {}", path.display());
                Ok(PatchOutcome::Applied)
            }
            _ => {
                debug!("{} already up to date", path.display());
                Ok(PatchOutcome::Unchanged)
            }
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> PatchError {
    PatchError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Split a line into body and terminator (`\n`, `\r\n` or nothing)
fn split_terminator(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// Returns the new content, or `None` when nothing needs to change
fn substitute_line(
    content: &str,
    pattern: &str,
    replacement: &str,
    append_if_missing: bool,
) -> Result<Option<String>, PatchError> {
    let regex = Regex::new(pattern).map_err(|e| PatchError::InvalidPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })?;

    let lines: Vec<&str> = content.split_inclusive('\n').collect();

    // Target state reached once any line equals the replacement
    if lines
        .iter()
        .any(|line| split_terminator(line).0 == replacement)
    {
        return Ok(None);
    }

    if let Some(index) = lines
        .iter()
        .position(|line| regex.is_match(split_terminator(line).0))
    {
        let (_, terminator) = split_terminator(lines[index]);
        let mut updated = String::with_capacity(content.len() + replacement.len());
        for (i, line) in lines.iter().enumerate() {
            if i == index {
                updated.push_str(replacement);
                updated.push_str(terminator);
            } else {
                updated.push_str(line);
            }
        }
        return Ok(Some(updated));
    }

    if !append_if_missing {
        return Ok(None);
    }

    let mut updated = content.to_string();
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(replacement);
    updated.push('\n');
    Ok(Some(updated))
}

fn patch_document(
    path: &Path,
    content: &str,
    field: &str,
    assign: &FieldAssignment,
) -> Result<Option<String>, PatchError> {
    let display = path.display().to_string();
    let original: Value = if content.trim().is_empty() {
        Value::Null
    } else {
        serde_yaml::from_str(content).map_err(|e| PatchError::Malformed {
            path: display.clone(),
            message: e.to_string(),
        })?
    };

    let mut document = match &original {
        Value::Null => Value::Mapping(Mapping::new()),
        other => other.clone(),
    };

    let segments: Vec<&str> = field.split('.').collect();
    if segments.iter().any(|s| s.trim().is_empty()) {
        return Err(PatchError::InvalidField {
            field: field.to_string(),
        });
    }

    let slot = resolve_slot(&mut document, &segments, &display, field)?;
    match assign {
        FieldAssignment::Set(value) => *slot = value.clone(),
        FieldAssignment::ExtendUnique(items) => {
            let existing = match slot {
                Value::Null => Vec::new(),
                Value::Sequence(seq) => seq.clone(),
                _ => {
                    return Err(PatchError::NotAList {
                        path: display,
                        field: field.to_string(),
                    })
                }
            };
            *slot = Value::Sequence(extend_unique(existing, items));
        }
    }

    if document == original {
        return Ok(None);
    }

    let rendered = serde_yaml::to_string(&document).map_err(|e| PatchError::Malformed {
        path: display,
        message: e.to_string(),
    })?;
    Ok(Some(rendered))
}

/// Walk (and create) mappings down to the last segment's value slot
fn resolve_slot<'v>(
    document: &'v mut Value,
    segments: &[&str],
    path: &str,
    field: &str,
) -> Result<&'v mut Value, PatchError> {
    let mut current = document;
    for (depth, segment) in segments.iter().enumerate() {
        if current.is_null() {
            *current = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(mapping) = current else {
            let segment = if depth == 0 {
                "<root>".to_string()
            } else {
                segments[..depth].join(".")
            };
            return Err(PatchError::NotAMapping {
                path: path.to_string(),
                field: field.to_string(),
                segment,
            });
        };
        current = mapping
            .entry(Value::String(segment.to_string()))
            .or_insert(Value::Null);
    }
    Ok(current)
}

fn extend_unique(existing: Vec<Value>, items: &[Value]) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(existing.len() + items.len());
    for value in existing.into_iter().chain(items.iter().cloned()) {
        if !merged.contains(&value) {
            merged.push(value);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn essentials_op() -> ConfigPatchOp {
        ConfigPatchOp {
            file: PathBuf::from("build/plugins/Essentials/config.yml"),
            operation: PatchOperation::StructuredDocument {
                field: "disabled-commands".to_string(),
                assign: FieldAssignment::ExtendUnique(vec![
                    Value::String("gamemode".to_string()),
                    Value::String("customtext".to_string()),
                ]),
            },
        }
    }

    fn bluemap_op() -> ConfigPatchOp {
        ConfigPatchOp {
            file: PathBuf::from("map/plugins/BlueMap/core.conf"),
            operation: PatchOperation::LineSubstitution {
                pattern: r"^\s*accept-download\s*[:=]".to_string(),
                replacement: "accept-download: true".to_string(),
                append_if_missing: true,
            },
        }
    }

    fn write(temp: &TempDir, rel: &str, content: &str) -> PathBuf {
        let path = temp.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_extend_unique_keeps_first_occurrence() {
        let temp = TempDir::new().unwrap();
        let path = write(
            &temp,
            "build/plugins/Essentials/config.yml",
            "ops-name-color: '4'\ndisabled-commands:\n- gamemode\n",
        );
        let patcher = ConfigPatcher::new(temp.path());

        assert_eq!(patcher.apply(&essentials_op()).unwrap(), PatchOutcome::Applied);
        let doc: Value = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let list: Vec<String> = serde_yaml::from_value(doc["disabled-commands"].clone()).unwrap();
        assert_eq!(list, vec!["gamemode", "customtext"]);
        assert_eq!(doc["ops-name-color"], Value::String("4".to_string()));
    }

    #[test]
    fn test_structured_patch_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = write(
            &temp,
            "build/plugins/Essentials/config.yml",
            "disabled-commands: []\n",
        );
        let patcher = ConfigPatcher::new(temp.path());

        assert_eq!(patcher.apply(&essentials_op()).unwrap(), PatchOutcome::Applied);
        let first = std::fs::read(&path).unwrap();
        assert_eq!(patcher.apply(&essentials_op()).unwrap(), PatchOutcome::Unchanged);
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn test_unchanged_document_is_not_rewritten() {
        let temp = TempDir::new().unwrap();
        // Hand-formatted file that serde_yaml would render differently
        let original = "# Essentials\ndisabled-commands: [ gamemode, customtext ]\n";
        let path = write(&temp, "build/plugins/Essentials/config.yml", original);
        let patcher = ConfigPatcher::new(temp.path());

        assert_eq!(patcher.apply(&essentials_op()).unwrap(), PatchOutcome::Unchanged);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_set_creates_intermediate_mappings() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "plugins/x.yml", "");
        let op = ConfigPatchOp {
            file: path.clone(),
            operation: PatchOperation::StructuredDocument {
                field: "storage.sql.enabled".to_string(),
                assign: FieldAssignment::Set(Value::Bool(false)),
            },
        };

        let patcher = ConfigPatcher::new(temp.path());
        assert_eq!(patcher.apply(&op).unwrap(), PatchOutcome::Applied);
        let doc: Value = serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["storage"]["sql"]["enabled"], Value::Bool(false));
    }

    #[test]
    fn test_structured_errors() {
        let temp = TempDir::new().unwrap();
        let patcher = ConfigPatcher::new(temp.path());

        let path = write(&temp, "a.yml", "storage: flat\n");
        let op = ConfigPatchOp {
            file: path,
            operation: PatchOperation::StructuredDocument {
                field: "storage.type".to_string(),
                assign: FieldAssignment::Set(Value::String("sql".to_string())),
            },
        };
        assert!(matches!(
            patcher.apply(&op).unwrap_err(),
            PatchError::NotAMapping { .. }
        ));

        write(&temp, "build/plugins/Essentials/config.yml", "disabled-commands: none\n");
        assert!(matches!(
            patcher.apply(&essentials_op()).unwrap_err(),
            PatchError::NotAList { .. }
        ));

        write(&temp, "build/plugins/Essentials/config.yml", "key: [unclosed\n");
        assert!(matches!(
            patcher.apply(&essentials_op()).unwrap_err(),
            PatchError::Malformed { .. }
        ));
    }

    #[test]
    fn test_line_substitution_replaces_first_match() {
        let temp = TempDir::new().unwrap();
        let path = write(
            &temp,
            "map/plugins/BlueMap/core.conf",
            "# header\naccept-download: false\nrender-thread-count: 1\naccept-download: false\n",
        );
        let patcher = ConfigPatcher::new(temp.path());

        assert_eq!(patcher.apply(&bluemap_op()).unwrap(), PatchOutcome::Applied);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "# header\naccept-download: true\nrender-thread-count: 1\naccept-download: false\n"
        );
        assert_eq!(patcher.apply(&bluemap_op()).unwrap(), PatchOutcome::Unchanged);
    }

    #[test]
    fn test_line_substitution_idempotent_when_replacement_does_not_match() {
        let temp = TempDir::new().unwrap();
        let path = write(
            &temp,
            "server.properties",
            "online-mode=true\nmotd=x\nonline-mode=true\n",
        );
        let op = ConfigPatchOp {
            file: PathBuf::from("server.properties"),
            operation: PatchOperation::LineSubstitution {
                pattern: "^online-mode=true$".to_string(),
                replacement: "online-mode=false".to_string(),
                append_if_missing: false,
            },
        };
        let patcher = ConfigPatcher::new(temp.path());

        assert_eq!(patcher.apply(&op).unwrap(), PatchOutcome::Applied);
        let first = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, "online-mode=false\nmotd=x\nonline-mode=true\n");

        assert_eq!(patcher.apply(&op).unwrap(), PatchOutcome::Unchanged);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_line_substitution_appends_once() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "map/plugins/BlueMap/core.conf", "metrics: true");
        let patcher = ConfigPatcher::new(temp.path());

        assert_eq!(patcher.apply(&bluemap_op()).unwrap(), PatchOutcome::Applied);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "metrics: true\naccept-download: true\n"
        );
        assert_eq!(patcher.apply(&bluemap_op()).unwrap(), PatchOutcome::Unchanged);
    }

    #[test]
    fn test_line_substitution_without_append_leaves_file() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "server.properties", "motd=hello\r\n");
        let op = ConfigPatchOp {
            file: PathBuf::from("server.properties"),
            operation: PatchOperation::LineSubstitution {
                pattern: "^online-mode=".to_string(),
                replacement: "online-mode=false".to_string(),
                append_if_missing: false,
            },
        };
        let patcher = ConfigPatcher::new(temp.path());
        assert_eq!(patcher.apply(&op).unwrap(), PatchOutcome::Unchanged);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "motd=hello\r\n");
    }

    #[test]
    fn test_missing_file_is_skipped() {
        let temp = TempDir::new().unwrap();
        let patcher = ConfigPatcher::new(temp.path());
        assert_eq!(patcher.apply(&bluemap_op()).unwrap(), PatchOutcome::Skipped);
        assert_eq!(patcher.apply(&essentials_op()).unwrap(), PatchOutcome::Skipped);
        assert!(!temp.path().join("map").exists());
    }

    #[test]
    fn test_invalid_pattern() {
        let temp = TempDir::new().unwrap();
        write(&temp, "f.txt", "a\n");
        let op = ConfigPatchOp {
            file: PathBuf::from("f.txt"),
            operation: PatchOperation::LineSubstitution {
                pattern: "(".to_string(),
                replacement: "b".to_string(),
                append_if_missing: false,
            },
        };
        assert!(matches!(
            ConfigPatcher::new(temp.path()).apply(&op).unwrap_err(),
            PatchError::InvalidPattern { .. }
        ));
    }

    #[test]
    fn test_op_deserializes_from_toml() {
        let op: ConfigPatchOp = toml::from_str(
            r#"
            file = "build/plugins/Essentials/config.yml"
            [operation]
            format = "structured-document"
            field = "disabled-commands"
            assign = { extend-unique = ["gamemode", "customtext"] }
            "#,
        )
        .unwrap();
        assert_eq!(op, essentials_op());

        let op: ConfigPatchOp = toml::from_str(
            r#"
            file = "map/plugins/BlueMap/core.conf"
            [operation]
            format = "line-substitution"
            pattern = '^\s*accept-download\s*[:=]'
            replacement = "accept-download: true"
            append_if_missing = true
            "#,
        )
        .unwrap();
        assert_eq!(op, bluemap_op());
    }
}
