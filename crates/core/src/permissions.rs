//! Host ownership and permission normalization
//!
//! Files written by a container usually belong to the container's user.
//! [`normalize`] walks the output trees and hands them back to the host user
//! with predictable permission bits. Symlinks are neither followed nor
//! modified.

use crate::errors::{PrepError, Result};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, instrument};

/// Numeric owner applied to every entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// Counts of entries touched by [`normalize`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeSummary {
    pub files: usize,
    pub directories: usize,
    pub symlinks_skipped: usize,
    pub missing: usize,
}

/// Directory mode derived from a file mode: add search wherever read is set
pub fn directory_mode(mode: u32) -> u32 {
    mode | ((mode & 0o444) >> 2)
}

/// Detect the invoking user's UID and GID
///
/// `UID`/`GID` from the environment win; otherwise `id -u` / `id -g` are used.
#[cfg(unix)]
pub fn host_owner() -> Result<Owner> {
    if let Some(uid) = env_id("UID") {
        let gid = env_id("GID").unwrap_or(uid);
        debug!("Host owner from environment: {}:{}", uid, gid);
        return Ok(Owner { uid, gid });
    }

    let uid = id_query("-u")?;
    let gid = id_query("-g")?;
    debug!("Host owner from id command: {}:{}", uid, gid);
    Ok(Owner { uid, gid })
}

#[cfg(unix)]
fn env_id(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|s| s.parse::<u32>().ok())
}

#[cfg(unix)]
fn id_query(flag: &str) -> Result<u32> {
    let output = std::process::Command::new("id")
        .arg(flag)
        .output()
        .map_err(|e| PrepError::precondition(format!("Failed to run `id {}`: {}", flag, e)))?;
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    value.parse::<u32>().map_err(|e| {
        PrepError::precondition(format!(
            "Failed to parse `id {}` output '{}': {}",
            flag, value, e
        ))
    })
}

#[cfg(not(unix))]
pub fn host_owner() -> Result<Owner> {
    Err(PrepError::precondition(
        "Host UID/GID detection is only supported on Unix",
    ))
}

/// Recursively set owner (when given) and permission bits under each path
///
/// Files get `mode`; directories get [`directory_mode`]. Missing paths are
/// counted and otherwise ignored.
#[cfg(unix)]
#[instrument(skip(paths), fields(count = paths.len()))]
pub fn normalize<P: AsRef<Path>>(
    paths: &[P],
    owner: Option<Owner>,
    mode: u32,
) -> Result<NormalizeSummary> {
    if mode > 0o7777 {
        return Err(PrepError::precondition(format!(
            "Permission mode {:o} is out of range",
            mode
        )));
    }

    let mut summary = NormalizeSummary::default();
    for path in paths {
        let path = path.as_ref();
        match std::fs::symlink_metadata(path) {
            Ok(_) => visit(path, owner, mode, &mut summary)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Nothing to normalize at {}", path.display());
                summary.missing += 1;
            }
            Err(e) => return Err(PrepError::io(path, e)),
        }
    }

    info!(
        "Normalized {} files and {} directories",
        summary.files, summary.directories
    );
    Ok(summary)
}

#[cfg(not(unix))]
pub fn normalize<P: AsRef<Path>>(
    _paths: &[P],
    _owner: Option<Owner>,
    _mode: u32,
) -> Result<NormalizeSummary> {
    Err(PrepError::precondition(
        "Permission normalization is only supported on Unix",
    ))
}

#[cfg(unix)]
fn visit(path: &Path, owner: Option<Owner>, mode: u32, summary: &mut NormalizeSummary) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::symlink_metadata(path).map_err(|e| PrepError::io(path, e))?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        summary.symlinks_skipped += 1;
        return Ok(());
    }

    if let Some(owner) = owner {
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid))
            .map_err(|e| PrepError::io(path, e))?;
    }

    if file_type.is_dir() {
        // Make the directory traversable before descending
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(directory_mode(mode)))
            .map_err(|e| PrepError::io(path, e))?;
        summary.directories += 1;

        let entries = std::fs::read_dir(path).map_err(|e| PrepError::io(path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| PrepError::io(path, e))?;
            visit(&entry.path(), owner, mode, summary)?;
        }
    } else {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| PrepError::io(path, e))?;
        summary.files += 1;
    }

    Ok(())
}
