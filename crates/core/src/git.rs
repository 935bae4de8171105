//! Git helpers
//!
//! The image tag defaults to the current branch name, and the version bump
//! commits and tags through the git CLI.

use crate::errors::{GitError, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Tag used when no branch can be determined
pub const FALLBACK_TAG: &str = "latest";

/// Run `git <args>` in `dir`, returning trimmed stdout
#[instrument(skip(dir), fields(dir = %dir.display()))]
pub async fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                GitError::NotInstalled
            } else {
                GitError::CLIError(format!("Failed to execute git {}: {}", args.join(" "), e))
            }
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(GitError::CLIError(format!("git {} failed: {}", args.join(" "), stderr.trim())).into())
    }
}

/// Name of the checked-out branch (`HEAD` when detached)
pub async fn current_branch(dir: &Path) -> Result<String> {
    run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await
}

/// Turn an arbitrary string into a valid image tag
///
/// Tags allow `[A-Za-z0-9_.-]`, may not start with `.` or `-`, and are at most
/// 128 characters long. Anything else becomes `-`.
pub fn sanitize_tag(raw: &str) -> String {
    let mapped: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = mapped.trim_start_matches(['.', '-']);
    trimmed.chars().take(128).collect()
}

/// Pick the image tag: explicit value first, then the git branch, then `latest`
pub async fn resolve_image_tag(explicit: Option<&str>, dir: &Path) -> String {
    if let Some(tag) = explicit.map(sanitize_tag).filter(|t| !t.is_empty()) {
        return tag;
    }

    match current_branch(dir).await {
        Ok(branch) if branch != "HEAD" => {
            let tag = sanitize_tag(&branch);
            if tag.is_empty() {
                FALLBACK_TAG.to_string()
            } else {
                debug!("Image tag {} derived from branch {}", tag, branch);
                tag
            }
        }
        Ok(_) => FALLBACK_TAG.to_string(),
        Err(e) => {
            debug!("Could not determine git branch, using '{}': {}", FALLBACK_TAG, e);
            FALLBACK_TAG.to_string()
        }
    }
}
