//! Image version bump
//!
//! Replaces the old version string with the new one in the configured files,
//! then commits and tags the result.

use crate::errors::{PrepError, Result};
use crate::git::run_git;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// What a bump changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BumpOutcome {
    pub updated: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
    pub committed: bool,
    pub tagged: bool,
}

/// Options for [`bump_version`]
#[derive(Debug, Clone)]
pub struct BumpRequest<'a> {
    pub old: &'a str,
    pub new: &'a str,
    /// Repository root; `files` are resolved against it
    pub repo_dir: &'a Path,
    pub files: &'a [PathBuf],
    /// Skip `git add/commit/tag`
    pub skip_git: bool,
}

fn validate_version(label: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(PrepError::precondition(format!("{} version is empty", label)));
    }
    if value.chars().any(char::is_whitespace) {
        return Err(PrepError::precondition(format!(
            "{} version '{}' contains whitespace",
            label, value
        )));
    }
    Ok(())
}

#[instrument(skip(request), fields(old = request.old, new = request.new))]
pub async fn bump_version(request: &BumpRequest<'_>) -> Result<BumpOutcome> {
    validate_version("old", request.old)?;
    validate_version("new", request.new)?;
    if request.old == request.new {
        return Err(PrepError::precondition(format!(
            "old and new version are both '{}'",
            request.old
        )));
    }

    let mut outcome = BumpOutcome::default();
    for file in request.files {
        let path = if file.is_absolute() {
            file.clone()
        } else {
            request.repo_dir.join(file)
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Version file {} not found, skipping", path.display());
                outcome.missing.push(file.clone());
                continue;
            }
            Err(e) => return Err(PrepError::io(&path, e)),
        };

        if !content.contains(request.old) {
            outcome.unchanged.push(file.clone());
            continue;
        }

        let updated = content.replace(request.old, request.new);
        std::fs::write(&path, updated).map_err(|e| PrepError::io(&path, e))?;
        info!("Updated {}", path.display());
        outcome.updated.push(file.clone());
    }

    if request.skip_git {
        return Ok(outcome);
    }

    if outcome.updated.is_empty() {
        return Err(PrepError::precondition(format!(
            "'{}' was not found in any version file; nothing to commit",
            request.old
        )));
    }

    let mut add_args = vec!["add", "--"];
    let names: Vec<String> = outcome
        .updated
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    add_args.extend(names.iter().map(String::as_str));
    run_git(request.repo_dir, &add_args).await?;

    let message = format!("Bump version {} -> {}", request.old, request.new);
    run_git(request.repo_dir, &["commit", "-m", &message]).await?;
    outcome.committed = true;

    run_git(request.repo_dir, &["tag", request.new]).await?;
    outcome.tagged = true;
    info!("Committed and tagged {}", request.new);

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request<'a>(dir: &'a Path, files: &'a [PathBuf], skip_git: bool) -> BumpRequest<'a> {
        BumpRequest {
            old: "1.4.0",
            new: "1.5.0",
            repo_dir: dir,
            files,
            skip_git,
        }
    }

    #[tokio::test]
    async fn test_replaces_in_files_without_git() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("Dockerfile"),
            "FROM itzg/minecraft-server\nLABEL version=\"1.4.0\"\n",
        )
        .unwrap();
        std::fs::write(temp.path().join("README.md"), "no version here\n").unwrap();
        let files = vec![
            PathBuf::from("Dockerfile"),
            PathBuf::from("README.md"),
            PathBuf::from("absent.txt"),
        ];

        let outcome = bump_version(&request(temp.path(), &files, true))
            .await
            .unwrap();
        assert_eq!(outcome.updated, vec![PathBuf::from("Dockerfile")]);
        assert_eq!(outcome.unchanged, vec![PathBuf::from("README.md")]);
        assert_eq!(outcome.missing, vec![PathBuf::from("absent.txt")]);
        assert!(!outcome.committed);
        assert!(std::fs::read_to_string(temp.path().join("Dockerfile"))
            .unwrap()
            .contains("version=\"1.5.0\""));
    }

    #[tokio::test]
    async fn test_rejects_bad_versions() {
        let temp = TempDir::new().unwrap();
        let files = vec![PathBuf::from("Dockerfile")];
        let mut req = request(temp.path(), &files, true);
        req.new = "1.4.0";
        assert!(bump_version(&req).await.is_err());
        req.new = "1.5 .0";
        assert!(bump_version(&req).await.is_err());
        req.old = "";
        assert!(bump_version(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_commits_and_tags() {
        let temp = TempDir::new().unwrap();
        if run_git(temp.path(), &["init", "-q"]).await.is_err() {
            return;
        }
        run_git(temp.path(), &["config", "user.email", "test@example.com"])
            .await
            .unwrap();
        run_git(temp.path(), &["config", "user.name", "Test"])
            .await
            .unwrap();
        std::fs::write(temp.path().join("Dockerfile"), "ARG VERSION=1.4.0\n").unwrap();
        run_git(temp.path(), &["add", "Dockerfile"]).await.unwrap();
        run_git(temp.path(), &["commit", "-q", "-m", "init"])
            .await
            .unwrap();

        let files = vec![PathBuf::from("Dockerfile")];
        let outcome = bump_version(&request(temp.path(), &files, false))
            .await
            .unwrap();
        assert!(outcome.committed && outcome.tagged);

        let subject = run_git(temp.path(), &["log", "-1", "--format=%s"])
            .await
            .unwrap();
        assert_eq!(subject, "Bump version 1.4.0 -> 1.5.0");
        let tags = run_git(temp.path(), &["tag", "--list"]).await.unwrap();
        assert_eq!(tags, "1.5.0");
    }
}
