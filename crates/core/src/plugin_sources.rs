//! Upstream lookups for the newest plugin release
//!
//! `repos.json` in the base directory maps a lowercase plugin name to an
//! ordered list of project pages. Each page is tried in order against the
//! Modrinth, GitHub or Hangar API and the first jar URL found wins. Lookup
//! errors are logged and the next source is tried.

use crate::errors::{PluginError, PrepError, Result};
use crate::http::HttpClient;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, instrument, warn};

pub const SOURCES_FILE: &str = "repos.json";

const MODRINTH_API: &str = "https://api.modrinth.com/v2";
const GITHUB_API: &str = "https://api.github.com";
const HANGAR_API: &str = "https://hangar.papermc.io/api/v1";
const HANGAR_CDN: &str = "https://hangarcdn.papermc.io/plugins";

/// Jar variants for other server platforms or tooling
const MODRINTH_EXCLUDED: [&str; 4] = ["velocity", "bungee", "fabric", "cli"];
const GITHUB_EXCLUDED: [&str; 6] = ["cli", "-sources", "-javadoc", "fabric", "velocity", "bungee"];

/// Project pages per plugin, as read from `repos.json`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceIndex(HashMap<String, Vec<String>>);

impl SourceIndex {
    /// Load the index; a missing file yields an empty index
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} does not exist, no upstream sources", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(PrepError::io(path, e)),
        };
        let index: HashMap<String, Vec<String>> =
            serde_json::from_str(&content).map_err(|e| PluginError::Registry {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok(Self(
            index
                .into_iter()
                .map(|(name, urls)| (name.to_lowercase(), urls))
                .collect(),
        ))
    }

    pub fn sources(&self, plugin: &str) -> &[String] {
        self.0
            .get(&plugin.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Numeric components of a version string, for ordering
///
/// `"5.3-beta-2"` becomes `[5, 3, 2]`; a string without digits is `[]`.
pub fn version_key(version: &str) -> Vec<u64> {
    version
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Newest jar URL for `plugin` across its configured sources
#[instrument(skip(client, index))]
pub async fn latest_url<H: HttpClient>(
    client: &H,
    index: &SourceIndex,
    plugin: &str,
    beta: bool,
) -> Option<String> {
    for source in index.sources(plugin) {
        let result = if source.contains("modrinth.com") {
            let slug = source.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
            modrinth_latest(client, slug, beta).await
        } else if source.contains("github.com") {
            github_latest(client, source, beta).await
        } else if source.contains("hangar.papermc.io") {
            hangar_latest(client, source, beta).await
        } else {
            debug!("Unsupported plugin source {}", source);
            Ok(None)
        };

        match result {
            Ok(Some(url)) => {
                debug!("Latest {} release from {}: {}", plugin, source, url);
                return Some(url);
            }
            Ok(None) => debug!("No suitable jar at {}", source),
            Err(e) => warn!("Lookup against {} failed: {}", source, e),
        }
    }
    None
}

async fn fetch_json<H: HttpClient, T: DeserializeOwned>(client: &H, url: &str) -> Result<T> {
    let body = client.get(url).await?;
    serde_json::from_slice(&body).map_err(|e| {
        PluginError::Response {
            url: url.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

#[derive(Debug, Deserialize)]
struct ModrinthVersion {
    version_number: Option<String>,
    name: Option<String>,
    #[serde(default)]
    files: Vec<ModrinthFile>,
}

#[derive(Debug, Deserialize)]
struct ModrinthFile {
    url: String,
}

async fn modrinth_latest<H: HttpClient>(client: &H, slug: &str, beta: bool) -> Result<Option<String>> {
    let url = format!("{}/project/{}/version", MODRINTH_API, slug);
    let versions: Vec<ModrinthVersion> = fetch_json(client, &url).await?;
    Ok(pick_modrinth(&versions, beta))
}

/// Highest-versioned server-platform jar; betas only when asked for
fn pick_modrinth(versions: &[ModrinthVersion], beta: bool) -> Option<String> {
    let mut best: Option<(Vec<u64>, &str)> = None;
    for version in versions {
        let number = version
            .version_number
            .as_deref()
            .or(version.name.as_deref())
            .unwrap_or("0");
        if !beta && number.to_lowercase().contains("beta") {
            continue;
        }
        let key = version_key(number);
        for file in &version.files {
            let lower = file.url.to_lowercase();
            if !lower.ends_with(".jar") || MODRINTH_EXCLUDED.iter().any(|x| lower.contains(x)) {
                continue;
            }
            if best.as_ref().map_or(true, |(best_key, _)| key > *best_key) {
                best = Some((key.clone(), file.url.as_str()));
            }
        }
    }
    best.map(|(_, url)| url.to_string())
}

#[derive(Debug, Deserialize)]
struct GithubRelease {
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

async fn github_latest<H: HttpClient>(client: &H, page: &str, beta: bool) -> Result<Option<String>> {
    let pattern = Regex::new(r"github\.com/([^/]+/[^/]+)").map_err(|e| PluginError::Response {
        url: page.to_string(),
        message: e.to_string(),
    })?;
    let Some(repo) = pattern.captures(page).and_then(|c| c.get(1)) else {
        return Ok(None);
    };
    let url = format!("{}/repos/{}/releases", GITHUB_API, repo.as_str());
    let releases: Vec<GithubRelease> = fetch_json(client, &url).await?;
    Ok(pick_github(&releases, beta))
}

/// First asset of the best platform flavour: Spigot/Bukkit, then Paper, then any
///
/// Releases arrive newest first, so ties keep the newest release.
fn pick_github(releases: &[GithubRelease], beta: bool) -> Option<String> {
    let mut best: Option<(u8, &str)> = None;
    for release in releases {
        if !beta && release.prerelease {
            continue;
        }
        for asset in &release.assets {
            let name = asset.name.to_lowercase();
            if !name.ends_with(".jar") || GITHUB_EXCLUDED.iter().any(|x| name.contains(x)) {
                continue;
            }
            let priority = if name.contains("spigot") || name.contains("bukkit") {
                3
            } else if name.contains("paper") {
                2
            } else {
                1
            };
            if best.map_or(true, |(best_priority, _)| priority > best_priority) {
                best = Some((priority, asset.browser_download_url.as_str()));
            }
        }
    }
    best.map(|(_, url)| url.to_string())
}

#[derive(Debug, Deserialize)]
struct HangarPage {
    result: Vec<HangarVersion>,
}

#[derive(Debug, Deserialize)]
struct HangarVersion {
    name: String,
    channel: Option<HangarChannel>,
}

#[derive(Debug, Deserialize)]
struct HangarChannel {
    name: String,
}

async fn hangar_latest<H: HttpClient>(client: &H, page: &str, beta: bool) -> Result<Option<String>> {
    let pattern =
        Regex::new(r"hangar\.papermc\.io/([^/]+)/([^/]+)").map_err(|e| PluginError::Response {
            url: page.to_string(),
            message: e.to_string(),
        })?;
    let Some(captures) = pattern.captures(page) else {
        return Ok(None);
    };
    let (author, project) = (&captures[1], &captures[2]);
    let url = format!("{}/projects/{}/{}/versions", HANGAR_API, author, project);
    let page: HangarPage = fetch_json(client, &url).await?;
    Ok(pick_hangar(author, project, page.result, beta))
}

/// Download URL of the highest Paper version; betas only when asked for
fn pick_hangar(author: &str, project: &str, mut versions: Vec<HangarVersion>, beta: bool) -> Option<String> {
    versions.sort_by_key(|v| std::cmp::Reverse(version_key(&v.name)));
    versions
        .iter()
        .find(|v| {
            beta || !v
                .channel
                .as_ref()
                .is_some_and(|c| c.name.eq_ignore_ascii_case("beta"))
        })
        .map(|v| {
            format!(
                "{}/{}/{}/versions/{}/PAPER/{}-{}.jar",
                HANGAR_CDN, author, project, v.name, project, v.name
            )
        })
}
