//! Fetching the remote manifest: conditional HTTP GET, `file://` paths, or
//! an external command (manifest-over-ssh). A sidecar next to the local
//! manifest remembers the last fetch so conditional requests survive
//! restarts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::manifest::{decompress_if_needed, Manifest};

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

pub enum RemoteManifest {
    /// Server says nothing changed since our last fetch.
    Unchanged,
    Fetched {
        manifest: Manifest,
        /// The server's Last-Modified (or the file's mtime), trusted as
        /// canonical and propagated to the local manifest's mtime.
        last_modified: i64,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FetchStatus {
    #[serde(default)]
    source: String,
    #[serde(default, rename = "last-fetched")]
    last_fetched: i64,
}

fn status_path(local_manifest: &Path) -> PathBuf {
    let name = local_manifest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "manifest".to_string());
    let dir = local_manifest.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{}.remote", name))
}

fn read_status(local_manifest: &Path) -> FetchStatus {
    std::fs::read_to_string(status_path(local_manifest))
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn write_status(local_manifest: &Path, status: &FetchStatus) {
    if let Ok(body) = serde_json::to_string(status) {
        let _ = std::fs::write(status_path(local_manifest), body);
    }
}

/// Fetch the remote manifest from whatever source the config names.
/// `nomtime` skips the conditional check and always downloads.
pub fn fetch_remote_manifest(config: &Config, nomtime: bool) -> Result<RemoteManifest> {
    if let Some(command) = &config.remote.manifest_command {
        return fetch_via_command(command);
    }

    let url = config.remote.manifest.trim();
    if url.is_empty() {
        bail!("remote.manifest (or remote.manifest_command) must be set for pull");
    }

    let local_manifest = config.manifest_path();
    if let Some(path) = url.strip_prefix("file://") {
        return fetch_from_file(Path::new(path), &local_manifest, nomtime);
    }
    fetch_via_http(url, &local_manifest, nomtime)
}

/// Exit 127 from the command means "nothing changed"; exit 1 is fatal;
/// anything else non-zero is treated as a transient miss.
fn fetch_via_command(command: &str) -> Result<RemoteManifest> {
    let argv: Vec<&str> = command.split_whitespace().collect();
    if argv.is_empty() {
        bail!("remote.manifest_command is empty");
    }
    tracing::info!(" manifest: executing {}", command);
    let out = std::process::Command::new(argv[0])
        .args(&argv[1..])
        .output()
        .with_context(|| format!("Failed to execute {}", command))?;

    match out.status.code() {
        Some(0) => {
            let data = decompress_if_needed(&out.stdout)?;
            let manifest = Manifest::parse(&data)
                .with_context(|| format!("Failed to parse output of {}", command))?;
            if manifest.is_empty() {
                tracing::warn!(" manifest: {} returned an empty manifest", command);
            }
            Ok(RemoteManifest::Fetched {
                manifest,
                last_modified: Utc::now().timestamp(),
            })
        }
        Some(127) => {
            tracing::info!(" manifest: unchanged");
            Ok(RemoteManifest::Unchanged)
        }
        Some(1) => bail!("{} failed (exit 1)", command),
        code => {
            tracing::warn!(" manifest: {} returned {:?}", command, code);
            Ok(RemoteManifest::Unchanged)
        }
    }
}

fn fetch_from_file(path: &Path, local_manifest: &Path, nomtime: bool) -> Result<RemoteManifest> {
    if !path.exists() {
        bail!("remote manifest not found at {}", path.display());
    }
    let mtime = crate::manifest::file_mtime(path).unwrap_or(0);
    let status = read_status(local_manifest);
    if !nomtime && status.last_fetched > 0 && mtime <= status.last_fetched {
        tracing::info!(" manifest: unchanged");
        return Ok(RemoteManifest::Unchanged);
    }

    let raw = std::fs::read(path)?;
    let data = decompress_if_needed(&raw)?;
    let manifest = Manifest::parse(&data)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    if manifest.is_empty() {
        tracing::warn!(" manifest: {} is empty", path.display());
    }
    write_status(
        local_manifest,
        &FetchStatus {
            source: path.display().to_string(),
            last_fetched: mtime,
        },
    );
    Ok(RemoteManifest::Fetched { manifest, last_modified: mtime })
}

fn fetch_via_http(url: &str, local_manifest: &Path, nomtime: bool) -> Result<RemoteManifest> {
    let client = reqwest::blocking::Client::builder()
        .user_agent(format!("grokmirror/{}", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(300))
        .build()
        .context("Failed to build HTTP client")?;

    let status = read_status(local_manifest);
    let mut request = client.get(url);
    if !nomtime && status.last_fetched > 0 {
        let since = Utc
            .timestamp_opt(status.last_fetched, 0)
            .single()
            .map(|t| t.format(HTTP_DATE).to_string());
        if let Some(since) = since {
            tracing::debug!("if-modified-since: {}", since);
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, since);
        }
    }

    tracing::info!(" manifest: fetching {}", url);
    let response = request
        .send()
        .with_context(|| format!("Could not fetch {}", url))?;

    if response.status() == reqwest::StatusCode::NOT_MODIFIED {
        tracing::info!(" manifest: unchanged");
        return Ok(RemoteManifest::Unchanged);
    }
    if !response.status().is_success() {
        bail!("server returned {} for {}", response.status(), url);
    }

    let last_modified = response
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
        .map(|t| t.timestamp())
        .unwrap_or_else(|| Utc::now().timestamp());

    let raw = response.bytes().context("Failed to read manifest body")?;
    let data = decompress_if_needed(&raw)?;
    let manifest =
        Manifest::parse(&data).with_context(|| format!("Failed to parse manifest from {}", url))?;
    if manifest.is_empty() {
        tracing::warn!(" manifest: {} served an empty manifest", url);
    }

    write_status(
        local_manifest,
        &FetchStatus {
            source: url.to_string(),
            last_fetched: last_modified,
        },
    );
    Ok(RemoteManifest::Fetched { manifest, last_modified })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::RepoEntry;
    use tempfile::TempDir;

    fn file_config(tmp: &TempDir, remote_path: &Path) -> Config {
        let mut config = Config::default();
        config.core.toplevel = tmp.path().to_path_buf();
        config.core.manifest = Some(tmp.path().join("local/manifest.js"));
        config.remote.manifest = format!("file://{}", remote_path.display());
        config
    }

    fn write_remote(tmp: &TempDir) -> PathBuf {
        let mut manifest = Manifest::new();
        manifest.repos.insert(
            "/a.git".to_string(),
            RepoEntry {
                fingerprint: Some("abc".to_string()),
                modified: 100,
                ..Default::default()
            },
        );
        let path = tmp.path().join("remote/manifest.js");
        crate::manifest::write_manifest(&path, &manifest, false, Some(1000)).unwrap();
        path
    }

    #[test]
    fn test_file_fetch_and_conditional_skip() {
        let tmp = TempDir::new().unwrap();
        let remote_path = write_remote(&tmp);
        std::fs::create_dir_all(tmp.path().join("local")).unwrap();
        let config = file_config(&tmp, &remote_path);

        match fetch_remote_manifest(&config, false).unwrap() {
            RemoteManifest::Fetched { manifest, last_modified } => {
                assert_eq!(manifest.len(), 1);
                assert_eq!(last_modified, 1000);
            }
            RemoteManifest::Unchanged => panic!("expected a fetch"),
        }

        // Second time around the sidecar mtime check short-circuits.
        match fetch_remote_manifest(&config, false).unwrap() {
            RemoteManifest::Unchanged => {}
            RemoteManifest::Fetched { .. } => panic!("expected unchanged"),
        }

        // nomtime forces a re-fetch.
        match fetch_remote_manifest(&config, true).unwrap() {
            RemoteManifest::Fetched { .. } => {}
            RemoteManifest::Unchanged => panic!("expected a fetch"),
        }
    }

    #[test]
    fn test_empty_remote_manifest_is_accepted() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("remote/manifest.js");
        crate::manifest::write_manifest(&path, &Manifest::new(), false, None).unwrap();
        std::fs::create_dir_all(tmp.path().join("local")).unwrap();
        let config = file_config(&tmp, &path);
        // An origin can legitimately shrink to nothing; the purge quorum is
        // what protects the replica, not a fetch-time refusal.
        match fetch_remote_manifest(&config, true).unwrap() {
            RemoteManifest::Fetched { manifest, .. } => assert!(manifest.is_empty()),
            RemoteManifest::Unchanged => panic!("expected a fetch"),
        }
    }
}
