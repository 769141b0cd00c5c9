//! Per-repository check/repack bookkeeping, persisted as a JSON sidecar
//! under the toplevel and rewritten atomically after every repo so a killed
//! pass never loses progress.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DATE_FMT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoStatus {
    /// `YYYY-MM-DD`, or "never".
    #[serde(default = "never")]
    pub lastcheck: String,

    /// Next scheduled fsck date, `YYYY-MM-DD`.
    #[serde(default)]
    pub nextcheck: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastrepack: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lastfullrepack: Option<String>,

    /// Wall-clock seconds the last maintenance action took.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s_elapsed: Option<u64>,

    #[serde(default)]
    pub quick_repack_count: u32,

    /// Fingerprint at the time of the last maintenance, so a pass can tell
    /// whether anything moved since.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

fn never() -> String {
    "never".to_string()
}

impl Default for RepoStatus {
    fn default() -> Self {
        RepoStatus {
            lastcheck: never(),
            nextcheck: String::new(),
            lastrepack: None,
            lastfullrepack: None,
            s_elapsed: None,
            quick_repack_count: 0,
            fingerprint: None,
        }
    }
}

impl RepoStatus {
    pub fn new_with_nextcheck(nextcheck: NaiveDate) -> RepoStatus {
        RepoStatus {
            lastcheck: never(),
            nextcheck: nextcheck.format(DATE_FMT).to_string(),
            ..Default::default()
        }
    }

    pub fn nextcheck_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.nextcheck, DATE_FMT).ok()
    }

    pub fn lastfullrepack_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(self.lastfullrepack.as_deref()?, DATE_FMT).ok()
    }
}

/// The whole status file, keyed by repository full path.
#[derive(Debug, Default)]
pub struct StatusFile {
    path: PathBuf,
    pub repos: BTreeMap<String, RepoStatus>,
}

impl StatusFile {
    pub fn load(path: &Path) -> Result<StatusFile> {
        let repos = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read status file {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse status file {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(StatusFile { path: path.to_path_buf(), repos })
    }

    pub fn save(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp status file in {}", dir.display()))?;
        let body = serde_json::to_string_pretty(&self.repos)?;
        tmp.write_all(body.as_bytes())?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace status file {}", self.path.display()))?;
        Ok(())
    }

    pub fn get(&self, fullpath: &Path) -> Option<&RepoStatus> {
        self.repos.get(&fullpath.to_string_lossy().into_owned())
    }

    pub fn entry(&mut self, fullpath: &Path) -> &mut RepoStatus {
        self.repos
            .entry(fullpath.to_string_lossy().into_owned())
            .or_default()
    }

    pub fn remove(&mut self, fullpath: &Path) {
        self.repos.remove(&fullpath.to_string_lossy().into_owned());
    }

    pub fn contains(&self, fullpath: &Path) -> bool {
        self.repos.contains_key(&fullpath.to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fsck.status.js");
        let mut status = StatusFile::load(&path).unwrap();
        assert!(status.repos.is_empty());

        let repo = tmp.path().join("a.git");
        {
            let entry = status.entry(&repo);
            entry.nextcheck = "2024-06-01".to_string();
            entry.quick_repack_count = 3;
        }
        status.save().unwrap();

        let back = StatusFile::load(&path).unwrap();
        let entry = back.get(&repo).unwrap();
        assert_eq!(entry.nextcheck, "2024-06-01");
        assert_eq!(entry.quick_repack_count, 3);
        assert_eq!(entry.lastcheck, "never");
    }

    #[test]
    fn test_date_parsing() {
        let mut entry = RepoStatus::default();
        entry.nextcheck = "2024-02-29".to_string();
        assert_eq!(
            entry.nextcheck_date(),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
        entry.nextcheck = "bogus".to_string();
        assert!(entry.nextcheck_date().is_none());
    }
}
