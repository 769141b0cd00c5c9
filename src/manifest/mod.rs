//! The manifest is the distributed authority on what repositories exist and
//! when they last changed. It is a single JSON object mapping
//! toplevel-relative paths (always starting with `/`) to repository entries,
//! plus a `/manifest/` meta-entry carrying the producer's version.

mod codec;

pub use codec::{decompress_if_needed, file_mtime, quorum_allows, read_manifest, write_manifest};

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const META_KEY: &str = "/manifest/";

/// One repository as described by the manifest.
///
/// `fingerprint` and `reference` stay in the output even when null:
/// a null fingerprint means "force refresh" to consumers, and 1.x clients
/// break when `reference` is absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,

    /// Unix timestamp of the newest commit the producer saw.
    #[serde(default)]
    pub modified: i64,

    #[serde(default)]
    pub fingerprint: Option<String>,

    #[serde(default)]
    pub reference: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forkgroup: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub symlinks: BTreeSet<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hookversion: Option<u32>,

    /// Local-only marker, never serialized: repo matched a `core.private`
    /// mask and must not share objects with public siblings.
    #[serde(skip)]
    pub private: bool,
}

/// Meta entry stored under [`META_KEY`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub repos: BTreeMap<String, RepoEntry>,
    pub meta: ManifestMeta,
}

impl Manifest {
    pub fn new() -> Manifest {
        Manifest {
            repos: BTreeMap::new(),
            meta: ManifestMeta {
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    /// Parse manifest JSON. The top level must be a mapping; keys are
    /// normalized to a leading `/`, and a normalization collision (both
    /// `a.git` and `/a.git` present) is treated as a duplicate key.
    pub fn parse(data: &[u8]) -> Result<Manifest> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let serde_json::Value::Object(map) = value else {
            bail!("manifest top level is not a mapping");
        };

        let mut manifest = Manifest::default();
        for (key, val) in map {
            if key == META_KEY {
                manifest.meta = serde_json::from_value(val)?;
                continue;
            }
            let norm = normalize_key(&key);
            let entry: RepoEntry = serde_json::from_value(val)?;
            if manifest.repos.insert(norm.clone(), entry).is_some() {
                bail!("duplicate manifest key: {}", norm);
            }
        }
        Ok(manifest)
    }

    /// Serialize to JSON bytes. Keys come out sorted either way (the map is
    /// ordered); pretty mode adds indentation.
    pub fn to_bytes(&self, pretty: bool) -> Result<Vec<u8>> {
        let mut map = serde_json::Map::new();
        map.insert(META_KEY.to_string(), serde_json::to_value(&self.meta)?);
        for (key, entry) in &self.repos {
            map.insert(key.clone(), serde_json::to_value(entry)?);
        }
        let value = serde_json::Value::Object(map);
        let bytes = if pretty {
            serde_json::to_vec_pretty(&value)?
        } else {
            serde_json::to_vec(&value)?
        };
        Ok(bytes)
    }

    /// All symlink aliases across every entry.
    pub fn all_symlinks(&self) -> BTreeSet<String> {
        self.repos
            .values()
            .flat_map(|e| e.symlinks.iter().cloned())
            .collect()
    }
}

pub fn normalize_key(key: &str) -> String {
    if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{}", key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let mut manifest = Manifest::new();
        manifest.repos.insert(
            "/a.git".to_string(),
            RepoEntry {
                head: Some("ref: refs/heads/main".to_string()),
                modified: 100,
                fingerprint: Some("abc".to_string()),
                ..Default::default()
            },
        );
        manifest
    }

    #[test]
    fn test_round_trip() {
        let manifest = sample();
        let bytes = manifest.to_bytes(false).unwrap();
        let parsed = Manifest::parse(&bytes).unwrap();
        assert_eq!(parsed.repos, manifest.repos);
        assert_eq!(parsed.meta.version.as_deref(), Some(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_meta_entry_not_a_repo() {
        let bytes = sample().to_bytes(true).unwrap();
        let parsed = Manifest::parse(&bytes).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(!parsed.repos.contains_key(META_KEY));
    }

    #[test]
    fn test_non_mapping_rejected() {
        assert!(Manifest::parse(b"[1, 2, 3]").is_err());
        assert!(Manifest::parse(b"\"hi\"").is_err());
    }

    #[test]
    fn test_key_normalization_collision() {
        let data = br#"{"a.git": {"modified": 1}, "/a.git": {"modified": 2}}"#;
        assert!(Manifest::parse(data).is_err());
    }

    #[test]
    fn test_reference_always_serialized() {
        let bytes = sample().to_bytes(false).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("\"reference\":null"));
        assert!(text.contains("\"fingerprint\":\"abc\""));
    }

    #[test]
    fn test_null_fingerprint_survives() {
        let data = br#"{"/x.git": {"modified": 5, "fingerprint": null}}"#;
        let parsed = Manifest::parse(data).unwrap();
        assert!(parsed.repos["/x.git"].fingerprint.is_none());
    }
}
