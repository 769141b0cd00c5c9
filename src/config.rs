//! Configuration schema. Every tunable is an enumerated field on one of the
//! section structs; unknown keys in the file are warned about at startup
//! rather than silently ignored.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::git::GitTimeouts;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    pub core: CoreConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub pull: PullConfig,
    #[serde(default)]
    pub fsck: FsckConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Top directory under which all mirrored repositories live.
    pub toplevel: PathBuf,

    /// Location of the local manifest; defaults to `<toplevel>/manifest.js.gz`.
    pub manifest: Option<PathBuf>,

    /// Shared fork-object storage; defaults to `<toplevel>/objstore`.
    pub objstore: Option<PathBuf>,

    /// Extra log file receiving debug output (the console shows info).
    pub log: Option<PathBuf>,

    #[serde(default = "defaults::loglevel")]
    pub loglevel: String,

    /// Repositories matching these globs are never enrolled into shared
    /// object storage with public siblings.
    #[serde(default)]
    pub private: Vec<String>,

    /// Copy objects into objstore repos with hardlinks and update-ref
    /// instead of porcelain fetch.
    #[serde(default)]
    pub objstore_uses_plumbing: bool,

    /// Override the git binary (the `GITBIN` env var also works).
    pub gitbin: Option<PathBuf>,

    #[serde(default = "defaults::clone_timeout")]
    pub clone_timeout: u64,
    #[serde(default = "defaults::fetch_timeout")]
    pub fetch_timeout: u64,
    #[serde(default = "defaults::repack_timeout")]
    pub repack_timeout: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            toplevel: PathBuf::default(),
            manifest: None,
            objstore: None,
            log: None,
            loglevel: defaults::loglevel(),
            private: Vec::new(),
            objstore_uses_plumbing: false,
            gitbin: None,
            clone_timeout: defaults::clone_timeout(),
            fetch_timeout: defaults::fetch_timeout(),
            repack_timeout: defaults::repack_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RemoteConfig {
    /// Base URL repositories are cloned from, e.g. `https://git.example.org`.
    #[serde(default)]
    pub site: String,

    /// URL of the remote manifest (`.js` or `.js.gz`), or a `file://` path.
    #[serde(default)]
    pub manifest: String,

    /// Alternative to `manifest`: a command that prints the manifest on
    /// stdout. Exit 127 means "unchanged", exit 1 is fatal.
    pub manifest_command: Option<String>,

    /// Where to look for `<forkgroup>.bundle` files to preload new objstore
    /// repositories from a CDN instead of the git server.
    pub preload_bundle_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullConfig {
    /// Seconds between manifest checks in daemon mode.
    #[serde(default = "defaults::refresh")]
    pub refresh: u64,

    /// Worker pool size; 0 picks cpu count capped at 10.
    #[serde(default)]
    pub pull_threads: usize,

    #[serde(default = "defaults::retries")]
    pub retries: u32,

    /// Unix socket path for push notifications.
    pub socket: Option<PathBuf>,

    #[serde(default = "defaults::include_all")]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Remove local repositories that disappear from the remote manifest.
    #[serde(default)]
    pub purge: bool,

    /// Never purge repositories matching these globs.
    #[serde(default)]
    pub nopurge: Vec<String>,

    /// Repositories matching these globs fetch without forcing refs.
    #[serde(default)]
    pub ffonly: Vec<String>,

    /// Fraction of manifest entries that may disappear in one pass before
    /// the purge is refused (see also `purge_threshold`).
    #[serde(default = "defaults::purge_quorum")]
    pub purge_quorum: f64,

    /// Absolute removals below this count are always allowed.
    #[serde(default = "defaults::purge_threshold")]
    pub purge_threshold: usize,

    #[serde(default = "defaults::default_owner")]
    pub default_owner: String,

    #[serde(default)]
    pub post_update_hook: Vec<String>,
    #[serde(default)]
    pub post_clone_complete_hook: Vec<String>,
    #[serde(default)]
    pub post_work_complete_hook: Vec<String>,

    /// Seconds in-flight workers get to finish after SIGTERM.
    #[serde(default = "defaults::shutdown_grace")]
    pub shutdown_grace: u64,

    /// cgit-style projects list to regenerate after each pass.
    pub projectslist: Option<PathBuf>,
    #[serde(default)]
    pub projectslist_trimtop: String,
    #[serde(default)]
    pub projectslist_symlinks: bool,
}

impl Default for PullConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty pull config")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FsckConfig {
    /// Days between full health checks of any one repository.
    #[serde(default = "defaults::frequency")]
    pub frequency: u32,

    /// Status sidecar; defaults to `<toplevel>/fsck.status.js`.
    pub statusfile: Option<PathBuf>,

    #[serde(default = "defaults::yes")]
    pub repack: bool,
    #[serde(default = "defaults::yes")]
    pub prune: bool,

    #[serde(default = "defaults::prune_expire")]
    pub prune_expire: String,

    /// `yes` (precious outside repacks), `no`, or `always` (never toggled
    /// off, loose objects accumulate).
    #[serde(default = "defaults::precious")]
    pub precious: String,

    #[serde(default = "defaults::yes")]
    pub commitgraph: bool,

    #[serde(default = "defaults::loose_obj_threshold")]
    pub loose_obj_threshold: u64,
    #[serde(default = "defaults::packs_threshold")]
    pub packs_threshold: u64,

    /// Days between full (`-f`) repacks, jittered by `full_repack_jitter`.
    #[serde(default = "defaults::full_repack_every")]
    pub full_repack_every: u32,
    #[serde(default = "defaults::full_repack_jitter")]
    pub full_repack_jitter: u32,

    pub max_pack_size: Option<String>,

    #[serde(default)]
    pub extra_repack_flags: Vec<String>,
    #[serde(default)]
    pub extra_repack_flags_full: Vec<String>,

    /// Substrings that demote git stderr lines to debug.
    #[serde(default = "defaults::ignore_errors")]
    pub ignore_errors: Vec<String>,

    /// Substrings in fsck/repack/prune stderr that mark a repository for
    /// deletion and re-cloning on the next pull pass.
    #[serde(default = "defaults::reclone_on_errors")]
    pub reclone_on_errors: Vec<String>,

    /// When set, the accumulated problem report is mailed here.
    pub report_to: Option<String>,
    #[serde(default = "defaults::report_from")]
    pub report_from: String,
    pub report_subject: Option<String>,
    #[serde(default = "defaults::report_mailer")]
    pub report_mailer: String,
}

impl Default for FsckConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty fsck config")
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ManifestConfig {
    /// Sort keys and indent the emitted manifest.
    #[serde(default)]
    pub pretty: bool,

    /// Path globs skipped when walking the toplevel.
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Only export repositories containing `git-daemon-export-ok`.
    #[serde(default)]
    pub check_export_ok: bool,

    /// Refs matching these globs are excluded from fingerprints.
    #[serde(default)]
    pub ignore_refs: Vec<String>,
}

mod defaults {
    pub(crate) fn loglevel() -> String {
        "info".to_string()
    }
    pub(crate) fn clone_timeout() -> u64 {
        3600
    }
    pub(crate) fn fetch_timeout() -> u64 {
        600
    }
    pub(crate) fn repack_timeout() -> u64 {
        14400
    }
    pub(crate) fn refresh() -> u64 {
        300
    }
    pub(crate) fn retries() -> u32 {
        3
    }
    pub(crate) fn include_all() -> Vec<String> {
        vec!["*".to_string()]
    }
    pub(crate) fn purge_quorum() -> f64 {
        0.05
    }
    pub(crate) fn purge_threshold() -> usize {
        5
    }
    pub(crate) fn default_owner() -> String {
        "Grokmirror".to_string()
    }
    pub(crate) fn shutdown_grace() -> u64 {
        60
    }
    pub(crate) fn frequency() -> u32 {
        30
    }
    pub(crate) fn yes() -> bool {
        true
    }
    pub(crate) fn prune_expire() -> String {
        "now".to_string()
    }
    pub(crate) fn precious() -> String {
        "yes".to_string()
    }
    pub(crate) fn loose_obj_threshold() -> u64 {
        1200
    }
    pub(crate) fn packs_threshold() -> u64 {
        20
    }
    pub(crate) fn full_repack_every() -> u32 {
        65
    }
    pub(crate) fn full_repack_jitter() -> u32 {
        2
    }
    pub(crate) fn ignore_errors() -> Vec<String> {
        [
            "notice:",
            "dangling commit",
            "dangling blob",
            "dangling tag",
            "dangling tree",
            "warning: disabling bitmap writing",
            "ignoring extra bitmap file",
            "contains zero-padded file modes",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
    pub(crate) fn reclone_on_errors() -> Vec<String> {
        [
            "fatal: bad object",
            "fatal: bad tree",
            "missing blob",
            "missing tree",
            "broken link",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
    pub(crate) fn report_from() -> String {
        "root".to_string()
    }
    pub(crate) fn report_mailer() -> String {
        "/usr/sbin/sendmail -t".to_string()
    }
}

impl Config {
    /// Load and validate a config file. Fatal problems (missing file, bad
    /// YAML, absent toplevel) error out; unknown keys only warn.
    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let raw: serde_yaml::Value = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        warn_unknown_keys(&raw);

        let mut config: Config = serde_yaml::from_value(raw)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        config.validate()?;
        config.apply_defaults();
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.core.toplevel.as_os_str().is_empty() {
            bail!("core.toplevel must be set");
        }
        if !self.core.toplevel.is_dir() {
            bail!(
                "core.toplevel {} does not exist or is not a directory",
                self.core.toplevel.display()
            );
        }
        if !(0.0..1.0).contains(&self.pull.purge_quorum) {
            bail!("pull.purge_quorum must be within [0, 1)");
        }
        if !matches!(self.fsck.precious.as_str(), "yes" | "no" | "always") {
            bail!("fsck.precious must be one of: yes, no, always");
        }
        Ok(())
    }

    fn apply_defaults(&mut self) {
        if self.core.manifest.is_none() {
            self.core.manifest = Some(self.core.toplevel.join("manifest.js.gz"));
        }
        if self.core.objstore.is_none() {
            self.core.objstore = Some(self.core.toplevel.join("objstore"));
        }
        if self.fsck.statusfile.is_none() {
            self.fsck.statusfile = Some(self.core.toplevel.join("fsck.status.js"));
        }
    }

    pub fn toplevel(&self) -> PathBuf {
        self.core
            .toplevel
            .canonicalize()
            .unwrap_or_else(|_| self.core.toplevel.clone())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.core
            .manifest
            .clone()
            .unwrap_or_else(|| self.core.toplevel.join("manifest.js.gz"))
    }

    pub fn objstore_path(&self) -> PathBuf {
        self.core
            .objstore
            .clone()
            .unwrap_or_else(|| self.core.toplevel.join("objstore"))
    }

    pub fn statusfile_path(&self) -> PathBuf {
        self.fsck
            .statusfile
            .clone()
            .unwrap_or_else(|| self.core.toplevel.join("fsck.status.js"))
    }

    pub fn git_timeouts(&self) -> GitTimeouts {
        GitTimeouts {
            clone: self.core.clone_timeout,
            fetch: self.core.fetch_timeout,
            repack: self.core.repack_timeout,
            default: self.core.fetch_timeout,
        }
    }

    pub fn pull_threads(&self) -> usize {
        if self.pull.pull_threads > 0 {
            self.pull.pull_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
                .min(10)
        }
    }
}

const KNOWN_SECTIONS: &[&str] = &["core", "remote", "pull", "fsck", "manifest"];

const KNOWN_KEYS: &[(&str, &[&str])] = &[
    (
        "core",
        &[
            "toplevel",
            "manifest",
            "objstore",
            "log",
            "loglevel",
            "private",
            "objstore_uses_plumbing",
            "gitbin",
            "clone_timeout",
            "fetch_timeout",
            "repack_timeout",
        ],
    ),
    (
        "remote",
        &["site", "manifest", "manifest_command", "preload_bundle_url"],
    ),
    (
        "pull",
        &[
            "refresh",
            "pull_threads",
            "retries",
            "socket",
            "include",
            "exclude",
            "purge",
            "nopurge",
            "ffonly",
            "purge_quorum",
            "purge_threshold",
            "default_owner",
            "post_update_hook",
            "post_clone_complete_hook",
            "post_work_complete_hook",
            "shutdown_grace",
            "projectslist",
            "projectslist_trimtop",
            "projectslist_symlinks",
        ],
    ),
    (
        "fsck",
        &[
            "frequency",
            "statusfile",
            "repack",
            "prune",
            "prune_expire",
            "precious",
            "commitgraph",
            "loose_obj_threshold",
            "packs_threshold",
            "full_repack_every",
            "full_repack_jitter",
            "max_pack_size",
            "extra_repack_flags",
            "extra_repack_flags_full",
            "ignore_errors",
            "reclone_on_errors",
            "report_to",
            "report_from",
            "report_subject",
            "report_mailer",
        ],
    ),
    (
        "manifest",
        &["pretty", "ignore", "check_export_ok", "ignore_refs"],
    ),
];

fn warn_unknown_keys(raw: &serde_yaml::Value) {
    let Some(top) = raw.as_mapping() else {
        return;
    };
    for (section, value) in top {
        let Some(section) = section.as_str() else {
            continue;
        };
        if !KNOWN_SECTIONS.contains(&section) {
            tracing::warn!("unknown config section [{}], ignoring", section);
            continue;
        }
        let known: BTreeSet<&str> = KNOWN_KEYS
            .iter()
            .find(|(name, _)| *name == section)
            .map(|(_, keys)| keys.iter().copied().collect())
            .unwrap_or_default();
        let Some(mapping) = value.as_mapping() else {
            continue;
        };
        for key in mapping.keys() {
            if let Some(key) = key.as_str() {
                if !known.contains(key) {
                    tracing::warn!("unknown config key {}.{}, ignoring", section, key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("grokmirror.conf");
        let mut fh = std::fs::File::create(&path).unwrap();
        fh.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_minimal_config() {
        let tmp = TempDir::new().unwrap();
        let body = format!("core:\n  toplevel: {}\n", tmp.path().display());
        let path = write_config(&tmp, &body);

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.manifest_path(),
            tmp.path().join("manifest.js.gz")
        );
        assert_eq!(config.objstore_path(), tmp.path().join("objstore"));
        assert_eq!(config.pull.refresh, 300);
        assert!((config.pull.purge_quorum - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.fsck.frequency, 30);
        assert!(config
            .fsck
            .reclone_on_errors
            .iter()
            .any(|s| s == "fatal: bad object"));
    }

    #[test]
    fn test_missing_toplevel_fails() {
        let tmp = TempDir::new().unwrap();
        let path = write_config(&tmp, "core:\n  toplevel: /does/not/exist\n");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_bad_precious_fails() {
        let tmp = TempDir::new().unwrap();
        let body = format!(
            "core:\n  toplevel: {}\nfsck:\n  precious: sometimes\n",
            tmp.path().display()
        );
        let path = write_config(&tmp, &body);
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_unknown_keys_do_not_fail() {
        let tmp = TempDir::new().unwrap();
        let body = format!(
            "core:\n  toplevel: {}\n  frobnicate: true\nextras:\n  x: 1\n",
            tmp.path().display()
        );
        let path = write_config(&tmp, &body);
        // Unknown keys and sections only warn.
        Config::load(&path).unwrap();
    }
}
