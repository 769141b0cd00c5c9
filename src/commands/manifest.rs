//! Origin-side manifest generation: walk the toplevel for bare
//! repositories, record their state, and emit the manifest through the
//! codec.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use glob::Pattern;

use crate::config::Config;
use crate::git::GitRunner;
use crate::lock::ManifestLock;
use crate::manifest::{self, Manifest};
use crate::objstore::Objstore;
use crate::repo;

#[derive(Debug, Clone, Default)]
pub struct ManifestOpts {
    /// Explicit repositories to process (full or toplevel-relative paths);
    /// empty means walk the whole tree.
    pub paths: Vec<PathBuf>,
    /// Use the current time instead of the newest commit date.
    pub usenow: bool,
    /// Only export repositories carrying `git-daemon-export-ok`.
    pub check_export_ok: bool,
    /// Drop manifest entries whose directory is gone.
    pub purge: bool,
    /// Remove the argument repositories from the manifest.
    pub remove: bool,
    pub pretty: bool,
    /// Extra ignore globs on top of the config's.
    pub ignore: Vec<String>,
    /// Wait for the manifest file to appear before updating it.
    pub wait: bool,
    /// Fetch updated repositories into their objstore afterwards.
    pub fetch_objstore: bool,
}

pub fn run(config: &Config, opts: &ManifestOpts) -> Result<i32> {
    let git = GitRunner::new(config.core.gitbin.clone(), config.git_timeouts());
    let toplevel = config.toplevel();
    let manifile = config.manifest_path();
    let pretty = opts.pretty || config.manifest.pretty;
    let check_export_ok = opts.check_export_ok || config.manifest.check_export_ok;
    let ignore_refs = repo::compile_globs(&config.manifest.ignore_refs);

    let mut ignore = config.manifest.ignore.clone();
    ignore.extend(opts.ignore.iter().cloned());
    let ignore = repo::compile_globs(&ignore);

    if opts.wait {
        while !manifile.exists() {
            tracing::info!(" manifest: manifest does not exist yet, waiting ...");
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    let _mlock = ManifestLock::acquire(&manifile)?;
    let mut mani = manifest::read_manifest(&manifile).unwrap_or_else(|e| {
        tracing::error!("unable to parse {}, will regenerate: {:#}", manifile.display(), e);
        Manifest::new()
    });

    // An empty manifest means we're bootstrapping; commit dates beat "now".
    let usenow = opts.usenow && !mani.is_empty();

    if opts.remove && !opts.paths.is_empty() {
        for path in &opts.paths {
            let gitdir = arg_to_gitdir(&toplevel, path);
            if mani.repos.remove(&gitdir).is_some() {
                tracing::info!(" manifest: removed {}", gitdir);
            } else {
                tracing::info!(" manifest: {} not in manifest", gitdir);
            }
        }
        manifest::write_manifest(&manifile, &mani, pretty, None)?;
        return Ok(0);
    }

    let walk_everything = opts.purge || opts.paths.is_empty() || mani.is_empty();
    let gitdirs: Vec<PathBuf> = if walk_everything {
        let found = repo::find_all_gitdirs(&toplevel, &ignore, true);
        purge_gone(&mut mani, &toplevel, &found);
        found
    } else {
        opts.paths
            .iter()
            .map(|p| arg_to_fullpath(&toplevel, p))
            .collect()
    };

    let mut symlinks: Vec<PathBuf> = Vec::new();
    let mut tofetch: BTreeSet<PathBuf> = BTreeSet::new();
    for fullpath in &gitdirs {
        if check_export_ok && !fullpath.join("git-daemon-export-ok").exists() {
            let gitdir = repo::gitdir_name(&toplevel, fullpath);
            if mani.repos.remove(&gitdir).is_some() {
                tracing::info!(" manifest: removed {} (no longer exported)", gitdir);
            }
            continue;
        }
        if fullpath.is_symlink() {
            symlinks.push(fullpath.clone());
            continue;
        }
        update_entry(&git, &mut mani, &toplevel, fullpath, usenow, &ignore_refs)?;
        if opts.fetch_objstore {
            tofetch.insert(fullpath.clone());
        }
    }

    // Second pass resolves symlink aliases onto their realpath entries.
    record_symlinks(&mut mani, &toplevel, &symlinks);

    manifest::write_manifest(&manifile, &mani, pretty, None)?;
    tracing::info!(" manifest: wrote {} ({} entries)", manifile.display(), mani.len());
    drop(_mlock);

    // Objstore fetches happen after the manifest is unlocked; they can be
    // slow and nothing below touches it.
    let objstore = Objstore::new(git.clone(), config.objstore_path());
    let mut fetched: BTreeSet<PathBuf> = BTreeSet::new();
    for fullpath in tofetch {
        let Some(altrepo) = repo::get_altrepo(&fullpath) else {
            continue;
        };
        if !fetched.insert(altrepo.clone()) {
            continue;
        }
        if altrepo.join(repo::OBJSTORE_TELLTALE).exists() {
            tracing::info!(
                " manifest: objstore {} -> {}",
                fullpath.display(),
                altrepo.display()
            );
            let _ = objstore.fetch_member(&altrepo, &fullpath, false);
        }
    }

    Ok(0)
}

fn arg_to_fullpath(toplevel: &Path, arg: &Path) -> PathBuf {
    if arg.is_absolute() {
        arg.to_path_buf()
    } else {
        toplevel.join(arg)
    }
}

fn arg_to_gitdir(toplevel: &Path, arg: &Path) -> String {
    repo::gitdir_name(toplevel, &arg_to_fullpath(toplevel, arg))
}

fn purge_gone(mani: &mut Manifest, toplevel: &Path, found: &[PathBuf]) {
    let on_disk: BTreeSet<String> = found
        .iter()
        .map(|p| repo::gitdir_name(toplevel, p))
        .collect();
    let gone: Vec<String> = mani
        .repos
        .keys()
        .filter(|k| !on_disk.contains(*k))
        .cloned()
        .collect();
    for gitdir in gone {
        tracing::info!(" manifest: purged {} (gone)", gitdir);
        mani.repos.remove(&gitdir);
    }
}

/// Record (or refresh) one repository's entry. Repositories with no refs
/// are skipped entirely; an empty mirror target helps nobody.
fn update_entry(
    git: &GitRunner,
    mani: &mut Manifest,
    toplevel: &Path,
    fullpath: &Path,
    usenow: bool,
    ignore_refs: &[Pattern],
) -> Result<()> {
    if !repo::is_bare_repo(fullpath) {
        tracing::error!("{} is not a bare git repository, skipping", fullpath.display());
        return Ok(());
    }
    let gitdir = repo::gitdir_name(toplevel, fullpath);

    let Some(fingerprint) = repo::repo_fingerprint(git, fullpath, true, ignore_refs)? else {
        tracing::info!(" manifest: ignored {} (no heads)", gitdir);
        return Ok(());
    };

    let modified = if usenow {
        chrono::Utc::now().timestamp()
    } else {
        newest_commit_date(git, fullpath).unwrap_or_else(|| chrono::Utc::now().timestamp())
    };

    let owner = git.config_get(fullpath, "gitweb.owner")?;
    let forkgroup = repo::get_altrepo(fullpath).and_then(|altrepo| {
        if altrepo.join(repo::OBJSTORE_TELLTALE).exists() {
            altrepo.file_stem().map(|s| s.to_string_lossy().into_owned())
        } else {
            None
        }
    });

    let existed = mani.repos.contains_key(&gitdir);
    let entry = mani.repos.entry(gitdir.clone()).or_default();
    entry.fingerprint = Some(fingerprint);
    entry.modified = modified;
    entry.head = repo::read_head(fullpath);
    entry.description = repo::read_description(fullpath);
    entry.owner = owner;
    entry.forkgroup = forkgroup;
    // symlinks, reference and hookversion survive from the previous entry.

    if existed {
        tracing::info!(" manifest: updated {}", gitdir);
    } else {
        tracing::info!(" manifest: added {}", gitdir);
    }
    Ok(())
}

/// Newest committerdate across all refs, as unix seconds.
fn newest_commit_date(git: &GitRunner, fullpath: &Path) -> Option<i64> {
    let out = git
        .run(
            Some(fullpath),
            &[
                "for-each-ref",
                "--sort=-committerdate",
                "--format=%(committerdate:iso-strict)",
                "--count=1",
            ],
            None,
            Duration::from_secs(120),
        )
        .ok()?;
    if !out.ok() {
        return None;
    }
    let stamp = out.stdout.trim();
    if stamp.is_empty() {
        return None;
    }
    chrono::DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|t| t.timestamp())
}

/// Group symlink aliases under their realpath entry and repoint references
/// that named the symlinked location.
fn record_symlinks(mani: &mut Manifest, toplevel: &Path, symlinks: &[PathBuf]) {
    for symlink in symlinks {
        let Ok(target) = std::fs::canonicalize(symlink) else {
            continue;
        };
        if !target.starts_with(toplevel) {
            tracing::debug!("symlink {} points outside toplevel, ignored", symlink.display());
            continue;
        }
        let tgt_gitdir = repo::gitdir_name(toplevel, &target);
        let relative = repo::gitdir_name(toplevel, symlink);
        let Some(entry) = mani.repos.get_mut(&tgt_gitdir) else {
            tracing::debug!(
                "symlink {} points to {}, which we do not recognize",
                relative,
                tgt_gitdir
            );
            continue;
        };
        if entry.symlinks.insert(relative.clone()) {
            tracing::info!(" manifest: symlinked {} -> {}", relative, tgt_gitdir);
        }

        for other in mani.repos.values_mut() {
            if other.reference.as_deref() == Some(relative.as_str()) {
                other.reference = Some(tgt_gitdir.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitTimeouts;
    use tempfile::TempDir;

    fn runner() -> GitRunner {
        GitRunner::new(None, GitTimeouts::default())
    }

    fn git_in(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_AUTHOR_NAME", "Test")
            .env("GIT_AUTHOR_EMAIL", "test@example.org")
            .env("GIT_COMMITTER_NAME", "Test")
            .env("GIT_COMMITTER_EMAIL", "test@example.org")
            .status()
            .expect("failed to run git");
        assert!(status.success(), "git {:?} failed in {}", args, dir.display());
    }

    /// Bare repo with a single commit on main.
    fn make_repo(toplevel: &Path, name: &str) -> PathBuf {
        let work = toplevel.join(format!(".work-{}", name));
        std::fs::create_dir_all(&work).unwrap();
        git_in(&work, &["init", "-q", "-b", "main"]);
        std::fs::write(work.join("README"), "hello\n").unwrap();
        git_in(&work, &["add", "README"]);
        git_in(&work, &["commit", "-q", "-m", "initial"]);

        let bare = toplevel.join(name);
        git_in(
            toplevel,
            &[
                "clone",
                "-q",
                "--mirror",
                work.to_str().unwrap(),
                bare.to_str().unwrap(),
            ],
        );
        std::fs::remove_dir_all(&work).unwrap();
        bare
    }

    fn config_for(toplevel: &Path) -> Config {
        let mut config = Config::default();
        config.core.toplevel = toplevel.to_path_buf();
        config.core.manifest = Some(toplevel.join("manifest.js.gz"));
        config
    }

    #[test]
    fn test_generate_and_update() {
        let tmp = TempDir::new().unwrap();
        let toplevel = tmp.path();
        make_repo(toplevel, "a.git");
        make_repo(toplevel, "b.git");

        let config = config_for(toplevel);
        run(&config, &ManifestOpts::default()).unwrap();

        let mani = manifest::read_manifest(&config.manifest_path()).unwrap();
        assert_eq!(mani.len(), 2);
        let entry = &mani.repos["/a.git"];
        assert!(entry.fingerprint.is_some());
        assert!(entry.modified > 0);
        assert_eq!(entry.head.as_deref(), Some("ref: refs/heads/main"));

        // Deleting a repo and walking with purge drops its entry.
        std::fs::remove_dir_all(toplevel.join("b.git")).unwrap();
        let opts = ManifestOpts { purge: true, ..Default::default() };
        run(&config, &opts).unwrap();
        let mani = manifest::read_manifest(&config.manifest_path()).unwrap();
        assert_eq!(mani.len(), 1);
        assert!(mani.repos.contains_key("/a.git"));
    }

    #[test]
    fn test_remove_mode() {
        let tmp = TempDir::new().unwrap();
        let toplevel = tmp.path();
        make_repo(toplevel, "a.git");
        make_repo(toplevel, "b.git");

        let config = config_for(toplevel);
        run(&config, &ManifestOpts::default()).unwrap();

        let opts = ManifestOpts {
            remove: true,
            paths: vec![PathBuf::from("a.git")],
            ..Default::default()
        };
        run(&config, &opts).unwrap();
        let mani = manifest::read_manifest(&config.manifest_path()).unwrap();
        assert!(!mani.repos.contains_key("/a.git"));
        assert!(mani.repos.contains_key("/b.git"));
    }

    #[test]
    fn test_symlink_alias_grouped_under_real_entry() {
        let tmp = TempDir::new().unwrap();
        let toplevel = tmp.path();
        let real = make_repo(toplevel, "real.git");
        std::os::unix::fs::symlink(&real, toplevel.join("alias.git")).unwrap();

        let config = config_for(toplevel);
        run(&config, &ManifestOpts::default()).unwrap();

        let mani = manifest::read_manifest(&config.manifest_path()).unwrap();
        assert_eq!(mani.len(), 1);
        let entry = &mani.repos["/real.git"];
        assert!(entry.symlinks.contains("/alias.git"));
    }

    #[test]
    fn test_check_export_ok() {
        let tmp = TempDir::new().unwrap();
        let toplevel = tmp.path();
        let exported = make_repo(toplevel, "yes.git");
        make_repo(toplevel, "no.git");
        std::fs::write(exported.join("git-daemon-export-ok"), b"").unwrap();

        let config = config_for(toplevel);
        let opts = ManifestOpts { check_export_ok: true, ..Default::default() };
        run(&config, &opts).unwrap();

        let mani = manifest::read_manifest(&config.manifest_path()).unwrap();
        assert_eq!(mani.len(), 1);
        assert!(mani.repos.contains_key("/yes.git"));
    }

    #[test]
    fn test_empty_repo_not_added() {
        let tmp = TempDir::new().unwrap();
        let toplevel = tmp.path();
        crate::repo::setup_bare_repo(&runner(), &toplevel.join("empty.git")).unwrap();

        let config = config_for(toplevel);
        run(&config, &ManifestOpts::default()).unwrap();
        let mani = manifest::read_manifest(&config.manifest_path()).unwrap();
        assert!(mani.is_empty());
    }
}
