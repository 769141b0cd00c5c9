//! Delta computation: compare the remote manifest against local state and
//! decide what work each repository needs.

use std::collections::BTreeSet;
use std::path::Path;

use glob::Pattern;

use crate::git::GitRunner;
use crate::manifest::{Manifest, RepoEntry};
use crate::repo;

/// What a worker should do for one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Clone from scratch (entry is new).
    Init,
    /// Fetch updates (fingerprint moved, or forced).
    Pull,
    /// Only cosmetic state differs: description, owner, HEAD, symlinks.
    FixParams,
    /// fsck left a reclone mark; delete and clone again.
    Reclone,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub gitdir: String,
    pub entry: RepoEntry,
    pub action: Action,
}

/// Trim the remote manifest down to what this replica mirrors.
pub fn cull_manifest(
    remote: &Manifest,
    include: &[Pattern],
    exclude: &[Pattern],
) -> Manifest {
    let mut culled = Manifest {
        repos: Default::default(),
        meta: remote.meta.clone(),
    };
    for (gitdir, entry) in &remote.repos {
        if !repo::matches_any(include, gitdir) {
            continue;
        }
        if repo::matches_any(exclude, gitdir) {
            continue;
        }
        culled.repos.insert(gitdir.clone(), entry.clone());
    }
    culled
}

/// Mark entries matching the private masks and prefer locally-known
/// forkgroup/reference assignments (our own fsck may have found better
/// family groupings than the origin).
pub fn annotate_entries(
    remote: &mut Manifest,
    local: &Manifest,
    private_masks: &[Pattern],
) {
    for (gitdir, entry) in remote.repos.iter_mut() {
        entry.private = repo::matches_any(private_masks, gitdir);
        if let Some(l_entry) = local.repos.get(gitdir) {
            if l_entry.forkgroup.is_some() {
                entry.forkgroup = l_entry.forkgroup.clone();
            }
            if l_entry.reference.is_some() {
                entry.reference = l_entry.reference.clone();
            }
        }
    }
}

/// Decide per-repo work. `remote` must already be culled and annotated.
///
/// Jobs come back dependency-ordered: repositories that other entries name
/// as their legacy `reference` sort before their dependents, so the
/// borrowed-from repo exists by the time the borrower clones.
pub fn compute_jobs(
    git: &GitRunner,
    toplevel: &Path,
    local: &Manifest,
    remote: &Manifest,
    ignore_refs: &[Pattern],
) -> Vec<Job> {
    let referenced: BTreeSet<&str> = remote
        .repos
        .values()
        .filter_map(|e| e.reference.as_deref())
        .collect();

    let mut jobs = Vec::new();
    for (gitdir, entry) in &remote.repos {
        let fullpath = repo::full_path(toplevel, gitdir);

        if fullpath.exists() {
            if repo::reclone_requested(&fullpath).is_some() {
                tracing::debug!("reclone requested for {}", gitdir);
                jobs.push(Job {
                    gitdir: gitdir.clone(),
                    entry: entry.clone(),
                    action: Action::Reclone,
                });
                continue;
            }

            let l_entry = local.repos.get(gitdir);
            let my_fingerprint = repo::read_cached_fingerprint(&fullpath).or_else(|| {
                repo::repo_fingerprint(git, &fullpath, true, ignore_refs)
                    .ok()
                    .flatten()
            });

            // A null remote fingerprint means "force refresh".
            let remote_fp = entry.fingerprint.as_deref();
            let must_fetch = match (remote_fp, my_fingerprint.as_deref()) {
                (None, _) => true,
                (Some(_), None) => true,
                (Some(r), Some(mine)) => r != mine,
            };

            // Our manifest disagreeing with the disk also forces a fetch;
            // something updated the repo behind our back.
            let manifest_stale = l_entry
                .map(|l| l.fingerprint != my_fingerprint)
                .unwrap_or(true);

            if must_fetch || manifest_stale {
                jobs.push(Job {
                    gitdir: gitdir.clone(),
                    entry: entry.clone(),
                    action: Action::Pull,
                });
                continue;
            }

            if needs_param_fix(&fullpath, toplevel, entry, l_entry) {
                jobs.push(Job {
                    gitdir: gitdir.clone(),
                    entry: entry.clone(),
                    action: Action::FixParams,
                });
            }
        } else {
            jobs.push(Job {
                gitdir: gitdir.clone(),
                entry: entry.clone(),
                action: Action::Init,
            });
        }
    }

    // Legacy-reference providers first, then everything else; clones ahead
    // of fetches within each class so family objects land early.
    jobs.sort_by_key(|job| {
        let provider = referenced.contains(job.gitdir.as_str());
        let init = job.action == Action::Init;
        (!provider, !init)
    });
    jobs
}

/// True when only cosmetic state differs (the symlink-only delta class
/// lands here too).
fn needs_param_fix(
    fullpath: &Path,
    toplevel: &Path,
    r_entry: &RepoEntry,
    l_entry: Option<&RepoEntry>,
) -> bool {
    if let Some(l_entry) = l_entry {
        if r_entry.description != l_entry.description
            || r_entry.owner != l_entry.owner
            || r_entry.head != l_entry.head
        {
            return true;
        }
    }
    for symlink in &r_entry.symlinks {
        let linkpath = repo::full_path(toplevel, symlink);
        let points_right = linkpath
            .read_link()
            .ok()
            .and_then(|_| std::fs::canonicalize(&linkpath).ok())
            .map(|target| {
                target == std::fs::canonicalize(fullpath).unwrap_or_default()
            })
            .unwrap_or(false);
        if !points_right {
            return true;
        }
    }
    false
}

/// Repositories on disk with no remote manifest entry and no symlink alias.
/// The caller still owes an alternates-dependency check and the quorum gate
/// before anything is deleted.
pub fn compute_purge_set(
    toplevel: &Path,
    remote: &Manifest,
    nopurge: &[Pattern],
    ffonly: &[Pattern],
) -> (Vec<String>, usize) {
    let all_symlinks = remote.all_symlinks();
    let mut to_purge = Vec::new();
    let mut found = 0usize;

    for fullpath in repo::find_all_gitdirs(toplevel, &[], true) {
        let gitdir = repo::gitdir_name(toplevel, &fullpath);
        found += 1;
        if remote.repos.contains_key(&gitdir) || all_symlinks.contains(&gitdir) {
            continue;
        }
        if repo::matches_any(nopurge, &gitdir) {
            continue;
        }
        if repo::matches_any(ffonly, &gitdir) {
            tracing::error!("refusing to purge ffonly repo {}", gitdir);
            continue;
        }
        to_purge.push(gitdir);
    }
    (to_purge, found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitTimeouts;
    use crate::repo::compile_globs;
    use tempfile::TempDir;

    fn runner() -> GitRunner {
        GitRunner::new(None, GitTimeouts::default())
    }

    fn entry(fingerprint: Option<&str>, modified: i64) -> RepoEntry {
        RepoEntry {
            fingerprint: fingerprint.map(str::to_string),
            modified,
            head: Some("ref: refs/heads/main".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_cull_include_exclude() {
        let mut remote = Manifest::default();
        remote.repos.insert("/pub/a.git".into(), entry(Some("abc"), 1));
        remote.repos.insert("/pub/b.git".into(), entry(Some("def"), 1));
        remote.repos.insert("/priv/c.git".into(), entry(Some("aaa"), 1));

        let include = compile_globs(&["/pub/*".to_string()]);
        let exclude = compile_globs(&["/pub/b.git".to_string()]);
        let culled = cull_manifest(&remote, &include, &exclude);
        assert_eq!(culled.repos.keys().collect::<Vec<_>>(), vec!["/pub/a.git"]);
    }

    #[test]
    fn test_new_entry_is_init() {
        let tmp = TempDir::new().unwrap();
        let mut remote = Manifest::default();
        remote.repos.insert("/a.git".into(), entry(Some("abc"), 100));

        let jobs = compute_jobs(&runner(), tmp.path(), &Manifest::default(), &remote, &[]);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].action, Action::Init);
    }

    #[test]
    fn test_unchanged_entry_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let repo_path = tmp.path().join("a.git");
        crate::repo::setup_bare_repo(&runner(), &repo_path).unwrap();
        std::fs::write(repo_path.join("grokmirror.fingerprint"), "abc").unwrap();

        let mut remote = Manifest::default();
        let mut local = Manifest::default();
        remote.repos.insert("/a.git".into(), entry(Some("abc"), 100));
        local.repos.insert("/a.git".into(), entry(Some("abc"), 100));

        let jobs = compute_jobs(&runner(), tmp.path(), &local, &remote, &[]);
        assert!(jobs.is_empty(), "unexpected jobs: {:?}", jobs);
    }

    #[test]
    fn test_null_remote_fingerprint_forces_fetch() {
        let tmp = TempDir::new().unwrap();
        let repo_path = tmp.path().join("a.git");
        crate::repo::setup_bare_repo(&runner(), &repo_path).unwrap();
        std::fs::write(repo_path.join("grokmirror.fingerprint"), "abc").unwrap();

        let mut remote = Manifest::default();
        let mut local = Manifest::default();
        remote.repos.insert("/a.git".into(), entry(None, 100));
        local.repos.insert("/a.git".into(), entry(Some("abc"), 100));

        let jobs = compute_jobs(&runner(), tmp.path(), &local, &remote, &[]);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].action, Action::Pull);
    }

    #[test]
    fn test_reclone_mark_wins() {
        let tmp = TempDir::new().unwrap();
        let repo_path = tmp.path().join("a.git");
        crate::repo::setup_bare_repo(&runner(), &repo_path).unwrap();
        crate::repo::set_reclone(&repo_path, "fatal: bad tree").unwrap();

        let mut remote = Manifest::default();
        remote.repos.insert("/a.git".into(), entry(Some("abc"), 100));

        let jobs = compute_jobs(&runner(), tmp.path(), &Manifest::default(), &remote, &[]);
        assert_eq!(jobs[0].action, Action::Reclone);
    }

    #[test]
    fn test_reference_provider_sorts_first() {
        let tmp = TempDir::new().unwrap();
        let mut remote = Manifest::default();
        let mut dependent = entry(Some("abc"), 100);
        dependent.reference = Some("/base.git".to_string());
        remote.repos.insert("/fork.git".into(), dependent);
        remote.repos.insert("/base.git".into(), entry(Some("def"), 100));

        let jobs = compute_jobs(&runner(), tmp.path(), &Manifest::default(), &remote, &[]);
        assert_eq!(jobs[0].gitdir, "/base.git");
        assert_eq!(jobs[1].gitdir, "/fork.git");
    }

    #[test]
    fn test_purge_set_excludes_symlinks_and_nopurge() {
        let tmp = TempDir::new().unwrap();
        crate::repo::setup_bare_repo(&runner(), &tmp.path().join("gone.git")).unwrap();
        crate::repo::setup_bare_repo(&runner(), &tmp.path().join("keep.git")).unwrap();
        crate::repo::setup_bare_repo(&runner(), &tmp.path().join("protected.git")).unwrap();

        let mut remote = Manifest::default();
        remote.repos.insert("/keep.git".into(), entry(Some("abc"), 1));

        let nopurge = compile_globs(&["/protected.git".to_string()]);
        let (purge, found) = compute_purge_set(tmp.path(), &remote, &nopurge, &[]);
        assert_eq!(found, 3);
        assert_eq!(purge, vec!["/gone.git".to_string()]);
    }
}
