//! Dumb pulling: update remotes in repositories not managed by a manifest
//! (mixed-origin mirrors), with a post-update hook when anything moved.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::Config;
use crate::error::RepoError;
use crate::git::GitRunner;
use crate::hooks;
use crate::lock::RepoLock;
use crate::repo;

#[derive(Debug, Clone, Default)]
pub struct DumbPullOpts {
    pub paths: Vec<PathBuf>,
    /// Only update remotes matching these globs.
    pub remotes: Vec<String>,
    /// Hook to run after each repository that got new revs.
    pub posthook: Option<String>,
    /// Remotes are git-svn.
    pub svn: bool,
}

pub fn run(config: &Config, opts: &DumbPullOpts) -> Result<i32> {
    let git = GitRunner::new(config.core.gitbin.clone(), config.git_timeouts());
    let remotes = if opts.remotes.is_empty() {
        vec!["*".to_string()]
    } else {
        opts.remotes.clone()
    };

    let mut failed = 0usize;
    for path in &opts.paths {
        if path.extension().map(|e| e == "git").unwrap_or(false) {
            if !path.exists() {
                tracing::error!("{} does not exist", path.display());
                failed += 1;
                continue;
            }
            if pull_one(&git, path, &remotes, opts.svn) {
                run_posthook(opts, path);
            }
        } else {
            // A tree of repositories; pull everything we find.
            for found in repo::find_all_gitdirs(path, &[], true) {
                if pull_one(&git, &found, &remotes, opts.svn) {
                    run_posthook(opts, &found);
                }
            }
        }
    }
    Ok(if failed > 0 { 2 } else { 0 })
}

fn run_posthook(opts: &DumbPullOpts, fullpath: &Path) {
    if let Some(hook) = &opts.posthook {
        hooks::run_post_update_hooks(std::slice::from_ref(hook), fullpath);
    }
}

/// Fetch matching remotes; report whether any refs moved.
fn pull_one(git: &GitRunner, gitdir: &Path, remotes: &[String], svn: bool) -> bool {
    let old_revs = rev_parse_all(git, gitdir);

    let _lock = match RepoLock::acquire(gitdir, false) {
        Ok(lock) => lock,
        Err(RepoError::LockBusy(_)) => {
            tracing::info!(
                "could not lock {}, assuming another process is running",
                gitdir.display()
            );
            return false;
        }
        Err(e) => {
            tracing::warn!("could not lock {}: {}", gitdir.display(), e);
            return false;
        }
    };

    if svn {
        for remote in remotes {
            let remote = if remote == "*" { "--all" } else { remote.as_str() };
            tracing::info!("running git-svn fetch {} in {}", remote, gitdir.display());
            let _ = git.run(
                Some(gitdir),
                &["svn", "fetch", remote],
                None,
                std::time::Duration::from_secs(git.timeouts.fetch),
            );
        }
    } else {
        let mine = git.remote_list(gitdir).unwrap_or_default();
        if mine.is_empty() {
            tracing::info!("repository {} has no defined remotes", gitdir.display());
            return false;
        }
        let globs = repo::compile_globs(remotes);
        let mut matched = false;
        for myremote in &mine {
            if !repo::matches_any(&globs, myremote) {
                continue;
            }
            matched = true;
            tracing::info!("updating remote {} in {}", myremote, gitdir.display());
            let out = git.run(
                Some(gitdir),
                &["remote", "update", myremote, "--prune"],
                None,
                std::time::Duration::from_secs(git.timeouts.fetch),
            );
            if let Ok(out) = out {
                if !out.ok() {
                    tracing::warn!("stderr ({}): {}", gitdir.display(), out.stderr.trim());
                }
            }
        }
        if !matched {
            tracing::info!(
                "could not find any remotes matching {:?} in {}",
                remotes,
                gitdir.display()
            );
        }
    }

    let new_revs = rev_parse_all(git, gitdir);
    if old_revs == new_revs {
        tracing::debug!("no new revs, no updates");
        return false;
    }
    tracing::debug!("new revs found -- new content pulled");
    true
}

fn rev_parse_all(git: &GitRunner, gitdir: &Path) -> String {
    git.rev_parse(gitdir, "--all")
        .map(|out| out.stdout)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitTimeouts;
    use tempfile::TempDir;

    #[test]
    fn test_repo_without_remotes_does_no_work() {
        let tmp = TempDir::new().unwrap();
        let git = GitRunner::new(None, GitTimeouts::default());
        let repo_path = tmp.path().join("a.git");
        repo::setup_bare_repo(&git, &repo_path).unwrap();
        assert!(!pull_one(&git, &repo_path, &["*".to_string()], false));
    }
}
