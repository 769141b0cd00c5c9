//! Advisory file locks shared by the pull and fsck controllers. These only
//! coordinate grokmirror processes with each other; bare git invocations do
//! not honor them. The OS drops the lock when the process dies, so a crashed
//! pass never wedges a repository.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{RepoError, RepoResult};

/// Exclusive lock on one repository directory. Held for the duration of any
/// mutation (clone, fetch, repack, prune, fsck) and released on drop.
#[derive(Debug)]
pub struct RepoLock {
    primary: File,
    // grokmirror-1.x processes lock a dotfile next to the repo instead of a
    // file inside it; hold both so mixed fleets stay safe.
    legacy: Option<File>,
    path: PathBuf,
}

impl RepoLock {
    /// Acquire the lock for `repo`. Blocking mode waits indefinitely;
    /// non-blocking returns `LockBusy` when another process holds it.
    pub fn acquire(repo: &Path, blocking: bool) -> RepoResult<RepoLock> {
        let primary_path = repo.join(".grokmirror.lock");
        let legacy_path = legacy_lock_path(repo);

        let primary = open_lock_file(&primary_path)?;
        lock_file(&primary, repo, blocking)?;

        let legacy = match legacy_path {
            Some(path) => {
                let file = open_lock_file(&path)?;
                if let Err(e) = lock_file(&file, repo, blocking) {
                    // Release the primary before bailing so we don't hold a
                    // half-acquired pair.
                    let _ = fs2::FileExt::unlock(&primary);
                    return Err(e);
                }
                Some(file)
            }
            None => None,
        };

        tracing::debug!("locked {}", repo.display());
        Ok(RepoLock {
            primary,
            legacy,
            path: repo.to_path_buf(),
        })
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.primary);
        if let Some(legacy) = &self.legacy {
            let _ = fs2::FileExt::unlock(legacy);
        }
        tracing::debug!("unlocked {}", self.path.display());
    }
}

/// Exclusive lock guarding the manifest file against concurrent writers.
#[derive(Debug)]
pub struct ManifestLock {
    file: File,
}

impl ManifestLock {
    pub fn acquire(manifile: &Path) -> RepoResult<ManifestLock> {
        let path = sibling_lock_path(manifile);
        let file = open_lock_file(&path)?;
        tracing::debug!("locking manifest via {}", path.display());
        file.lock_exclusive()?;
        Ok(ManifestLock { file })
    }

    pub fn try_acquire(manifile: &Path) -> RepoResult<ManifestLock> {
        let path = sibling_lock_path(manifile);
        let file = open_lock_file(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(RepoError::LockBusy(path));
        }
        Ok(ManifestLock { file })
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// `/top/foo/bar.git` -> `/top/foo/.bar.git.lock`
fn sibling_lock_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "lock".to_string());
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{}.lock", name))
}

fn legacy_lock_path(repo: &Path) -> Option<PathBuf> {
    repo.parent()?;
    Some(sibling_lock_path(repo))
}

fn open_lock_file(path: &Path) -> RepoResult<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).write(true).open(path)?)
}

fn lock_file(file: &File, repo: &Path, blocking: bool) -> RepoResult<()> {
    if blocking {
        file.lock_exclusive()?;
        Ok(())
    } else if file.try_lock_exclusive().is_ok() {
        Ok(())
    } else {
        Err(RepoError::LockBusy(repo.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("a.git");
        std::fs::create_dir_all(&repo).unwrap();

        let lock = RepoLock::acquire(&repo, false).unwrap();
        drop(lock);
        // Re-acquire after release must succeed.
        let _lock = RepoLock::acquire(&repo, false).unwrap();
    }

    #[test]
    fn test_lock_files_created() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("b.git");
        std::fs::create_dir_all(&repo).unwrap();

        let _lock = RepoLock::acquire(&repo, false).unwrap();
        assert!(repo.join(".grokmirror.lock").exists());
        assert!(tmp.path().join(".b.git.lock").exists());
    }

    #[test]
    fn test_manifest_lock() {
        let tmp = TempDir::new().unwrap();
        let manifile = tmp.path().join("manifest.js.gz");
        let lock = ManifestLock::acquire(&manifile).unwrap();
        drop(lock);
        let _lock = ManifestLock::try_acquire(&manifile).unwrap();
    }
}
