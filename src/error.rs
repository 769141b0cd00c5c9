use std::fmt;
use std::path::PathBuf;

/// Failure kinds that the pull and fsck controllers aggregate per repository.
/// Process-fatal conditions (bad config, disk errors) travel as `anyhow::Error`
/// and abort the pass; these stay local to one repo.
#[derive(Debug)]
pub enum RepoError {
    /// Another grokmirror process holds the repository lock.
    LockBusy(PathBuf),
    /// A git subprocess exceeded its deadline and was killed.
    GitTimeout { repo: PathBuf, args: Vec<String> },
    /// A git subprocess exited non-zero in a way the caller can't recover.
    GitFailed {
        repo: PathBuf,
        args: Vec<String>,
        exit: i32,
        stderr: String,
    },
    /// Manifest emission refused because too many entries would be removed.
    PurgeRefused { removed: usize, total: usize },
    /// Alternates rewiring aborted; the repository was left untouched.
    ObjstoreMigrationFailed { repo: PathBuf, reason: String },
    Io(std::io::Error),
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoError::LockBusy(path) => write!(f, "lock busy: {}", path.display()),
            RepoError::GitTimeout { repo, args } => {
                write!(f, "git timeout in {}: git {}", repo.display(), args.join(" "))
            }
            RepoError::GitFailed { repo, args, exit, stderr } => write!(
                f,
                "git {} failed in {} (exit {}): {}",
                args.join(" "),
                repo.display(),
                exit,
                stderr.trim()
            ),
            RepoError::PurgeRefused { removed, total } => write!(
                f,
                "refusing to purge {} of {} manifest entries without force-purge",
                removed, total
            ),
            RepoError::ObjstoreMigrationFailed { repo, reason } => {
                write!(f, "objstore migration failed for {}: {}", repo.display(), reason)
            }
            RepoError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for RepoError {}

impl From<std::io::Error> for RepoError {
    fn from(e: std::io::Error) -> Self {
        RepoError::Io(e)
    }
}

impl RepoError {
    /// True for failures worth retrying with backoff (network flakes and
    /// timeouts), as opposed to hard errors like a corrupt object store.
    pub fn is_transient(&self) -> bool {
        match self {
            RepoError::GitTimeout { .. } => true,
            RepoError::GitFailed { stderr, .. } => {
                let s = stderr.to_lowercase();
                s.contains("could not resolve host")
                    || s.contains("connection refused")
                    || s.contains("connection reset")
                    || s.contains("connection timed out")
                    || s.contains("early eof")
                    || s.contains("the remote end hung up")
            }
            _ => false,
        }
    }
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;
