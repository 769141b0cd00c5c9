//! Shared object storage for fork families. Repositories that share root
//! commits get their objects consolidated into one bare "objstore" repo and
//! borrow them back through alternates; each member's refs are mirrored into
//! the objstore under `refs/virtual/<virtref>/*` so delta islands can keep
//! per-member clones small.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use rand::Rng;
use sha1::{Digest, Sha1};
use walkdir::WalkDir;

use crate::error::{RepoError, RepoResult};
use crate::git::GitRunner;
use crate::lock::RepoLock;
use crate::repo::{self, OBJSTORE_TELLTALE};

const TELLTALE_PREAMBLE: &str = "\
# WARNING: This is a grokmirror object storage repository.
# Deleting or moving it will cause corruption in the following repositories
# (caution, this list may be incomplete):
";

#[derive(Debug, Clone)]
pub struct Objstore {
    git: GitRunner,
    obstdir: PathBuf,
}

impl Objstore {
    pub fn new(git: GitRunner, obstdir: PathBuf) -> Objstore {
        Objstore { git, obstdir }
    }

    pub fn repo_path(&self, forkgroup: &str) -> PathBuf {
        self.obstdir.join(format!("{}.git", forkgroup))
    }

    /// Remote name for a member: sha1 of its realpath, first 12 hex chars.
    /// Stable before the repository exists: the parent is resolved and the
    /// final component appended, so enrollment can precede the clone.
    pub fn virtref(fullpath: &Path) -> String {
        let real = std::fs::canonicalize(fullpath).unwrap_or_else(|_| {
            match (fullpath.parent(), fullpath.file_name()) {
                (Some(parent), Some(name)) => std::fs::canonicalize(parent)
                    .map(|p| p.join(name))
                    .unwrap_or_else(|_| fullpath.to_path_buf()),
                _ => fullpath.to_path_buf(),
            }
        });
        let mut hasher = Sha1::new();
        hasher.update(real.to_string_lossy().as_bytes());
        hex::encode(hasher.finalize())[..12].to_string()
    }

    pub fn random_forkgroup() -> String {
        let mut rng = rand::thread_rng();
        (0..12)
            .map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap())
            .collect()
    }

    /// Create an objstore repository, or return the existing one.
    pub fn setup_repo(&self, forkgroup: &str) -> RepoResult<PathBuf> {
        let obstrepo = self.repo_path(forkgroup);
        if repo::is_bare_repo(&obstrepo) {
            return Ok(obstrepo);
        }
        std::fs::create_dir_all(&self.obstdir)?;
        tracing::debug!("creating objstore repo {}", obstrepo.display());
        std::fs::create_dir_all(&obstrepo)?;
        let _lock = RepoLock::acquire(&obstrepo, true)?;
        repo::setup_bare_repo(&self.git, &obstrepo)?;

        // Everything in here is borrowed by members, so objects are precious
        // except inside explicit repack windows.
        self.git.config_set(&obstrepo, "core.repositoryformatversion", "1")?;
        self.git.config_set(&obstrepo, "extensions.preciousObjects", "true")?;
        self.git.config_set(&obstrepo, "pack.compression", "9")?;
        self.git.config_set(&obstrepo, "repack.useDeltaIslands", "true")?;
        self.git.config_set(&obstrepo, "repack.writeBitmaps", "true")?;
        self.git.config_add(&obstrepo, "pack.island", "refs/virtual/([0-9a-f]+)/")?;

        std::fs::write(obstrepo.join(OBJSTORE_TELLTALE), TELLTALE_PREAMBLE)?;
        Ok(obstrepo)
    }

    /// Enroll a member: one remote per member named by its virtref, fetching
    /// everything into that member's virtual ref namespace. Returns false if
    /// it was already enrolled.
    pub fn add_member(&self, obstrepo: &Path, fullpath: &Path) -> RepoResult<bool> {
        let virtref = Self::virtref(fullpath);
        if self.git.remote_list(obstrepo)?.contains(&virtref) {
            tracing::debug!(
                "{} already enrolled in {}",
                fullpath.display(),
                obstrepo.display()
            );
            return Ok(false);
        }

        let fullpath_s = fullpath.to_string_lossy();
        self.git.run_ok(
            Some(obstrepo),
            &["remote", "add", &virtref, &fullpath_s, "--no-tags"],
            None,
            std::time::Duration::from_secs(60),
        )?;
        self.git.config_set(
            obstrepo,
            &format!("remote.{}.fetch", virtref),
            &format!("+refs/*:refs/virtual/{}/*", virtref),
        )?;
        self.git.config_set(obstrepo, "fetch.writeCommitGraph", "true")?;

        self.update_telltale(obstrepo)?;
        Ok(true)
    }

    /// Rewrite the telltale with the current member list so a human poking
    /// at the directory knows what depends on it.
    fn update_telltale(&self, obstrepo: &Path) -> RepoResult<()> {
        let mut siblings = BTreeSet::new();
        for (_, url) in self.git.remote_list_with_urls(obstrepo)? {
            if Path::new(&url).is_dir() {
                siblings.insert(url);
            }
        }
        let mut body = String::from(TELLTALE_PREAMBLE);
        for sibling in &siblings {
            body.push_str(sibling);
            body.push('\n');
        }
        std::fs::write(obstrepo.join(OBJSTORE_TELLTALE), body)?;
        Ok(())
    }

    /// Wire a member repository to borrow objects from the objstore. The
    /// alternates line carries the realpath so later symlink shuffles at
    /// the toplevel can't orphan it.
    pub fn wire_alternates(&self, fullpath: &Path, obstrepo: &Path) -> RepoResult<()> {
        let real = std::fs::canonicalize(obstrepo).unwrap_or_else(|_| obstrepo.to_path_buf());
        repo::set_altrepo(fullpath, &real)?;
        self.git.config_set(fullpath, "gc.auto", "0")?;
        Ok(())
    }

    /// Fetch one member's refs and objects into the objstore.
    pub fn fetch_member(
        &self,
        obstrepo: &Path,
        fullpath: &Path,
        use_plumbing: bool,
    ) -> RepoResult<bool> {
        let virtref = Self::virtref(fullpath);
        let remotes = self.git.remote_list_with_urls(obstrepo)?;
        if !remotes.iter().any(|(name, _)| name == &virtref) {
            tracing::debug!(
                "{} is not a remote of {}",
                fullpath.display(),
                obstrepo.display()
            );
            return Ok(false);
        }

        let success = if use_plumbing {
            self.fetch_member_plumbing(obstrepo, fullpath, &virtref)?
        } else {
            let out = self.git.fetch(obstrepo, &virtref, &["--prune"])?;
            out.ok()
        };

        if success {
            // Mirror the member's fingerprint so the next pass can skip the
            // fetch when nothing changed.
            let src = fullpath.join(repo::FINGERPRINT_FILE);
            if src.exists() {
                let dst = obstrepo.join(format!("grokmirror.{}.fingerprint", virtref));
                let _ = std::fs::copy(&src, &dst);
            }
        } else {
            tracing::info!(
                "could not fetch {} into {}",
                fullpath.display(),
                obstrepo.display()
            );
        }
        Ok(success)
    }

    /// Copy objects without spawning pack negotiation: hardlink everything
    /// under the member's objects/ (bitmaps excluded), then reconcile the
    /// virtual ref namespace with update-ref --stdin. The member's copies
    /// are removed once linked, leaving its object store empty.
    fn fetch_member_plumbing(
        &self,
        obstrepo: &Path,
        fullpath: &Path,
        virtref: &str,
    ) -> RepoResult<bool> {
        let srcobj = fullpath.join("objects");
        let dstobj = obstrepo.join("objects");
        let mut to_remove: Vec<PathBuf> = Vec::new();

        for entry in WalkDir::new(&srcobj).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let srcpath = entry.path();
            let rel = srcpath.strip_prefix(&srcobj).unwrap_or(srcpath);
            if rel.starts_with("info") {
                continue;
            }
            if srcpath.extension().map(|e| e == "bitmap").unwrap_or(false) {
                to_remove.push(srcpath.to_path_buf());
                continue;
            }
            let dstpath = dstobj.join(rel);
            if !dstpath.exists() {
                if let Some(parent) = dstpath.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::hard_link(srcpath, &dstpath)?;
            }
            to_remove.push(srcpath.to_path_buf());
        }

        let src_fmt = format!(
            "%(objectname) refs/virtual/{}/%(refname:lstrip=1)",
            virtref
        );
        let src_out = self.git.for_each_ref(fullpath, &src_fmt, None)?;
        if !src_out.ok() {
            return Ok(false);
        }
        let dst_out = self.git.for_each_ref(
            obstrepo,
            "%(objectname) %(refname)",
            Some(&format!("refs/virtual/{}", virtref)),
        )?;
        if !dst_out.ok() {
            return Ok(false);
        }

        let parse = |text: &str| -> BTreeMap<String, String> {
            text.lines()
                .filter_map(|l| l.split_once(' '))
                .map(|(obj, name)| (name.to_string(), obj.to_string()))
                .collect()
        };
        let src_refs = parse(&src_out.stdout);
        let dst_refs = parse(&dst_out.stdout);

        let mut commands = String::new();
        for (name, obj) in &src_refs {
            match dst_refs.get(name) {
                Some(old) if old != obj => {
                    commands.push_str(&format!("update {} {} {}\n", name, obj, old))
                }
                Some(_) => {}
                None => commands.push_str(&format!("create {} {}\n", name, obj)),
            }
        }
        for (name, obj) in &dst_refs {
            if !src_refs.contains_key(name) {
                commands.push_str(&format!("delete {} {}\n", name, obj));
            }
        }

        if !commands.is_empty() {
            let out = self.git.update_ref_stdin(obstrepo, &commands)?;
            if !out.ok() {
                tracing::debug!("update-ref failed in {}: {}", obstrepo.display(), out.stderr);
                return Ok(false);
            }
        }

        for file in to_remove {
            let _ = std::fs::remove_file(file);
        }
        Ok(true)
    }

    /// Drop a member: repack it standalone first if it still borrows from
    /// us, trim its virtual refs, remove the remote.
    pub fn remove_member(&self, obstrepo: &Path, fullpath: &Path) -> RepoResult<bool> {
        if let Some(altrepo) = repo::get_altrepo(fullpath) {
            let obst_real =
                std::fs::canonicalize(obstrepo).unwrap_or_else(|_| obstrepo.to_path_buf());
            if altrepo == obst_real {
                let out = self.git.repack(fullpath, &["-abq"])?;
                if !out.ok() {
                    tracing::debug!(
                        "could not repack {} for removal from {}",
                        fullpath.display(),
                        obstrepo.display()
                    );
                    return Ok(false);
                }
                repo::drop_altrepo(fullpath)?;
            }
        }

        let virtref = Self::virtref(fullpath);
        self.trim_virtual_refs(obstrepo, &virtref)?;
        self.git.remote_remove(obstrepo, &virtref)?;
        let _ = std::fs::remove_file(obstrepo.join(format!("grokmirror.{}.fingerprint", virtref)));
        self.update_telltale(obstrepo)?;
        Ok(true)
    }

    fn trim_virtual_refs(&self, obstrepo: &Path, virtref: &str) -> RepoResult<()> {
        let out = self.git.for_each_ref(
            obstrepo,
            "delete %(refname)",
            Some(&format!("refs/virtual/{}", virtref)),
        )?;
        if out.ok() && !out.stdout.trim().is_empty() {
            let mut commands = out.stdout.trim_end().to_string();
            commands.push('\n');
            self.git.update_ref_stdin(obstrepo, &commands)?;
        }
        Ok(())
    }

    /// An objstore with no remotes left backs nothing and may be deleted.
    pub fn is_deletable(&self, obstrepo: &Path) -> RepoResult<bool> {
        Ok(self.git.remote_list(obstrepo)?.is_empty())
    }

    /// Existing objstore repo that already tracks this member, if any.
    pub fn find_repo_for(&self, fullpath: &Path) -> RepoResult<Option<PathBuf>> {
        if !self.obstdir.is_dir() {
            return Ok(None);
        }
        let virtref = Self::virtref(fullpath);
        for obstrepo in self.all_repos() {
            if self.git.remote_list(&obstrepo)?.contains(&virtref) {
                return Ok(Some(obstrepo));
            }
        }
        Ok(None)
    }

    pub fn all_repos(&self) -> Vec<PathBuf> {
        let mut repos = Vec::new();
        if let Ok(entries) = std::fs::read_dir(&self.obstdir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() && path.extension().map(|e| e == "git").unwrap_or(false) {
                    repos.push(path);
                }
            }
        }
        repos.sort();
        repos
    }

    /// Migrate a repo whose alternates point at a plain sibling (1.x
    /// layout): pull the old parent into a family objstore first, then the
    /// repo itself, and only rewire alternates after the objects are known
    /// to be in place. Any failure leaves the repository untouched.
    pub fn migrate_legacy(
        &self,
        fullpath: &Path,
        legacy_parent: &Path,
        use_plumbing: bool,
    ) -> RepoResult<PathBuf> {
        let fail = |reason: &str| RepoError::ObjstoreMigrationFailed {
            repo: fullpath.to_path_buf(),
            reason: reason.to_string(),
        };

        let obstrepo = match self.find_repo_for(legacy_parent)? {
            Some(existing) => existing,
            None => {
                let forkgroup = Self::random_forkgroup();
                let obstrepo = self.setup_repo(&forkgroup)?;
                self.add_member(&obstrepo, legacy_parent)?;
                if !self.fetch_member(&obstrepo, legacy_parent, use_plumbing)? {
                    return Err(fail("could not fetch legacy parent into objstore"));
                }
                self.wire_alternates(legacy_parent, &obstrepo)?;
                obstrepo
            }
        };

        self.add_member(&obstrepo, fullpath)?;
        if !self.fetch_member(&obstrepo, fullpath, use_plumbing)? {
            return Err(fail("could not fetch repository into objstore"));
        }
        // The objstore now holds everything we borrowed from the legacy
        // parent, so dropping the old link is safe.
        self.wire_alternates(fullpath, &obstrepo)?;
        Ok(obstrepo)
    }
}

/// Fork families: equivalence classes of repositories keyed by their
/// lexicographically smallest root commit. Only classes with two or more
/// members are families worth consolidating.
pub fn fork_families(
    git: &GitRunner,
    repos: &[PathBuf],
) -> BTreeMap<String, BTreeSet<PathBuf>> {
    let mut classes: BTreeMap<String, BTreeSet<PathBuf>> = BTreeMap::new();
    for fullpath in repos {
        let roots = match repo::repo_roots(git, fullpath, false) {
            Ok(roots) => roots,
            Err(e) => {
                tracing::debug!("cannot get roots for {}: {}", fullpath.display(), e);
                continue;
            }
        };
        // BTreeSet iterates in order, so first() is the smallest root.
        if let Some(smallest) = roots.iter().next() {
            classes
                .entry(smallest.clone())
                .or_default()
                .insert(fullpath.clone());
        }
    }
    classes.retain(|_, members| members.len() >= 2);
    classes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::GitTimeouts;
    use tempfile::TempDir;

    fn runner() -> GitRunner {
        GitRunner::new(None, GitTimeouts::default())
    }

    #[test]
    fn test_virtref_is_stable_12_hex() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("a.git");
        std::fs::create_dir_all(&repo).unwrap();

        let v1 = Objstore::virtref(&repo);
        let v2 = Objstore::virtref(&repo);
        assert_eq!(v1, v2);
        assert_eq!(v1.len(), 12);
        assert!(v1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_random_forkgroup_shape() {
        let g = Objstore::random_forkgroup();
        assert_eq!(g.len(), 12);
        assert!(g.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_setup_repo_sets_precious_and_islands() {
        let tmp = TempDir::new().unwrap();
        let store = Objstore::new(runner(), tmp.path().join("objstore"));
        let obstrepo = store.setup_repo("cafe00112233").unwrap();

        assert!(repo::is_bare_repo(&obstrepo));
        assert!(obstrepo.join(OBJSTORE_TELLTALE).exists());
        let git = runner();
        assert_eq!(
            git.config_get(&obstrepo, "extensions.preciousObjects")
                .unwrap()
                .as_deref(),
            Some("true")
        );
        assert_eq!(
            git.config_get(&obstrepo, "repack.useDeltaIslands").unwrap().as_deref(),
            Some("true")
        );

        // Idempotent.
        let again = store.setup_repo("cafe00112233").unwrap();
        assert_eq!(again, obstrepo);
    }

    #[test]
    fn test_add_member_creates_virtual_remote() {
        let tmp = TempDir::new().unwrap();
        let member = tmp.path().join("a.git");
        repo::setup_bare_repo(&runner(), &member).unwrap();

        let store = Objstore::new(runner(), tmp.path().join("objstore"));
        let obstrepo = store.setup_repo("cafe00112233").unwrap();
        assert!(store.add_member(&obstrepo, &member).unwrap());
        // Second add is a no-op.
        assert!(!store.add_member(&obstrepo, &member).unwrap());

        let virtref = Objstore::virtref(&member);
        let git = runner();
        assert!(git.remote_list(&obstrepo).unwrap().contains(&virtref));
        assert_eq!(
            git.config_get(&obstrepo, &format!("remote.{}.fetch", virtref))
                .unwrap()
                .as_deref(),
            Some(format!("+refs/*:refs/virtual/{}/*", virtref).as_str())
        );
        assert_eq!(
            store.find_repo_for(&member).unwrap(),
            Some(obstrepo.clone())
        );

        // The telltale lists the member.
        let telltale = std::fs::read_to_string(obstrepo.join(OBJSTORE_TELLTALE)).unwrap();
        assert!(telltale.contains(&member.to_string_lossy().into_owned()));
    }

    #[test]
    fn test_remove_last_member_makes_deletable() {
        let tmp = TempDir::new().unwrap();
        let member = tmp.path().join("a.git");
        repo::setup_bare_repo(&runner(), &member).unwrap();

        let store = Objstore::new(runner(), tmp.path().join("objstore"));
        let obstrepo = store.setup_repo("cafe00112233").unwrap();
        store.add_member(&obstrepo, &member).unwrap();
        assert!(!store.is_deletable(&obstrepo).unwrap());

        store.remove_member(&obstrepo, &member).unwrap();
        assert!(store.is_deletable(&obstrepo).unwrap());
    }
}
