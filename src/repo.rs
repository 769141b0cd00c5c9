//! Inspection and low-level mutation of individual bare repositories:
//! fingerprints, root commits, alternates wiring, discovery walks, and the
//! sentinel files the pull and fsck controllers use to talk to each other.

use std::collections::{BTreeMap, BTreeSet};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use glob::Pattern;
use sha1::{Digest, Sha1};
use walkdir::WalkDir;

use crate::error::RepoResult;
use crate::git::GitRunner;
use crate::manifest::RepoEntry;

pub const FINGERPRINT_FILE: &str = "grokmirror.fingerprint";
pub const ROOTS_FILE: &str = "grokmirror.roots";
pub const RECLONE_FILE: &str = "grokmirror.reclone";
pub const REPACK_SENTINEL: &str = "grokmirror.repack";
pub const TIMESTAMP_FILE: &str = "grokmirror.timestamp";
pub const OBJSTORE_TELLTALE: &str = "grokmirror.objstore";

/// Git's stock description that means "nobody named this repository".
const PLACEHOLDER_DESC: &str = "edit this file 'description' to name";

/// What a repository is, for the purpose of choosing repack/prune behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoKind {
    /// Borrows objects from an objstore repository.
    Member,
    /// Shared object storage for a fork family.
    Objstore,
    /// Points its alternates at a plain sibling (grokmirror-1.x layout).
    LegacyAlternates,
    /// No alternates relationship in either direction.
    Standalone,
}

pub fn full_path(toplevel: &Path, gitdir: &str) -> PathBuf {
    toplevel.join(gitdir.trim_start_matches('/'))
}

pub fn gitdir_name(toplevel: &Path, fullpath: &Path) -> String {
    let rel = fullpath.strip_prefix(toplevel).unwrap_or(fullpath);
    format!("/{}", rel.to_string_lossy().trim_start_matches('/'))
}

/// Good enough to fool git itself: `objects/`, `refs/`, and `HEAD`.
pub fn is_bare_repo(path: &Path) -> bool {
    path.join("objects").is_dir() && path.join("refs").is_dir() && path.join("HEAD").is_file()
}

pub fn compile_globs(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter_map(|p| {
            let trimmed = p.trim();
            if trimmed.is_empty() {
                return None;
            }
            match Pattern::new(trimmed) {
                Ok(pat) => Some(pat),
                Err(e) => {
                    tracing::warn!("bad glob pattern {:?}: {}", trimmed, e);
                    None
                }
            }
        })
        .collect()
}

pub fn matches_any(globs: &[Pattern], text: &str) -> bool {
    globs.iter().any(|g| g.matches(text))
}

/// Compute the state fingerprint: SHA-1 over `"<sha1> <refname>\n"` lines
/// from show-ref, minus refs matching the ignore globs, sorted by refname.
/// An empty ref set has no fingerprint. The result is cached in the repo so
/// other tools (and future passes) can read it without a subprocess.
pub fn repo_fingerprint(
    git: &GitRunner,
    fullpath: &Path,
    force: bool,
    ignore_refs: &[Pattern],
) -> RepoResult<Option<String>> {
    let fpfile = fullpath.join(FINGERPRINT_FILE);
    if !force {
        if let Ok(cached) = std::fs::read_to_string(&fpfile) {
            let cached = cached.trim().to_string();
            if !cached.is_empty() {
                return Ok(Some(cached));
            }
        }
    }

    let out = git.show_ref(fullpath)?;
    if !out.ok() || out.stdout.is_empty() {
        return Ok(None);
    }

    let mut lines: Vec<(&str, &str)> = Vec::new();
    for line in out.stdout.lines() {
        let Some((sha, refname)) = line.split_once(' ') else {
            continue;
        };
        if matches_any(ignore_refs, refname) {
            continue;
        }
        lines.push((refname, sha));
    }
    if lines.is_empty() {
        return Ok(None);
    }
    lines.sort_unstable_by_key(|(refname, _)| *refname);

    let mut hasher = Sha1::new();
    for (refname, sha) in lines {
        hasher.update(sha.as_bytes());
        hasher.update(b" ");
        hasher.update(refname.as_bytes());
        hasher.update(b"\n");
    }
    let fingerprint = hex::encode(hasher.finalize());
    let _ = std::fs::write(&fpfile, &fingerprint);
    Ok(Some(fingerprint))
}

pub fn read_cached_fingerprint(fullpath: &Path) -> Option<String> {
    let cached = std::fs::read_to_string(fullpath.join(FINGERPRINT_FILE)).ok()?;
    let cached = cached.trim();
    if cached.is_empty() {
        None
    } else {
        Some(cached.to_string())
    }
}

/// Root commits reachable from all refs, cached in the repo.
pub fn repo_roots(git: &GitRunner, fullpath: &Path, force: bool) -> RepoResult<BTreeSet<String>> {
    let rfile = fullpath.join(ROOTS_FILE);
    if !force {
        if let Ok(cached) = std::fs::read_to_string(&rfile) {
            let roots: BTreeSet<String> =
                cached.split_whitespace().map(str::to_string).collect();
            if !roots.is_empty() {
                return Ok(roots);
            }
        }
    }
    let roots: BTreeSet<String> = git.rev_list_roots(fullpath)?.into_iter().collect();
    if !roots.is_empty() {
        let mut body: String = roots.iter().cloned().collect::<Vec<_>>().join("\n");
        body.push('\n');
        let _ = std::fs::write(&rfile, body);
    }
    Ok(roots)
}

/// Read `objects/info/alternates` and return the repository it points at
/// (realpath, with the trailing `/objects` stripped).
pub fn get_altrepo(fullpath: &Path) -> Option<PathBuf> {
    let altfile = fullpath.join("objects/info/alternates");
    let contents = std::fs::read_to_string(altfile).ok()?;
    let line = contents.lines().next()?.trim();
    let objdir = line.strip_suffix("/objects")?;
    std::fs::canonicalize(objdir).ok()
}

pub fn set_altrepo(fullpath: &Path, altdir: &Path) -> std::io::Result<()> {
    let objpath = altdir.join("objects");
    if !objpath.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("alternates target {} does not exist", objpath.display()),
        ));
    }
    let altfile = fullpath.join("objects/info/alternates");
    if let Some(parent) = altfile.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(altfile, format!("{}\n", objpath.display()))
}

pub fn drop_altrepo(fullpath: &Path) -> std::io::Result<()> {
    let altfile = fullpath.join("objects/info/alternates");
    if altfile.exists() {
        std::fs::remove_file(altfile)?;
    }
    Ok(())
}

/// Map from alternates provider (realpath) to the set of repositories that
/// borrow objects from it. Built once per pass; anything that deletes a
/// repository must consult this first, or borrowers lose their objects.
pub fn build_altrepo_map(toplevel: &Path) -> BTreeMap<PathBuf, BTreeSet<PathBuf>> {
    let mut map: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();
    for fullpath in find_all_gitdirs(toplevel, &[], false) {
        if fullpath.is_symlink() {
            // Aliases share the real repo's alternates; counting them
            // would double-book dependencies.
            continue;
        }
        if let Some(altrepo) = get_altrepo(&fullpath) {
            let real = std::fs::canonicalize(&fullpath).unwrap_or(fullpath);
            map.entry(altrepo).or_default().insert(real);
        }
    }
    map
}

pub fn is_alt_repo(map: &BTreeMap<PathBuf, BTreeSet<PathBuf>>, fullpath: &Path) -> bool {
    let real = std::fs::canonicalize(fullpath).unwrap_or_else(|_| fullpath.to_path_buf());
    map.get(&real).map(|users| !users.is_empty()).unwrap_or(false)
}

pub fn is_obstrepo(fullpath: &Path, obstdir: &Path) -> bool {
    fullpath.starts_with(obstdir) || fullpath.join(OBJSTORE_TELLTALE).exists()
}

/// Walk the toplevel for bare repositories, not descending into them.
/// Symlink aliases of repositories are reported too (callers that care
/// about object identity must resolve or skip them).
pub fn find_all_gitdirs(toplevel: &Path, ignore: &[Pattern], exclude_objstore: bool) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(toplevel).follow_links(false).into_iter();
    loop {
        let entry = match walker.next() {
            Some(Ok(entry)) => entry,
            Some(Err(e)) => {
                tracing::debug!("walk error under {}: {}", toplevel.display(), e);
                continue;
            }
            None => break,
        };
        let path = entry.path();
        if entry.file_type().is_symlink() {
            // is_bare_repo follows the link; walkdir won't descend into it.
            if is_bare_repo(path) {
                found.push(path.to_path_buf());
            }
            continue;
        }
        if !entry.file_type().is_dir() {
            continue;
        }
        if matches_any(ignore, &path.to_string_lossy()) {
            walker.skip_current_dir();
            continue;
        }
        if is_bare_repo(path) {
            walker.skip_current_dir();
            if exclude_objstore && path.join(OBJSTORE_TELLTALE).exists() {
                continue;
            }
            found.push(path.to_path_buf());
        }
    }
    found.sort();
    found
}

pub fn classify(fullpath: &Path, obstdir: &Path) -> RepoKind {
    if is_obstrepo(fullpath, obstdir) {
        return RepoKind::Objstore;
    }
    match get_altrepo(fullpath) {
        Some(alt) if is_obstrepo(&alt, obstdir) => RepoKind::Member,
        Some(_) => RepoKind::LegacyAlternates,
        None => RepoKind::Standalone,
    }
}

/// Output of `git count-objects -v`.
#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub count: u64,
    pub size: u64,
    pub in_pack: u64,
    pub packs: u64,
    pub size_pack: u64,
    pub garbage: u64,
    pub size_garbage: u64,
    pub alternate: Option<String>,
}

pub fn object_info(git: &GitRunner, fullpath: &Path) -> RepoResult<ObjectInfo> {
    let out = git.count_objects(fullpath)?;
    let mut info = ObjectInfo::default();
    for line in out.stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "count" => info.count = value.parse().unwrap_or(0),
            "size" => info.size = value.parse().unwrap_or(0),
            "in-pack" => info.in_pack = value.parse().unwrap_or(0),
            "packs" => info.packs = value.parse().unwrap_or(0),
            "size-pack" => info.size_pack = value.parse().unwrap_or(0),
            "garbage" => info.garbage = value.parse().unwrap_or(0),
            "size-garbage" => info.size_garbage = value.parse().unwrap_or(0),
            "alternate" => info.alternate = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(info)
}

/// Initialize a fresh bare repository the way the mirror wants it: no hook
/// samples, no auto-gc, FETCH_HEAD pointed at /dev/null to skip the write.
pub fn setup_bare_repo(git: &GitRunner, fullpath: &Path) -> RepoResult<()> {
    if let Some(parent) = fullpath.parent() {
        std::fs::create_dir_all(parent)?;
    }
    git.init_bare(fullpath)?;

    let hooksdir = fullpath.join("hooks");
    if let Ok(entries) = std::fs::read_dir(&hooksdir) {
        for entry in entries.flatten() {
            if entry.path().extension().map(|e| e == "sample").unwrap_or(false) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }

    git.config_set(fullpath, "gc.auto", "0")?;
    let fetch_head = fullpath.join("FETCH_HEAD");
    if !fetch_head.exists() {
        let _ = symlink("/dev/null", &fetch_head);
    }
    Ok(())
}

/// Apply cosmetic parameters from a manifest entry: description, gitweb
/// owner, and the HEAD symref. Only touches files whose content differs.
pub fn set_repo_params(
    git: &GitRunner,
    fullpath: &Path,
    entry: &RepoEntry,
    default_owner: &str,
) -> RepoResult<()> {
    if let Some(description) = &entry.description {
        let descfile = fullpath.join("description");
        let current = std::fs::read_to_string(&descfile).unwrap_or_default();
        if current != *description {
            tracing::debug!("setting description on {}", fullpath.display());
            std::fs::write(&descfile, description)?;
        }
    }

    let owner = entry.owner.as_deref().unwrap_or(default_owner);
    git.config_set(fullpath, "gitweb.owner", owner)?;

    if let Some(head) = &entry.head {
        let headfile = fullpath.join("HEAD");
        let current = std::fs::read_to_string(&headfile).unwrap_or_default();
        if current.trim_end() != head.as_str() {
            tracing::debug!("setting HEAD on {} to {}", fullpath.display(), head);
            std::fs::write(&headfile, format!("{}\n", head))?;
        }
    }
    Ok(())
}

pub fn read_description(fullpath: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(fullpath.join("description")).ok()?;
    let contents = contents.trim();
    if contents.is_empty() || contents.contains(PLACEHOLDER_DESC) {
        None
    } else {
        Some(contents.to_string())
    }
}

pub fn read_head(fullpath: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(fullpath.join("HEAD")).ok()?;
    let head = contents.trim();
    if head.is_empty() {
        None
    } else {
        Some(head.to_string())
    }
}

pub fn set_repo_timestamp(fullpath: &Path, ts: i64) -> std::io::Result<()> {
    std::fs::write(fullpath.join(TIMESTAMP_FILE), format!("{}", ts))
}

/// Record the last-modified stamp where cgit looks for idle times.
pub fn set_agefile(fullpath: &Path, last_modified: i64) -> std::io::Result<()> {
    use chrono::TimeZone;
    let stamp = chrono::Local
        .timestamp_opt(last_modified, 0)
        .single()
        .map(|t| t.format("%F %T").to_string())
        .unwrap_or_default();
    let agefile = fullpath.join("info/web/last-modified");
    if let Some(parent) = agefile.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(agefile, format!("{}\n", stamp))
}

pub fn is_precious(git: &GitRunner, fullpath: &Path) -> bool {
    matches!(
        git.config_get(fullpath, "extensions.preciousObjects")
            .ok()
            .flatten()
            .as_deref()
            .map(str::to_lowercase)
            .as_deref(),
        Some("true") | Some("yes") | Some("1")
    )
}

pub fn reclone_requested(fullpath: &Path) -> Option<String> {
    std::fs::read_to_string(fullpath.join(RECLONE_FILE)).ok()
}

pub fn set_reclone(fullpath: &Path, reason: &str) -> std::io::Result<()> {
    let rfile = fullpath.join(RECLONE_FILE);
    if rfile.exists() {
        // Already requested; keep the earlier reason.
        return Ok(());
    }
    std::fs::write(rfile, format!("Requested by grok-fsck due to error: {}\n", reason))
}

/// Repack-window sentinel. `extensions.preciousObjects` is toggled off for
/// the duration of a repack; if the process dies mid-window the sentinel
/// survives and the next fsck pass restores the setting before doing
/// anything else.
pub fn set_repack_sentinel(fullpath: &Path) -> std::io::Result<()> {
    std::fs::write(fullpath.join(REPACK_SENTINEL), b"")
}

pub fn clear_repack_sentinel(fullpath: &Path) {
    let _ = std::fs::remove_file(fullpath.join(REPACK_SENTINEL));
}

pub fn repack_sentinel_present(fullpath: &Path) -> bool {
    fullpath.join(REPACK_SENTINEL).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::{GitRunner, GitTimeouts};
    use tempfile::TempDir;

    fn runner() -> GitRunner {
        GitRunner::new(None, GitTimeouts::default())
    }

    #[test]
    fn test_gitdir_name_round_trip() {
        let toplevel = Path::new("/srv/mirror");
        let fullpath = full_path(toplevel, "/pub/scm/git.git");
        assert_eq!(fullpath, Path::new("/srv/mirror/pub/scm/git.git"));
        assert_eq!(gitdir_name(toplevel, &fullpath), "/pub/scm/git.git");
    }

    #[test]
    fn test_setup_and_detect_bare_repo() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("a.git");
        setup_bare_repo(&runner(), &repo).unwrap();

        assert!(is_bare_repo(&repo));
        // No hook samples survive, auto-gc is off.
        let samples: Vec<_> = std::fs::read_dir(repo.join("hooks"))
            .map(|rd| {
                rd.flatten()
                    .filter(|e| e.path().extension().map(|x| x == "sample").unwrap_or(false))
                    .collect()
            })
            .unwrap_or_default();
        assert!(samples.is_empty());
        assert_eq!(
            runner().config_get(&repo, "gc.auto").unwrap().as_deref(),
            Some("0")
        );
    }

    #[test]
    fn test_empty_repo_has_no_fingerprint() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("a.git");
        setup_bare_repo(&runner(), &repo).unwrap();
        let fp = repo_fingerprint(&runner(), &repo, true, &[]).unwrap();
        assert!(fp.is_none());
    }

    #[test]
    fn test_find_all_gitdirs_stops_descending() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("sub/a.git");
        setup_bare_repo(&runner(), &repo).unwrap();
        // A directory inside the repo must not be reported separately.
        std::fs::create_dir_all(repo.join("refs/heads/x")).unwrap();

        let found = find_all_gitdirs(tmp.path(), &[], true);
        assert_eq!(found, vec![repo]);
    }

    #[test]
    fn test_find_all_gitdirs_honors_ignore() {
        let tmp = TempDir::new().unwrap();
        setup_bare_repo(&runner(), &tmp.path().join("keep/a.git")).unwrap();
        setup_bare_repo(&runner(), &tmp.path().join("skip/b.git")).unwrap();

        let ignore = compile_globs(&[format!("{}/skip*", tmp.path().display())]);
        let found = find_all_gitdirs(tmp.path(), &ignore, true);
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("keep/a.git"));
    }

    #[test]
    fn test_alternates_round_trip() {
        let tmp = TempDir::new().unwrap();
        let parent = tmp.path().join("parent.git");
        let child = tmp.path().join("child.git");
        setup_bare_repo(&runner(), &parent).unwrap();
        setup_bare_repo(&runner(), &child).unwrap();

        set_altrepo(&child, &parent).unwrap();
        let alt = get_altrepo(&child).unwrap();
        assert_eq!(alt, parent.canonicalize().unwrap());

        let map = build_altrepo_map(tmp.path());
        assert!(is_alt_repo(&map, &parent));
        assert!(!is_alt_repo(&map, &child));

        drop_altrepo(&child).unwrap();
        assert!(get_altrepo(&child).is_none());
    }

    #[test]
    fn test_description_placeholder_ignored() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("a.git");
        setup_bare_repo(&runner(), &repo).unwrap();
        // git init writes the stock placeholder.
        assert!(read_description(&repo).is_none());
        std::fs::write(repo.join("description"), "Linux kernel mirror").unwrap();
        assert_eq!(read_description(&repo).as_deref(), Some("Linux kernel mirror"));
    }

    #[test]
    fn test_reclone_mark_keeps_first_reason() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("a.git");
        std::fs::create_dir_all(&repo).unwrap();

        set_reclone(&repo, "fatal: bad tree").unwrap();
        set_reclone(&repo, "other").unwrap();
        let reason = reclone_requested(&repo).unwrap();
        assert!(reason.contains("fatal: bad tree"));
    }
}
