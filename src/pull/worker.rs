//! Per-repository pull operations. Workers own exactly one repository at a
//! time (under its advisory lock) and report results back to the
//! controller; they never touch shared mutable state directly.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use glob::Pattern;

use crate::error::{RepoError, RepoResult};
use crate::git::GitRunner;
use crate::lock::RepoLock;
use crate::manifest::RepoEntry;
use crate::objstore::Objstore;
use crate::pull::delta::{Action, Job};
use crate::repo;

#[derive(Debug, Clone)]
pub struct WorkerCtx {
    pub git: GitRunner,
    pub toplevel: PathBuf,
    pub obstdir: PathBuf,
    pub site: String,
    pub retries: u32,
    /// Lock-acquisition deadline in seconds (one refresh interval).
    pub lock_deadline: u64,
    pub default_owner: String,
    pub ffonly: Vec<Pattern>,
    pub ignore_refs: Vec<Pattern>,
    pub objstore_uses_plumbing: bool,
    /// CDN base for `<forkgroup>.bundle` files to seed empty objstores.
    pub preload_bundle_url: Option<String>,
}

#[derive(Debug)]
pub struct JobResult {
    pub gitdir: String,
    pub entry: RepoEntry,
    pub action: Action,
    pub success: bool,
    pub skipped: bool,
    /// New objects arrived (clone or fetch with movement).
    pub changed: bool,
    pub error: Option<String>,
}

impl JobResult {
    fn skipped(job: Job) -> JobResult {
        JobResult {
            gitdir: job.gitdir,
            entry: job.entry,
            action: job.action,
            success: false,
            skipped: true,
            changed: false,
            error: None,
        }
    }
}

pub fn process_job(ctx: &WorkerCtx, objstore: &Objstore, job: Job) -> JobResult {
    let fullpath = repo::full_path(&ctx.toplevel, &job.gitdir);

    let _lock = match lock_with_deadline(&fullpath, ctx.lock_deadline) {
        Ok(lock) => lock,
        Err(RepoError::LockBusy(_)) => {
            tracing::info!("    defer: {} (locked)", job.gitdir);
            return JobResult::skipped(job);
        }
        Err(e) => {
            tracing::warn!("could not lock {}: {}", job.gitdir, e);
            return result_err(job, e);
        }
    };

    let mut entry = job.entry.clone();
    let outcome = match job.action {
        Action::FixParams => fix_params(ctx, &fullpath, &entry),
        Action::Init => init_repo(ctx, objstore, &fullpath, &job.gitdir, &entry),
        Action::Pull => pull_repo(ctx, objstore, &fullpath, &job.gitdir, &entry),
        Action::Reclone => {
            tracing::info!("  reclone: {}", job.gitdir);
            reclone_repo(ctx, objstore, &fullpath, &job.gitdir, &entry)
        }
    };

    match outcome {
        Ok(changed) => {
            if changed || job.action == Action::Init {
                // Refresh the recorded fingerprint from what actually landed.
                entry.fingerprint = repo::repo_fingerprint(&ctx.git, &fullpath, true, &ctx.ignore_refs)
                    .ok()
                    .flatten();
            }
            apply_symlinks(&ctx.toplevel, &fullpath, &entry);
            JobResult {
                gitdir: job.gitdir,
                entry,
                action: job.action,
                success: true,
                skipped: false,
                changed,
                error: None,
            }
        }
        Err(e) => {
            tracing::warn!("   failed: {} ({})", job.gitdir, e);
            result_err(
                Job { gitdir: job.gitdir, entry, action: job.action },
                e,
            )
        }
    }
}

fn result_err(job: Job, e: RepoError) -> JobResult {
    JobResult {
        gitdir: job.gitdir,
        entry: job.entry,
        action: job.action,
        success: false,
        skipped: false,
        changed: false,
        error: Some(e.to_string()),
    }
}

/// Spin on the non-blocking lock until the deadline; pull workers must not
/// block a whole refresh interval on one repository.
fn lock_with_deadline(fullpath: &Path, deadline_secs: u64) -> RepoResult<RepoLock> {
    let start = Instant::now();
    loop {
        match RepoLock::acquire(fullpath, false) {
            Ok(lock) => return Ok(lock),
            Err(RepoError::LockBusy(path)) => {
                if start.elapsed() >= Duration::from_secs(deadline_secs) {
                    return Err(RepoError::LockBusy(path));
                }
                std::thread::sleep(Duration::from_secs(1));
            }
            Err(e) => return Err(e),
        }
    }
}

fn fix_params(ctx: &WorkerCtx, fullpath: &Path, entry: &RepoEntry) -> RepoResult<bool> {
    repo::set_repo_params(&ctx.git, fullpath, entry, &ctx.default_owner)?;
    Ok(false)
}

fn init_repo(
    ctx: &WorkerCtx,
    objstore: &Objstore,
    fullpath: &Path,
    gitdir: &str,
    entry: &RepoEntry,
) -> RepoResult<bool> {
    tracing::info!("    clone: {}", gitdir);
    repo::setup_bare_repo(&ctx.git, fullpath)?;

    // Objstore membership comes before the first fetch so family objects
    // are borrowed instead of transferred.
    if let Some(forkgroup) = &entry.forkgroup {
        let obstrepo = objstore.repo_path(forkgroup);
        if repo::is_bare_repo(&obstrepo) {
            objstore.wire_alternates(fullpath, &obstrepo)?;
            if !entry.private {
                objstore.add_member(&obstrepo, fullpath)?;
            }
            let info = repo::object_info(&ctx.git, &obstrepo)?;
            if info.count == 0 && info.in_pack == 0 {
                preload_objstore(ctx, &obstrepo);
            }
        }
    }

    ensure_origin(ctx, fullpath, gitdir)?;
    repo::set_repo_params(&ctx.git, fullpath, entry, &ctx.default_owner)?;
    fetch_with_retries(ctx, fullpath, gitdir)?;
    finish_update(ctx, objstore, fullpath, gitdir, entry, true)?;
    let _ = ctx.git.pack_refs(fullpath, true);
    Ok(true)
}

fn pull_repo(
    ctx: &WorkerCtx,
    objstore: &Objstore,
    fullpath: &Path,
    gitdir: &str,
    entry: &RepoEntry,
) -> RepoResult<bool> {
    let pre_fp = repo::repo_fingerprint(&ctx.git, fullpath, true, &ctx.ignore_refs)?;
    if let (Some(remote_fp), Some(mine)) = (entry.fingerprint.as_deref(), pre_fp.as_deref()) {
        if remote_fp == mine {
            tracing::debug!("fingerprint match, not fetching {}", gitdir);
            repo::set_repo_params(&ctx.git, fullpath, entry, &ctx.default_owner)?;
            return Ok(false);
        }
    }

    ensure_origin(ctx, fullpath, gitdir)?;
    tracing::info!("    fetch: {}", gitdir);
    fetch_with_retries(ctx, fullpath, gitdir)?;
    repo::set_repo_params(&ctx.git, fullpath, entry, &ctx.default_owner)?;

    let post_fp = repo::repo_fingerprint(&ctx.git, fullpath, true, &ctx.ignore_refs)?;
    let changed = post_fp != pre_fp;
    if changed {
        finish_update(ctx, objstore, fullpath, gitdir, entry, pre_fp.is_none())?;
    }
    Ok(changed)
}

/// Delete the work tree and clone again. Objstore membership survives: the
/// alternates target is remembered and rewired into the fresh repository.
fn reclone_repo(
    ctx: &WorkerCtx,
    objstore: &Objstore,
    fullpath: &Path,
    gitdir: &str,
    entry: &RepoEntry,
) -> RepoResult<bool> {
    let altrepo = repo::get_altrepo(fullpath);

    // Move aside first so a failed removal can't leave a half-deleted repo
    // that still looks alive.
    let graveyard = fullpath.with_extension("reclone");
    if graveyard.exists() {
        std::fs::remove_dir_all(&graveyard)?;
    }
    std::fs::rename(fullpath, &graveyard)?;
    std::fs::remove_dir_all(&graveyard)?;

    repo::setup_bare_repo(&ctx.git, fullpath)?;
    if let Some(altrepo) = &altrepo {
        if repo::is_bare_repo(altrepo) {
            repo::set_altrepo(fullpath, altrepo)?;
        }
    }
    ensure_origin(ctx, fullpath, gitdir)?;
    repo::set_repo_params(&ctx.git, fullpath, entry, &ctx.default_owner)?;
    fetch_with_retries(ctx, fullpath, gitdir)?;
    finish_update(ctx, objstore, fullpath, gitdir, entry, true)?;
    let _ = ctx.git.pack_refs(fullpath, true);
    Ok(true)
}

/// Post-transfer bookkeeping shared by clone/fetch/reclone: feed the
/// objstore, note timestamps.
fn finish_update(
    ctx: &WorkerCtx,
    objstore: &Objstore,
    fullpath: &Path,
    gitdir: &str,
    entry: &RepoEntry,
    initial: bool,
) -> RepoResult<()> {
    if !entry.private {
        if let Some(altrepo) = repo::get_altrepo(fullpath) {
            if repo::is_obstrepo(&altrepo, &ctx.obstdir) {
                tracing::info!(" objstore: {}", gitdir);
                let fetched =
                    objstore.fetch_member(&altrepo, fullpath, ctx.objstore_uses_plumbing)?;
                if fetched && initial && !ctx.objstore_uses_plumbing {
                    // The clone transferred objects the objstore now also
                    // holds; drop the member's own copies.
                    let out = ctx.git.repack(fullpath, &["-Adlq"])?;
                    if !out.ok() {
                        tracing::debug!("could not repack {}", gitdir);
                    }
                }
            }
        }
    }

    if entry.modified > 0 {
        let _ = repo::set_repo_timestamp(fullpath, entry.modified);
        let _ = repo::set_agefile(fullpath, entry.modified);
    }
    Ok(())
}

/// Seed an empty objstore from a CDN-hosted `<forkgroup>.bundle` instead
/// of paying for a full transfer from the git server. Best-effort: any
/// failure just means the regular fetch does the work.
fn preload_objstore(ctx: &WorkerCtx, obstrepo: &Path) {
    let Some(base) = &ctx.preload_bundle_url else {
        return;
    };
    let Some(name) = obstrepo.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
        return;
    };
    let burl = format!("{}/{}.bundle", base.trim_end_matches('/'), name);
    let bfile = obstrepo.with_extension("bundle");

    let downloaded = (|| -> anyhow::Result<()> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("grokmirror/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        let mut resp = client.get(&burl).send()?;
        if !resp.status().is_success() {
            anyhow::bail!("server returned {}", resp.status());
        }
        tracing::info!(" objstore: downloading {}.bundle", name);
        let mut fh = std::fs::File::create(&bfile)?;
        resp.copy_to(&mut fh)?;
        Ok(())
    })();
    if let Err(e) = downloaded {
        tracing::debug!("no preload bundle at {}: {:#}", burl, e);
        let _ = std::fs::remove_file(&bfile);
        return;
    }

    let bfile_s = bfile.to_string_lossy();
    let added = ctx.git.run(
        Some(obstrepo),
        &["remote", "add", "--mirror=fetch", "_preload", &bfile_s],
        None,
        Duration::from_secs(60),
    );
    if matches!(added, Ok(out) if out.ok()) {
        tracing::info!(" objstore: preloading {}.bundle", name);
        let updated = ctx.git.run(
            Some(obstrepo),
            &["remote", "update", "_preload"],
            None,
            Duration::from_secs(ctx.git.timeouts.clone),
        );
        match updated {
            Ok(out) if out.ok() => {
                let _ = ctx.git.pack_refs(obstrepo, true);
                let _ = ctx.git.commit_graph_write(obstrepo);
                tracing::info!(" objstore: successful preload from {}.bundle", name);
            }
            _ => tracing::info!(" objstore: failed to preload from {}.bundle", name),
        }
    }
    let _ = ctx.git.remote_remove(obstrepo, "_preload");
    let _ = std::fs::remove_file(&bfile);
}

/// Make sure `origin` exists and points at site + gitdir with a mirror
/// refspec (non-forcing for ffonly repos).
fn ensure_origin(ctx: &WorkerCtx, fullpath: &Path, gitdir: &str) -> RepoResult<()> {
    let url = format!(
        "{}/{}",
        ctx.site.trim_end_matches('/'),
        gitdir.trim_start_matches('/')
    );
    let current = ctx.git.config_get(fullpath, "remote.origin.url")?;
    if current.as_deref() != Some(url.as_str()) {
        if current.is_some() {
            tracing::info!(" reorigin: {}", gitdir);
            ctx.git.remote_remove(fullpath, "origin")?;
        }
        ctx.git.run_ok(
            Some(fullpath),
            &["remote", "add", "--mirror=fetch", "origin", &url],
            None,
            Duration::from_secs(60),
        )?;
    }
    let refspec = if repo::matches_any(&ctx.ffonly, gitdir) {
        "refs/*:refs/*"
    } else {
        "+refs/*:refs/*"
    };
    ctx.git.config_set(fullpath, "remote.origin.fetch", refspec)?;
    Ok(())
}

/// Exponential backoff on transient failures: 5s, 10s, 20s between tries.
fn fetch_with_retries(ctx: &WorkerCtx, fullpath: &Path, gitdir: &str) -> RepoResult<()> {
    let mut backoff = Duration::from_secs(5);
    let mut attempt = 1;
    loop {
        let result = ctx
            .git
            .fetch(fullpath, "origin", &["--prune", "--prune-tags"]);
        let err = match result {
            Ok(out) if out.ok() => return Ok(()),
            Ok(out) => RepoError::GitFailed {
                repo: fullpath.to_path_buf(),
                args: vec!["fetch".to_string(), "origin".to_string()],
                exit: out.exit,
                stderr: out.stderr,
            },
            Err(e) => e,
        };
        if attempt >= ctx.retries || !err.is_transient() {
            return Err(err);
        }
        tracing::info!("  refetch: {} (try #{})", gitdir, attempt + 1);
        std::thread::sleep(backoff);
        backoff *= 2;
        attempt += 1;
    }
}

/// Create/update the symlink aliases for an entry. A plain directory in
/// the way is replaced; a symlink already pointing at us is left alone.
fn apply_symlinks(toplevel: &Path, fullpath: &Path, entry: &RepoEntry) {
    if !fullpath.exists() {
        return;
    }
    let real = std::fs::canonicalize(fullpath).unwrap_or_else(|_| fullpath.to_path_buf());
    for symlink in &entry.symlinks {
        let target = repo::full_path(toplevel, symlink);
        if target.read_link().is_ok() {
            let points_at = std::fs::canonicalize(&target).ok();
            if points_at.as_deref() == Some(real.as_path()) {
                continue;
            }
            let _ = std::fs::remove_file(&target);
        } else if target.exists() {
            tracing::warn!(
                "deleting repo {}, because it is now a symlink to {}",
                target.display(),
                fullpath.display()
            );
            let _ = std::fs::remove_dir_all(&target);
        }
        if let Some(parent) = target.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        tracing::info!("  symlink: {} -> {}", symlink, fullpath.display());
        if let Err(e) = std::os::unix::fs::symlink(&real, &target) {
            tracing::warn!("could not symlink {}: {}", target.display(), e);
        }
    }
}
