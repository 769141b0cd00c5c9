//! The pull engine: fetch the remote manifest, compute the delta against
//! local state, fan repositories out to a worker pool, then purge, persist
//! the local manifest, and fire hooks. In daemon mode this repeats every
//! `pull.refresh` seconds, with a Unix socket feeding priority work
//! between passes.

pub mod delta;
pub mod remote;
pub mod socket;
pub mod worker;

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};

use crate::config::Config;
use crate::git::GitRunner;
use crate::hooks;
use crate::lock::{ManifestLock, RepoLock};
use crate::manifest::{self, Manifest};
use crate::objstore::Objstore;
use crate::repo;

use delta::{Action, Job};
use remote::RemoteManifest;
use worker::{JobResult, WorkerCtx};

#[derive(Debug, Clone, Copy, Default)]
pub struct PullOpts {
    pub nomtime: bool,
    pub purge: bool,
    pub force_purge: bool,
    pub runonce: bool,
}

#[derive(Debug, Default)]
pub struct PassStats {
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub purged: usize,
}

/// Entry point for the `pull` command. Returns the process exit code.
pub fn run(config: &Config, opts: PullOpts) -> Result<i32> {
    let git = GitRunner::new(config.core.gitbin.clone(), config.git_timeouts());
    let toplevel = config.toplevel();
    let objstore = Objstore::new(git.clone(), config.objstore_path());

    let ctx = WorkerCtx {
        git: git.clone(),
        toplevel: toplevel.clone(),
        obstdir: config.objstore_path(),
        site: config.remote.site.clone(),
        retries: config.pull.retries,
        lock_deadline: config.pull.refresh,
        default_owner: config.pull.default_owner.clone(),
        ffonly: repo::compile_globs(&config.pull.ffonly),
        ignore_refs: repo::compile_globs(&config.manifest.ignore_refs),
        objstore_uses_plumbing: config.core.objstore_uses_plumbing,
        preload_bundle_url: config.remote.preload_bundle_url.clone(),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))
        .context("Failed to register SIGTERM handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .context("Failed to register SIGINT handler")?;

    let (sock_tx, sock_rx) = unbounded::<String>();
    let listener = match (&config.pull.socket, opts.runonce) {
        (Some(sockpath), false) => Some(socket::SocketListener::spawn(
            sockpath.clone(),
            sock_tx,
            Arc::clone(&shutdown),
        )?),
        _ => None,
    };

    let mut totals = PassStats::default();
    let mut nomtime = opts.nomtime || !opts.runonce;
    loop {
        match run_pass(config, &git, &objstore, &ctx, &sock_rx, &shutdown, opts, nomtime) {
            Ok(stats) => {
                totals.updated += stats.updated;
                totals.failed += stats.failed;
                totals.skipped += stats.skipped;
                totals.purged += stats.purged;
            }
            Err(e) => {
                if opts.runonce {
                    return Err(e);
                }
                tracing::warn!("pass failed: {:#}", e);
            }
        }
        nomtime = false;

        if opts.runonce || shutdown.load(Ordering::Relaxed) {
            break;
        }

        // Sleep until the next refresh, waking early for socket pushes.
        tracing::info!(" manifest: sleeping {}s", config.pull.refresh);
        let deadline = Instant::now() + Duration::from_secs(config.pull.refresh);
        while Instant::now() < deadline {
            if shutdown.load(Ordering::Relaxed) || !sock_rx.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
    }

    if let Some(listener) = listener {
        shutdown.store(true, Ordering::Relaxed);
        listener.join();
    }

    tracing::info!(
        "{} repos updated, {} failed, {} skipped",
        totals.updated,
        totals.failed,
        totals.skipped
    );
    Ok(if totals.failed > 0 { 2 } else { 0 })
}

#[allow(clippy::too_many_arguments)]
fn run_pass(
    config: &Config,
    git: &GitRunner,
    objstore: &Objstore,
    ctx: &WorkerCtx,
    sock_rx: &Receiver<String>,
    shutdown: &Arc<AtomicBool>,
    opts: PullOpts,
    nomtime: bool,
) -> Result<PassStats> {
    let toplevel = config.toplevel();
    let manifile = config.manifest_path();
    let local = manifest::read_manifest(&manifile).unwrap_or_else(|e| {
        tracing::error!("local manifest unreadable, will regenerate: {:#}", e);
        Manifest::default()
    });

    let fetched = remote::fetch_remote_manifest(config, nomtime)?;
    let socket_paths: Vec<String> = sock_rx.try_iter().collect();

    let (remote_culled, last_modified) = match fetched {
        RemoteManifest::Fetched { manifest, last_modified } => {
            let include = repo::compile_globs(&config.pull.include);
            let exclude = repo::compile_globs(&config.pull.exclude);
            let mut culled = delta::cull_manifest(&manifest, &include, &exclude);
            let private = repo::compile_globs(&config.core.private);
            delta::annotate_entries(&mut culled, &local, &private);
            tracing::info!(" manifest: {} relevant entries", culled.len());
            (Some(culled), Some(last_modified))
        }
        RemoteManifest::Unchanged => (None, None),
    };

    // Assemble the queue: socket pushes first, then manifest-driven work.
    let mut pending: VecDeque<Job> = VecDeque::new();
    let reference = remote_culled.as_ref().unwrap_or(&local);
    for gitdir in socket_paths {
        match reference.repos.get(&gitdir) {
            Some(entry) => {
                let mut entry = entry.clone();
                // Force the fetch regardless of recorded fingerprints.
                entry.fingerprint = None;
                pending.push_back(Job { gitdir, entry, action: Action::Pull });
            }
            None => tracing::warn!(" listener: {} (not known, ignored)", gitdir),
        }
    }

    if let Some(remote_culled) = &remote_culled {
        let queued: HashSet<String> = pending.iter().map(|j| j.gitdir.clone()).collect();
        for job in delta::compute_jobs(git, &toplevel, &local, remote_culled, &ctx.ignore_refs) {
            if !queued.contains(&job.gitdir) {
                pending.push_back(job);
            }
        }
    }

    if pending.is_empty() && remote_culled.is_none() {
        return Ok(PassStats::default());
    }

    let results = dispatch(config, objstore, ctx, pending, sock_rx, shutdown, reference)?;

    let mut stats = PassStats::default();
    let mut changed_paths: Vec<PathBuf> = Vec::new();
    let mut cloned_paths: Vec<String> = Vec::new();
    let mut updates: Vec<(String, crate::manifest::RepoEntry)> = Vec::new();
    for result in &results {
        if result.skipped {
            stats.skipped += 1;
            continue;
        }
        if !result.success {
            if let Some(error) = &result.error {
                tracing::error!("{}: {}", result.gitdir, error);
            }
            stats.failed += 1;
            continue;
        }
        stats.updated += 1;
        if result.changed || result.action == Action::Init {
            changed_paths.push(repo::full_path(&toplevel, &result.gitdir));
        }
        if result.action == Action::Init {
            cloned_paths.push(
                repo::full_path(&toplevel, &result.gitdir)
                    .to_string_lossy()
                    .into_owned(),
            );
        }
        updates.push((result.gitdir.clone(), result.entry.clone()));
    }

    // Purges run strictly after all clones and updates are done.
    let mut purged: Vec<String> = Vec::new();
    if opts.purge {
        if let Some(remote_culled) = &remote_culled {
            purged = run_purge(config, &toplevel, remote_culled, opts.force_purge)?;
            stats.purged = purged.len();
        }
    }

    persist_manifest(config, &manifile, updates, &purged, last_modified)?;

    // Hooks fire only after the manifest hit the disk.
    for fullpath in &changed_paths {
        hooks::run_post_update_hooks(&config.pull.post_update_hook, fullpath);
    }
    hooks::run_post_clone_complete_hooks(&config.pull.post_clone_complete_hook, &cloned_paths);
    hooks::run_post_work_complete_hooks(&config.pull.post_work_complete_hook);

    Ok(stats)
}

/// Feed the worker pool. New-forkgroup clones are serialized: the first
/// member must land (and seed the objstore) before its siblings dispatch.
fn dispatch(
    config: &Config,
    objstore: &Objstore,
    ctx: &WorkerCtx,
    mut pending: VecDeque<Job>,
    sock_rx: &Receiver<String>,
    shutdown: &Arc<AtomicBool>,
    reference: &Manifest,
) -> Result<Vec<JobResult>> {
    let threads = config.pull_threads();
    let (job_tx, job_rx) = unbounded::<Job>();
    let (done_tx, done_rx) = unbounded::<JobResult>();

    let mut workers = Vec::new();
    for _ in 0..threads {
        let job_rx = job_rx.clone();
        let done_tx = done_tx.clone();
        let ctx = ctx.clone();
        let objstore = objstore.clone();
        workers.push(std::thread::spawn(move || {
            for job in job_rx.iter() {
                let result = worker::process_job(&ctx, &objstore, job);
                if done_tx.send(result).is_err() {
                    break;
                }
            }
        }));
    }
    drop(job_rx);
    drop(done_tx);

    let mut results = Vec::new();
    let mut held: Vec<Job> = Vec::new();
    let mut busy_forkgroups: HashSet<String> = HashSet::new();
    let mut queued: HashSet<String> = pending.iter().map(|j| j.gitdir.clone()).collect();
    let mut inflight = 0usize;
    let mut intake_open = true;
    let mut shutdown_at: Option<Instant> = None;

    loop {
        if shutdown.load(Ordering::Relaxed) && intake_open {
            tracing::info!("shutdown requested, finishing in-flight work");
            intake_open = false;
            shutdown_at = Some(Instant::now());
            for job in pending.drain(..).chain(held.drain(..)) {
                results.push(JobResult {
                    gitdir: job.gitdir,
                    entry: job.entry,
                    action: job.action,
                    success: false,
                    skipped: true,
                    changed: false,
                    error: None,
                });
            }
        }

        if intake_open {
            // Socket pushes arriving mid-pass jump the queue.
            for gitdir in sock_rx.try_iter() {
                if queued.contains(&gitdir) {
                    continue;
                }
                match reference.repos.get(&gitdir) {
                    Some(entry) => {
                        let mut entry = entry.clone();
                        entry.fingerprint = None;
                        queued.insert(gitdir.clone());
                        pending.push_front(Job { gitdir, entry, action: Action::Pull });
                    }
                    None => tracing::warn!(" listener: {} (not known, ignored)", gitdir),
                }
            }

            while let Some(job) = pending.pop_front() {
                match prepare_job(objstore, ctx, &job, &mut busy_forkgroups) {
                    Prepared::Dispatch => {
                        inflight += 1;
                        if job_tx.send(job).is_err() {
                            anyhow::bail!("worker pool died unexpectedly");
                        }
                    }
                    Prepared::Hold => held.push(job),
                    Prepared::Fail(reason) => {
                        tracing::warn!("   failed: {} ({})", job.gitdir, reason);
                        results.push(JobResult {
                            gitdir: job.gitdir,
                            entry: job.entry,
                            action: job.action,
                            success: false,
                            skipped: false,
                            changed: false,
                            error: Some(reason),
                        });
                    }
                }
            }
        }

        if inflight == 0 && pending.is_empty() && held.is_empty() {
            break;
        }
        if let Some(at) = shutdown_at {
            if at.elapsed() >= Duration::from_secs(config.pull.shutdown_grace) {
                tracing::warn!("shutdown grace expired with {} jobs in flight", inflight);
                break;
            }
        }

        match done_rx.recv_timeout(Duration::from_millis(500)) {
            Ok(result) => {
                inflight -= 1;
                if let Some(forkgroup) = &result.entry.forkgroup {
                    if busy_forkgroups.remove(forkgroup) {
                        // First member landed; siblings may now go.
                        let (ready, still_held): (Vec<Job>, Vec<Job>) = held
                            .drain(..)
                            .partition(|j| j.entry.forkgroup.as_deref() == Some(forkgroup));
                        held = still_held;
                        for job in ready {
                            pending.push_back(job);
                        }
                    }
                }
                tracing::info!("     done: {}", result.gitdir);
                results.push(result);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(job_tx);
    for handle in workers {
        let _ = handle.join();
    }
    // Late results from workers that were mid-job at disconnect.
    for result in done_rx.try_iter() {
        results.push(result);
    }
    Ok(results)
}

enum Prepared {
    Dispatch,
    Hold,
    Fail(String),
}

/// Controller-side setup that must not race between workers: objstore
/// creation and member enrollment happen here, serially.
fn prepare_job(
    objstore: &Objstore,
    ctx: &WorkerCtx,
    job: &Job,
    busy_forkgroups: &mut HashSet<String>,
) -> Prepared {
    let Some(forkgroup) = &job.entry.forkgroup else {
        return Prepared::Dispatch;
    };
    if busy_forkgroups.contains(forkgroup) {
        return Prepared::Hold;
    }
    if job.action != Action::Init {
        return Prepared::Dispatch;
    }

    let obstrepo = objstore.repo_path(forkgroup);
    let fullpath = repo::full_path(&ctx.toplevel, &job.gitdir);
    if !repo::is_bare_repo(&obstrepo) {
        if let Err(e) = objstore.setup_repo(forkgroup) {
            return Prepared::Fail(format!("could not create objstore repo: {}", e));
        }
        // Brand new family: let this first member finish before siblings
        // start borrowing from an empty store.
        busy_forkgroups.insert(forkgroup.clone());
    }
    if !job.entry.private {
        if let Err(e) = objstore.add_member(&obstrepo, &fullpath) {
            return Prepared::Fail(format!("could not enroll in objstore: {}", e));
        }
    }
    Prepared::Dispatch
}

/// Delete repositories that fell out of the manifest, honoring the
/// alternates-dependency rule and the purge quorum.
fn run_purge(
    config: &Config,
    toplevel: &std::path::Path,
    remote_culled: &Manifest,
    force: bool,
) -> Result<Vec<String>> {
    let nopurge = repo::compile_globs(&config.pull.nopurge);
    let ffonly = repo::compile_globs(&config.pull.ffonly);
    let (to_purge, found) = delta::compute_purge_set(toplevel, remote_culled, &nopurge, &ffonly);
    if to_purge.is_empty() {
        tracing::debug!("no repositories need purging");
        return Ok(Vec::new());
    }

    if !manifest::quorum_allows(
        found,
        to_purge.len(),
        config.pull.purge_quorum,
        config.pull.purge_threshold,
        force,
    ) {
        let refused = crate::error::RepoError::PurgeRefused {
            removed: to_purge.len(),
            total: found,
        };
        tracing::error!("{}; raise pull.purge_quorum or pass --force-purge", refused);
        return Ok(Vec::new());
    }

    let altmap = repo::build_altrepo_map(toplevel);
    let mut purged = Vec::new();
    for gitdir in to_purge {
        let fullpath = repo::full_path(toplevel, &gitdir);
        if fullpath.is_symlink() {
            tracing::info!("    purge: {}", gitdir);
            std::fs::remove_file(&fullpath)?;
            purged.push(gitdir);
            continue;
        }
        if repo::is_alt_repo(&altmap, &fullpath) {
            tracing::debug!(
                "not purging {} because other repos use it via alternates",
                gitdir
            );
            continue;
        }
        match RepoLock::acquire(&fullpath, false) {
            Ok(_lock) => {
                tracing::info!("    purge: {}", gitdir);
                std::fs::remove_dir_all(&fullpath)?;
                purged.push(gitdir);
            }
            Err(_) => {
                tracing::info!("    defer: {} (locked, will purge next pass)", gitdir);
            }
        }
    }
    Ok(purged)
}

/// Read-modify-write the local manifest under its lock, so concurrent
/// grokmirror processes never lose each other's entries.
fn persist_manifest(
    config: &Config,
    manifile: &std::path::Path,
    updates: Vec<(String, crate::manifest::RepoEntry)>,
    purged: &[String],
    last_modified: Option<i64>,
) -> Result<()> {
    if updates.is_empty() && purged.is_empty() {
        return Ok(());
    }
    let _mlock = ManifestLock::acquire(manifile)?;
    let mut current = manifest::read_manifest(manifile).unwrap_or_default();
    for (gitdir, mut entry) in updates {
        entry.private = false;
        current.repos.insert(gitdir, entry);
    }
    for gitdir in purged {
        current.repos.remove(gitdir);
    }
    if current.meta.version.is_none() {
        current.meta.version = Some(env!("CARGO_PKG_VERSION").to_string());
    }
    manifest::write_manifest(manifile, &current, config.manifest.pretty, last_modified)?;
    tracing::info!(" manifest: wrote {} ({} entries)", manifile.display(), current.len());

    write_projects_list(config, &current)?;
    Ok(())
}

/// cgit-compatible projects list: one path per line, no leading slash.
fn write_projects_list(config: &Config, manifest: &Manifest) -> Result<()> {
    let Some(plpath) = &config.pull.projectslist else {
        return Ok(());
    };
    let trimtop = &config.pull.projectslist_trimtop;
    let mut body = String::new();
    for (gitdir, entry) in &manifest.repos {
        let mut push_line = |path: &str| {
            let trimmed = if !trimtop.is_empty() && path.starts_with(trimtop.as_str()) {
                &path[trimtop.len()..]
            } else {
                path
            };
            body.push_str(trimmed.trim_start_matches('/'));
            body.push('\n');
        };
        push_line(gitdir);
        if config.pull.projectslist_symlinks {
            for symlink in &entry.symlinks {
                push_line(symlink);
            }
        }
    }

    let dir = plpath.parent().unwrap_or_else(|| std::path::Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    tmp.write_all(body.as_bytes())?;
    tmp.as_file_mut().sync_all()?;
    std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))?;
    tmp.persist(plpath)?;
    tracing::info!(" projlist: wrote {}", plpath.display());
    Ok(())
}
