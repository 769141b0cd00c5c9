//! The fsck/repack controller: one staggered pass over every repository the
//! local manifest knows, deciding per repo whether to repack, prune, fsck,
//! or mark it for reclone. Fork detection and objstore consolidation run
//! here too, not in the pull engine.

pub mod report;
pub mod status;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Local, NaiveDate};
use glob::Pattern;
use rand::Rng;

use crate::config::Config;
use crate::error::RepoError;
use crate::git::GitRunner;
use crate::lock::{ManifestLock, RepoLock};
use crate::manifest::{self, Manifest};
use crate::objstore::{self, Objstore};
use crate::repo::{self, RepoKind};

use report::Report;
use status::{RepoStatus, StatusFile, DATE_FMT};

#[derive(Debug, Clone, Copy, Default)]
pub struct FsckOpts {
    pub force: bool,
    pub repack_only: bool,
    pub conn_only: bool,
    pub repack_all_quick: bool,
    pub repack_all_full: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Repack(u8),
    Fsck,
}

pub fn run(config: &Config, config_name: &str, opts: FsckOpts) -> Result<i32> {
    let mut opts = opts;
    if opts.repack_all_quick || opts.repack_all_full {
        opts.force = true;
    }

    let statusfile = config.statusfile_path();
    // One controller at a time; a second invocation is a clean no-op.
    let _controller_lock = match ManifestLock::try_acquire(&statusfile) {
        Ok(lock) => lock,
        Err(RepoError::LockBusy(_)) => {
            tracing::info!("another fsck process is running, exiting");
            return Ok(0);
        }
        Err(e) => return Err(e).context("could not lock status file"),
    };

    let mut ctrl = Controller::new(config, opts)?;
    ctrl.sync_with_manifest()?;
    ctrl.recover_crashed_repacks();
    ctrl.consolidate_forks()?;
    ctrl.maintain_objstores()?;
    let queue = ctrl.decide();
    ctrl.process(queue)?;

    ctrl.report.send(&config.fsck, config_name)?;
    Ok(if ctrl.failures > 0 { 2 } else { 0 })
}

struct Controller<'a> {
    config: &'a Config,
    opts: FsckOpts,
    git: GitRunner,
    objstore: Objstore,
    toplevel: PathBuf,
    obstdir: PathBuf,
    status: StatusFile,
    manifest: Manifest,
    manifest_changed: bool,
    altmap: std::collections::BTreeMap<PathBuf, BTreeSet<PathBuf>>,
    private_masks: Vec<Pattern>,
    ignore_refs: Vec<Pattern>,
    report: Report,
    failures: usize,
    today: NaiveDate,
    commitgraph: bool,
}

impl<'a> Controller<'a> {
    fn new(config: &'a Config, opts: FsckOpts) -> Result<Controller<'a>> {
        let git = GitRunner::new(config.core.gitbin.clone(), config.git_timeouts());
        let toplevel = config.toplevel();
        let obstdir = config.objstore_path();
        let status = StatusFile::load(&config.statusfile_path())?;
        let manifile = config.manifest_path();
        let manifest = {
            let _mlock = ManifestLock::acquire(&manifile)?;
            manifest::read_manifest(&manifile)?
        };
        tracing::info!("analyzing {} ({} repos)", manifile.display(), manifest.len());

        let mut commitgraph = config.fsck.commitgraph;
        if commitgraph && !git.newer_than("2.18.0") {
            tracing::info!("git too old to support commit graphs, disabling");
            commitgraph = false;
        }

        Ok(Controller {
            config,
            opts,
            objstore: Objstore::new(git.clone(), obstdir.clone()),
            git,
            altmap: repo::build_altrepo_map(&toplevel),
            toplevel,
            obstdir,
            status,
            manifest,
            manifest_changed: false,
            private_masks: repo::compile_globs(&config.core.private),
            ignore_refs: repo::compile_globs(&config.manifest.ignore_refs),
            report: Report::new(),
            failures: 0,
            today: Local::now().date_naive(),
            commitgraph,
        })
    }

    fn is_private(&self, gitdir: &str) -> bool {
        repo::matches_any(&self.private_masks, gitdir)
    }

    fn is_provider(&self, fullpath: &Path) -> bool {
        repo::is_alt_repo(&self.altmap, fullpath)
    }

    /// Drop vanished repos from manifest and status; stagger first checks
    /// of newly-seen ones across the whole frequency window.
    fn sync_with_manifest(&mut self) -> Result<()> {
        let frequency = self.config.fsck.frequency.max(1);
        let mut rng = rand::thread_rng();

        let gitdirs: Vec<String> = self.manifest.repos.keys().cloned().collect();
        for gitdir in gitdirs {
            let fullpath = repo::full_path(&self.toplevel, &gitdir);
            if !fullpath.is_dir() {
                tracing::debug!("{} is gone, dropping from manifest", gitdir);
                self.manifest.repos.remove(&gitdir);
                self.status.remove(&fullpath);
                self.manifest_changed = true;
                continue;
            }
            if !self.status.contains(&fullpath) {
                let delay = if self.opts.force {
                    0
                } else {
                    rng.gen_range(0..=frequency) as i64
                };
                let nextcheck = self.today + ChronoDuration::days(delay);
                let entry = self.status.entry(&fullpath);
                *entry = RepoStatus::new_with_nextcheck(nextcheck);
                // Fresh mirrors arrive packed; age the full repack from now.
                entry.lastfullrepack = Some(self.today.format(DATE_FMT).to_string());
                tracing::info!("    added: {} (next check {})", gitdir, entry.nextcheck);
            }
        }

        // Objstore repos are tracked in status but not in the manifest.
        for obstrepo in self.objstore.all_repos() {
            if !self.status.contains(&obstrepo) {
                let entry = self.status.entry(&obstrepo);
                *entry = RepoStatus::new_with_nextcheck(self.today);
            }
        }

        self.persist_manifest_if_changed()?;
        self.status.save()?;
        Ok(())
    }

    fn persist_manifest_if_changed(&mut self) -> Result<()> {
        if !self.manifest_changed {
            return Ok(());
        }
        let manifile = self.config.manifest_path();
        let mtime = manifest::file_mtime(&manifile);
        let _mlock = ManifestLock::acquire(&manifile)?;
        // Repo contents didn't change, so keep the old mtime: replicas
        // shouldn't refetch because of bookkeeping.
        manifest::write_manifest(&manifile, &self.manifest, self.config.manifest.pretty, mtime)?;
        self.manifest_changed = false;
        Ok(())
    }

    /// A pass that died inside a repack window left preciousObjects off;
    /// restore it before deciding new work.
    fn recover_crashed_repacks(&mut self) {
        let paths: Vec<PathBuf> = self.status.repos.keys().map(PathBuf::from).collect();
        for fullpath in paths {
            if repo::repack_sentinel_present(&fullpath) {
                tracing::warn!(
                    "restoring preciousObjects after interrupted repack in {}",
                    fullpath.display()
                );
                let _ = self
                    .git
                    .config_set(&fullpath, "extensions.preciousObjects", "true");
                repo::clear_repack_sentinel(&fullpath);
            }
        }
    }

    /// Discover fork families and wire them into shared object storage;
    /// migrate legacy 1.x alternates along the way.
    fn consolidate_forks(&mut self) -> Result<()> {
        let candidates = repo::find_all_gitdirs(&self.toplevel, &[], true);

        // First the repos that already have alternates: broken parents,
        // legacy layouts, and copied-in members that nobody enrolled.
        let mut no_alternates: Vec<PathBuf> = Vec::new();
        for fullpath in &candidates {
            if fullpath.is_symlink() {
                continue;
            }
            let gitdir = repo::gitdir_name(&self.toplevel, fullpath);
            match repo::get_altrepo(fullpath) {
                None => no_alternates.push(fullpath.clone()),
                Some(altdir) if !altdir.is_dir() => {
                    self.report
                        .critical(format!("  reclone: {} (alternates repo gone)", gitdir));
                    let _ = repo::set_reclone(fullpath, "Alternates repository gone");
                }
                Some(altdir) if !repo::is_obstrepo(&altdir, &self.obstdir) => {
                    self.migrate_legacy(fullpath, &gitdir, &altdir);
                }
                Some(altdir) => {
                    // Member with an objstore alternate: make sure the
                    // objstore actually tracks it (repos copied in from
                    // elsewhere won't be).
                    if !self.is_private(&gitdir) {
                        if let Ok(None) = self.objstore.find_repo_for(fullpath) {
                            tracing::info!(
                                " reconfig: {} to fetch into {}",
                                gitdir,
                                altdir.display()
                            );
                            let _ = self.objstore.add_member(&altdir, fullpath);
                        }
                    }
                    self.record_family(&altdir)?;
                }
            }
        }

        // Fork detection proper: equivalence classes over root commits.
        let families = objstore::fork_families(&self.git, &no_alternates);
        for (root, members) in families {
            tracing::debug!("fork family at root {}: {} members", root, members.len());
            if let Err(e) = self.promote_family(&members) {
                self.report.critical(format!(
                    "could not consolidate fork family ({} repos): {:#}",
                    members.len(),
                    e
                ));
            }
        }

        self.persist_manifest_if_changed()?;
        Ok(())
    }

    fn migrate_legacy(&mut self, fullpath: &Path, gitdir: &str, altdir: &Path) {
        tracing::info!("{}: migrating legacy alternates", gitdir);
        match self.objstore.migrate_legacy(
            fullpath,
            altdir,
            self.config.core.objstore_uses_plumbing,
        ) {
            Ok(obstrepo) => {
                self.altmap = repo::build_altrepo_map(&self.toplevel);
                let _ = self.record_family(&obstrepo);
                // Both repos now borrow from the objstore; empty them out.
                self.repack_repo(altdir, 1);
                self.repack_repo(fullpath, 1);
            }
            Err(e) => {
                // Never partially rewired; the repo still works as it was.
                self.report.critical(format!("{}", e));
            }
        }
    }

    /// Put a detected family into a (new or existing) objstore repo.
    fn promote_family(&mut self, members: &BTreeSet<PathBuf>) -> Result<()> {
        let public: Vec<&PathBuf> = members
            .iter()
            .filter(|m| !self.is_private(&repo::gitdir_name(&self.toplevel, m)))
            .collect();
        if public.is_empty() {
            tracing::debug!("fork family is entirely private, leaving alone");
            return Ok(());
        }

        // Join an objstore any member already uses, else make a fresh one.
        let obstrepo = match members
            .iter()
            .find_map(|m| self.objstore.find_repo_for(m).ok().flatten())
        {
            Some(existing) => existing,
            None => {
                let forkgroup = Objstore::random_forkgroup();
                let obstrepo = self.objstore.setup_repo(&forkgroup)?;
                tracing::info!(
                    "     init: new objstore repo {}",
                    obstrepo.file_name().unwrap_or_default().to_string_lossy()
                );
                obstrepo
            }
        };

        for member in members {
            let gitdir = repo::gitdir_name(&self.toplevel, member);
            tracing::info!("{}: can use {}", gitdir, obstrepo.display());
            if !self.is_private(&gitdir) {
                self.objstore.add_member(&obstrepo, member)?;
                tracing::info!("    fetch: {}", gitdir);
                self.objstore.fetch_member(
                    &obstrepo,
                    member,
                    self.config.core.objstore_uses_plumbing,
                )?;
            }
            self.objstore.wire_alternates(member, &obstrepo)?;
            self.repack_repo(member, 1);
        }

        self.altmap = repo::build_altrepo_map(&self.toplevel);
        if !self.status.contains(&obstrepo) {
            let entry = self.status.entry(&obstrepo);
            *entry = RepoStatus::new_with_nextcheck(self.today);
        }
        self.record_family(&obstrepo)?;
        Ok(())
    }

    /// Refresh forkgroup/reference info in the manifest for one family.
    /// The first member (sorted) is the legacy `reference` anchor.
    fn record_family(&mut self, obstrepo: &Path) -> Result<()> {
        let forkgroup = obstrepo
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut members: Vec<String> = Vec::new();
        for (_, url) in self.git.remote_list_with_urls(obstrepo)? {
            let path = PathBuf::from(&url);
            if path.starts_with(&self.toplevel) {
                members.push(repo::gitdir_name(&self.toplevel, &path));
            }
        }
        members.sort();
        let anchor = members.first().cloned();
        for gitdir in &members {
            let Some(entry) = self.manifest.repos.get_mut(gitdir) else {
                continue;
            };
            let reference = if Some(gitdir) == anchor.as_ref() {
                None
            } else {
                anchor.clone()
            };
            if entry.forkgroup.as_deref() != Some(forkgroup.as_str())
                || entry.reference != reference
            {
                entry.forkgroup = Some(forkgroup.clone());
                entry.reference = reference;
                self.manifest_changed = true;
            }
        }
        Ok(())
    }

    /// Objstore upkeep: drop remotes nobody uses, delete stores that back
    /// nothing, refresh stale members.
    fn maintain_objstores(&mut self) -> Result<()> {
        for obstrepo in self.objstore.all_repos() {
            let real = std::fs::canonicalize(&obstrepo).unwrap_or_else(|_| obstrepo.clone());
            let users = self.altmap.get(&real).cloned().unwrap_or_default();

            for (virtref, url) in self.git.remote_list_with_urls(&obstrepo)? {
                let member = PathBuf::from(&url);
                let member_real =
                    std::fs::canonicalize(&member).unwrap_or_else(|_| member.clone());
                if !member.is_dir() || !users.contains(&member_real) {
                    tracing::info!(
                        "{}: removing remote {} (no longer used)",
                        obstrepo.display(),
                        url
                    );
                    self.objstore.remove_member(&obstrepo, &member)?;
                    continue;
                }
                // Fetch only when the member's fingerprint moved.
                let l_fp = std::fs::read_to_string(
                    obstrepo.join(format!("grokmirror.{}.fingerprint", virtref)),
                )
                .ok();
                let r_fp = repo::read_cached_fingerprint(&member);
                if l_fp.map(|s| s.trim().to_string()) != r_fp {
                    let gitdir = repo::gitdir_name(&self.toplevel, &member);
                    tracing::info!("    fetch: {} -> {}", gitdir, obstrepo.display());
                    self.objstore.fetch_member(
                        &obstrepo,
                        &member,
                        self.config.core.objstore_uses_plumbing,
                    )?;
                }
            }

            if users.is_empty() && self.objstore.is_deletable(&obstrepo)? {
                tracing::info!(
                    "{}: deleting (no longer used by anything)",
                    obstrepo.display()
                );
                self.status.remove(&obstrepo);
                std::fs::remove_dir_all(&obstrepo)?;
            }
        }
        self.status.save()?;
        Ok(())
    }

    /// Build the work queue: repack decisions first, then fsck scheduling.
    fn decide(&mut self) -> Vec<(PathBuf, Work)> {
        let mut queue = Vec::new();
        let paths: Vec<PathBuf> = self.status.repos.keys().map(PathBuf::from).collect();
        for fullpath in paths {
            if !fullpath.is_dir() {
                self.status.remove(&fullpath);
                continue;
            }
            if let Some(work) = self.decide_one(&fullpath) {
                match work {
                    Work::Repack(level) if level > 1 => {
                        tracing::info!("   queued: {} (full repack)", fullpath.display())
                    }
                    Work::Repack(_) => tracing::info!("   queued: {} (repack)", fullpath.display()),
                    Work::Fsck => tracing::info!("   queued: {} (fsck)", fullpath.display()),
                }
                queue.push((fullpath, work));
            }
        }
        queue
    }

    fn decide_one(&mut self, fullpath: &Path) -> Option<Work> {
        let info = match repo::object_info(&self.git, fullpath) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!("unable to count objects in {}: {}", fullpath.display(), e);
                return None;
            }
        };

        let entry = self.status.get(fullpath).cloned().unwrap_or_default();
        let fsck_due = self
            .opts
            .force
            .then_some(true)
            .or_else(|| entry.nextcheck_date().map(|d| d <= self.today))
            .unwrap_or(true);

        let kind = repo::classify(fullpath, &self.obstdir);
        let repack_level = if !self.config.fsck.repack {
            None
        } else if self.opts.repack_all_full && (info.count > 0 || info.packs > 1) {
            Some(2)
        } else if self.opts.repack_all_quick && info.count > 0 {
            Some(1)
        } else if kind == RepoKind::Objstore && entry.lastrepack.is_none() {
            // Fresh objstore: a full repack lays out the delta islands.
            Some(2)
        } else if self.full_repack_due(&entry) {
            Some(2)
        } else if info.count >= self.config.fsck.loose_obj_threshold
            || info.packs >= self.config.fsck.packs_threshold
        {
            Some(1)
        } else {
            None
        };

        // precious=always repos only get touched on the fsck schedule; the
        // price of never cleaning loose objects is deliberate.
        let repack_level = if self.config.fsck.precious == "always" && repack_level.is_some() {
            if fsck_due {
                Some(2)
            } else {
                None
            }
        } else {
            repack_level
        };

        if let Some(level) = repack_level {
            return Some(Work::Repack(level));
        }
        if self.opts.repack_only || self.opts.repack_all_quick || self.opts.repack_all_full {
            return None;
        }
        if fsck_due {
            return Some(Work::Fsck);
        }

        // No repack and no fsck due; prune garbage if we spot any.
        if info.garbage > 0 && self.prune_expire_for(fullpath).is_some() {
            if let Ok(_lock) = RepoLock::acquire(fullpath, false) {
                tracing::info!(
                    "  garbage: {} ({} files, {} KiB)",
                    fullpath.display(),
                    info.garbage,
                    info.size_garbage
                );
                self.prune_repo(fullpath);
            }
        }
        None
    }

    /// Full repacks are age-driven: one per `full_repack_every` days, with
    /// a couple days of jitter so the fleet doesn't thunder together.
    fn full_repack_due(&self, entry: &RepoStatus) -> bool {
        let Some(last) = entry.lastfullrepack_date() else {
            return false;
        };
        let jitter = self.config.fsck.full_repack_jitter as i64;
        let spread = rand::thread_rng().gen_range(-jitter..=jitter);
        let every = self.config.fsck.full_repack_every as i64 + spread;
        last + ChronoDuration::days(every.max(1)) <= self.today
    }

    fn process(&mut self, queue: Vec<(PathBuf, Work)>) -> Result<()> {
        if queue.is_empty() {
            tracing::info!("no repos need attention");
            return Ok(());
        }
        tracing::info!("processing {} repositories", queue.len());

        let frequency = self.config.fsck.frequency.max(1);
        let mut done = 0usize;
        for (fullpath, work) in &queue {
            let _lock = match RepoLock::acquire(fullpath, false) {
                Ok(lock) => lock,
                Err(_) => {
                    tracing::warn!("  skipped: {} (locked)", fullpath.display());
                    continue;
                }
            };
            tracing::info!("{}:", fullpath.display());
            let start = Instant::now();

            let checkdelay = if self.opts.force {
                rand::thread_rng().gen_range(1..=frequency) as i64
            } else {
                frequency as i64
            };
            let nextcheck = (self.today + ChronoDuration::days(checkdelay))
                .format(DATE_FMT)
                .to_string();
            let todayiso = self.today.format(DATE_FMT).to_string();

            let ok = match work {
                Work::Repack(level) => {
                    let ok = self.repack_repo(fullpath, *level);
                    if ok {
                        let entry = self.status.entry(fullpath);
                        entry.lastrepack = Some(todayiso.clone());
                        if *level > 1 {
                            entry.lastfullrepack = Some(todayiso.clone());
                            entry.lastcheck = todayiso.clone();
                            entry.nextcheck = nextcheck.clone();
                            entry.quick_repack_count = 0;
                        } else {
                            entry.quick_repack_count += 1;
                        }
                    }
                    ok
                }
                Work::Fsck => {
                    self.fsck_repo(fullpath);
                    let entry = self.status.entry(fullpath);
                    entry.lastcheck = todayiso.clone();
                    entry.nextcheck = nextcheck.clone();
                    true
                }
            };
            if !ok {
                self.failures += 1;
            }

            let elapsed = start.elapsed().as_secs();
            let fingerprint = repo::repo_fingerprint(&self.git, fullpath, true, &self.ignore_refs)
                .ok()
                .flatten();
            {
                let entry = self.status.entry(fullpath);
                entry.s_elapsed = Some(elapsed);
                entry.fingerprint = fingerprint;
            }
            done += 1;
            tracing::info!("     done: {}s ({}/{})", elapsed, done, queue.len());

            // Persist after each repo so a killed pass doesn't recheck
            // everything it already covered.
            self.status.save()?;
        }
        Ok(())
    }

    /// Assemble repack flags by repository kind and run the repack, with
    /// preciousObjects handled around the window. Returns success.
    fn repack_repo(&mut self, fullpath: &Path, level: u8) -> bool {
        let kind = repo::classify(fullpath, &self.obstdir);
        let provider = self.is_provider(fullpath);
        let always_precious = self.config.fsck.precious == "always";
        let prune_expire = self.prune_expire_for(fullpath);

        let mut flags: Vec<String> = Vec::new();
        let mut gen_commitgraph = true;
        match kind {
            RepoKind::Objstore => {
                flags.push("-a".into());
                if prune_expire.is_none() && !always_precious {
                    flags.push("-k".into());
                }
            }
            RepoKind::Member | RepoKind::LegacyAlternates => {
                // Everything lives in the alternate; locals get evicted.
                gen_commitgraph = false;
                flags.push("-a".into());
                flags.push("-l".into());
                if provider {
                    tracing::warn!(
                        "{} has alternates and provides alternates; grandchild corruption risk",
                        fullpath.display()
                    );
                    flags.pop();
                    flags.pop();
                    flags.push("-A".into());
                    flags.push("-l".into());
                }
            }
            RepoKind::Standalone => {
                flags.push("-a".into());
                if provider {
                    if !always_precious {
                        flags.push("-k".into());
                    }
                } else {
                    // Bitmaps only make sense when nobody borrows from us.
                    flags.push("-b".into());
                }
            }
        }
        if level > 1 {
            tracing::info!("   repack: performing a full repack for optimal deltas");
            flags.push("-f".into());
            flags.push("--pack-kept-objects".into());
            for extra in &self.config.fsck.extra_repack_flags_full {
                flags.push(extra.clone());
            }
        }
        if !always_precious {
            flags.push("-d".into());
        }
        if let Some(size) = &self.config.fsck.max_pack_size {
            flags.push(format!("--max-pack-size={}", size));
        }
        for extra in &self.config.fsck.extra_repack_flags {
            flags.push(extra.clone());
        }
        flags.push("-q".into());

        // preciousObjects off for the window, sentinel guarding a crash.
        let was_precious = repo::is_precious(&self.git, fullpath);
        let restore_precious = if always_precious {
            let _ = self
                .git
                .config_set(fullpath, "extensions.preciousObjects", "true");
            false
        } else if was_precious {
            let _ = repo::set_repack_sentinel(fullpath);
            let _ = self
                .git
                .config_set(fullpath, "extensions.preciousObjects", "false");
            true
        } else {
            false
        };

        if fullpath.join("logs").is_dir() {
            tracing::info!("   reflog: expiring reflogs");
            let _ = self.git.run(
                Some(fullpath),
                &["reflog", "expire", "--all", "--stale-fix"],
                None,
                std::time::Duration::from_secs(self.config.core.repack_timeout),
            );
        }

        let flag_refs: Vec<&str> = flags.iter().map(String::as_str).collect();
        tracing::info!("   repack: repacking with \"{}\"", flags.join(" "));
        let mut ok = true;
        match self.git.repack(fullpath, &flag_refs) {
            Ok(out) => {
                let warnings = self.split_stderr(&out.stderr);
                if !out.ok() || !warnings.is_empty() {
                    ok = out.ok() && warnings.is_empty();
                    if !ok {
                        self.report.critical(format!(
                            "repacking {} returned critical errors:",
                            fullpath.display()
                        ));
                        for line in &warnings {
                            self.report.critical(format!("\t{}", line));
                        }
                        self.maybe_reclone(fullpath, &warnings);
                    }
                }
            }
            Err(e) => {
                self.report
                    .critical(format!("repacking {} failed: {}", fullpath.display(), e));
                ok = false;
            }
        }

        if ok {
            if gen_commitgraph && self.commitgraph {
                let _ = self.git.config_set(fullpath, "core.commitGraph", "true");
                tracing::info!("    graph: generating commit-graph");
                let _ = self.git.commit_graph_write(fullpath);
            }
            let _ = self.git.pack_refs(fullpath, level > 1);
            if prune_expire.is_some() {
                ok = self.prune_repo(fullpath);
            }
        }

        if restore_precious {
            let _ = self
                .git
                .config_set(fullpath, "extensions.preciousObjects", "true");
            repo::clear_repack_sentinel(fullpath);
        }
        ok
    }

    /// The expire policy for this repo, or None when pruning must not run.
    /// Alternates providers only ever prune conservatively, and not at all
    /// when objects are precious.
    fn prune_expire_for(&self, fullpath: &Path) -> Option<String> {
        if !self.config.fsck.prune {
            return None;
        }
        let kind = repo::classify(fullpath, &self.obstdir);
        let provider = self.is_provider(fullpath) || kind == RepoKind::Objstore;
        if !provider {
            return Some(self.config.fsck.prune_expire.clone());
        }
        if self.config.fsck.precious != "no" {
            return None;
        }
        if kind == RepoKind::Objstore {
            // Only prune a store whose borrowers are all enrolled remotes;
            // an unenrolled (private) borrower could lose objects.
            let real = std::fs::canonicalize(fullpath).unwrap_or_else(|_| fullpath.to_path_buf());
            let users = self.altmap.get(&real).cloned().unwrap_or_default();
            let remotes: BTreeSet<PathBuf> = self
                .git
                .remote_list_with_urls(fullpath)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(_, url)| std::fs::canonicalize(url).ok())
                .collect();
            if users != remotes {
                return None;
            }
        }
        Some("2.weeks.ago".to_string())
    }

    fn prune_repo(&mut self, fullpath: &Path) -> bool {
        let Some(expire) = self.prune_expire_for(fullpath) else {
            return true;
        };
        tracing::info!("    prune: pruning with --expire={}", expire);
        match self.git.prune(fullpath, &expire) {
            Ok(out) => {
                let warnings = self.split_stderr(&out.stderr);
                if !out.ok() || !warnings.is_empty() {
                    self.report.critical(format!(
                        "pruning {} returned critical errors:",
                        fullpath.display()
                    ));
                    for line in &warnings {
                        self.report.critical(format!("\t{}", line));
                    }
                    self.maybe_reclone(fullpath, &warnings);
                    return false;
                }
                true
            }
            Err(e) => {
                self.report
                    .critical(format!("pruning {} failed: {}", fullpath.display(), e));
                false
            }
        }
    }

    fn fsck_repo(&mut self, fullpath: &Path) {
        if self.opts.conn_only {
            tracing::info!("     fsck: running with --connectivity-only");
        } else {
            tracing::info!("     fsck: running full checks");
        }
        match self.git.fsck(fullpath, self.opts.conn_only) {
            Ok(out) => {
                let mut combined = out.stdout.clone();
                combined.push('\n');
                combined.push_str(&out.stderr);
                let warnings = self.split_stderr(&combined);
                if !warnings.is_empty() {
                    self.report
                        .critical(format!("{} has critical errors:", fullpath.display()));
                    for line in &warnings {
                        self.report.critical(format!("\t{}", line));
                    }
                    self.maybe_reclone(fullpath, &warnings);
                    self.failures += 1;
                }
            }
            Err(e) => {
                self.report
                    .critical(format!("fsck of {} failed: {}", fullpath.display(), e));
                self.failures += 1;
            }
        }
    }

    /// Split subprocess stderr into ignorable noise (logged at debug) and
    /// lines an operator needs to see.
    fn split_stderr(&self, stderr: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        for line in stderr.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if self
                .config
                .fsck
                .ignore_errors
                .iter()
                .any(|pat| line.contains(pat.as_str()))
            {
                tracing::debug!("stderr: {}", line);
            } else {
                warnings.push(line.to_string());
            }
        }
        warnings
    }

    /// Write the reclone mark when stderr matches any of the configured
    /// trigger substrings. Alternates providers are never auto-recloned:
    /// deleting one corrupts its borrowers.
    fn maybe_reclone(&mut self, fullpath: &Path, warnings: &[String]) {
        let Some(hit) = warnings.iter().find(|line| {
            self.config
                .fsck
                .reclone_on_errors
                .iter()
                .any(|pat| line.contains(pat.as_str()))
        }) else {
            return;
        };
        if self.is_provider(fullpath) || repo::classify(fullpath, &self.obstdir) == RepoKind::Objstore
        {
            self.report.critical(format!(
                "{} used for alternates, not requesting auto-reclone",
                fullpath.display()
            ));
            return;
        }
        self.report
            .critical(format!("  reclone: {} ({})", fullpath.display(), hit));
        let _ = repo::set_reclone(fullpath, hit);
    }
}
