//! Generate `clone.bundle` files for CDN offload ("repo"-style). Bundles
//! are only regenerated when the repository fingerprint moved since the
//! last run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::git::GitRunner;
use crate::manifest;
use crate::repo;

#[derive(Debug, Clone)]
pub struct BundleOpts {
    pub outdir: PathBuf,
    /// Extra args passed to git itself (before `bundle`).
    pub gitargs: String,
    /// rev-list selection for the bundle contents.
    pub revlistargs: String,
    /// Skip repositories larger than this many GiB.
    pub maxsize: u64,
    pub include: Vec<String>,
}

pub fn run(config: &Config, opts: &BundleOpts) -> Result<i32> {
    let git = GitRunner::new(config.core.gitbin.clone(), config.git_timeouts());
    let toplevel = config.toplevel();
    let mani = manifest::read_manifest(&config.manifest_path())?;
    let include = repo::compile_globs(&opts.include);
    let gitargs: Vec<String> = opts.gitargs.split_whitespace().map(str::to_string).collect();
    let revlistargs: Vec<String> = opts
        .revlistargs
        .split_whitespace()
        .map(str::to_string)
        .collect();

    for gitdir in mani.repos.keys() {
        if !repo::matches_any(&include, gitdir)
            && !repo::matches_any(&include, gitdir.trim_start_matches('/'))
        {
            tracing::debug!("{} does not match include list, skipping", gitdir);
            continue;
        }
        let fullpath = repo::full_path(&toplevel, gitdir);
        let relative = gitdir.trim_start_matches('/').trim_end_matches(".git");
        let bundledir = opts.outdir.join(relative);
        std::fs::create_dir_all(&bundledir)?;

        let Some(fingerprint) = repo::repo_fingerprint(&git, &fullpath, false, &[])? else {
            tracing::debug!("{} has no refs, skipping", gitdir);
            continue;
        };

        let bfile = bundledir.join("clone.bundle");
        let bfprfile = bundledir.join(".fingerprint");
        if bfile.exists() {
            let recorded = std::fs::read_to_string(&bfprfile).unwrap_or_default();
            if recorded.trim() == fingerprint {
                tracing::info!("  skipped: {} (unchanged)", gitdir);
                continue;
            }
        }

        let size_gib = repo_size_kib(&git, &fullpath) / 1024 / 1024;
        if size_gib > opts.maxsize {
            tracing::info!("  skipped: {} ({} GiB > {} GiB)", gitdir, size_gib, opts.maxsize);
            continue;
        }

        let bfile_s = bfile.to_string_lossy().into_owned();
        let mut args: Vec<&str> = gitargs.iter().map(String::as_str).collect();
        args.extend(["bundle", "create", bfile_s.as_str()]);
        args.extend(revlistargs.iter().map(String::as_str));

        tracing::info!(" generate: {}", bfile.display());
        let out = git.run(
            Some(&fullpath),
            &args,
            None,
            Duration::from_secs(config.core.repack_timeout),
        )?;
        if out.ok() {
            std::fs::write(&bfprfile, &fingerprint)?;
        } else {
            tracing::error!("bundling {} failed: {}", gitdir, out.stderr.trim());
        }
    }
    Ok(0)
}

/// Size of the repo plus whatever it borrows through alternates, in KiB
/// (count-objects reports KiB).
fn repo_size_kib(git: &GitRunner, fullpath: &Path) -> u64 {
    let mut size = 0;
    if let Ok(info) = repo::object_info(git, fullpath) {
        size += info.size + info.size_pack;
        if info.alternate.is_some() {
            if let Some(altrepo) = repo::get_altrepo(fullpath) {
                size += repo_size_kib(git, &altrepo);
            }
        }
    }
    size
}
