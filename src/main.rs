//! grokmirror: replicate and maintain large collections of bare git
//! repositories from a manifest published by an origin server.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod commands;
mod config;
mod error;
mod fsck;
mod git;
mod hooks;
mod lock;
mod manifest;
mod objstore;
mod pull;
mod repo;

use config::Config;

#[derive(Parser)]
#[command(name = "grokmirror")]
#[command(version, about = "Smartly mirror large collections of git repositories")]
struct Cli {
    /// Location of the configuration file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Be verbose and tell us what you are doing
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the manifest from repositories under the toplevel
    Manifest {
        /// Limit to these repositories (full or toplevel-relative paths)
        paths: Vec<PathBuf>,

        /// Use the current timestamp instead of parsing commits
        #[arg(short = 'n', long)]
        use_now: bool,

        /// Export only repositories marked git-daemon-export-ok
        #[arg(long)]
        check_export_ok: bool,

        /// Purge deleted repositories from the manifest
        #[arg(short, long)]
        purge: bool,

        /// Remove the given repositories from the manifest
        #[arg(short = 'x', long)]
        remove: bool,

        /// Pretty-print the manifest (sort keys and indent)
        #[arg(short = 'y', long)]
        pretty: bool,

        /// Ignore these paths when finding repositories (shell globbing)
        #[arg(short, long)]
        ignore_paths: Vec<String>,

        /// Wait for the manifest to exist before updating (multi-writer)
        #[arg(short, long)]
        wait_for_manifest: bool,

        /// Fetch updates into the objstore repo afterwards
        #[arg(short = 'o', long)]
        fetch_objstore: bool,
    },

    /// Create or update a mirror from the remote manifest
    Pull {
        /// Run without checking the remote manifest mtime
        #[arg(short = 'n', long)]
        no_mtime_check: bool,

        /// Remove local repositories that left the manifest
        #[arg(short, long)]
        purge: bool,

        /// Purge even past the safety quorum
        #[arg(long)]
        force_purge: bool,

        /// Keep running, refreshing every pull.refresh seconds
        #[arg(short = 'o', long)]
        continuous: bool,
    },

    /// Check and optimize mirrored repositories
    Fsck {
        /// Run on all repositories regardless of schedule
        #[arg(short, long)]
        force: bool,

        /// Only repack repositories that need optimizing
        #[arg(long)]
        repack_only: bool,

        /// Pass --connectivity-only to git fsck
        #[arg(long)]
        connectivity_only: bool,

        /// Quick-repack all repositories (implies --force)
        #[arg(long)]
        repack_all_quick: bool,

        /// Full-repack all repositories (implies --force)
        #[arg(long)]
        repack_all_full: bool,
    },

    /// Generate clone.bundle files for CDN offload
    Bundle {
        /// Where to store bundle files
        #[arg(short, long)]
        outdir: PathBuf,

        /// Extra args to pass to git
        #[arg(short, long, default_value = "-c core.compression=9")]
        gitargs: String,

        /// rev-list args selecting bundle contents
        #[arg(short, long, default_value = "--branches HEAD")]
        revlistargs: String,

        /// Skip repositories larger than this (GiB)
        #[arg(short = 's', long, default_value_t = 2)]
        maxsize: u64,

        /// Repositories to bundle (shell globbing)
        #[arg(short, long)]
        include: Vec<String>,
    },

    /// Fetch remotes in repositories not managed by grokmirror
    DumbPull {
        /// Repositories (or trees of repositories) to pull
        paths: Vec<PathBuf>,

        /// The remotes are Subversion (use git-svn fetch)
        #[arg(short, long)]
        svn: bool,

        /// Only fetch remotes matching these names (shell globbing)
        #[arg(short, long)]
        remote_names: Vec<String>,

        /// Run this hook after each updated repository
        #[arg(short = 'u', long)]
        post_update_hook: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {:#}", e);
            return ExitCode::from(1);
        }
    };

    if let Err(e) = init_logging(&config, cli.verbose) {
        eprintln!("ERROR: could not set up logging: {:#}", e);
        return ExitCode::from(1);
    }

    let config_name = cli
        .config
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let result = match cli.command {
        Commands::Manifest {
            paths,
            use_now,
            check_export_ok,
            purge,
            remove,
            pretty,
            ignore_paths,
            wait_for_manifest,
            fetch_objstore,
        } => commands::manifest::run(
            &config,
            &commands::manifest::ManifestOpts {
                paths,
                usenow: use_now,
                check_export_ok,
                purge,
                remove,
                pretty,
                ignore: ignore_paths,
                wait: wait_for_manifest,
                fetch_objstore,
            },
        ),
        Commands::Pull { no_mtime_check, purge, force_purge, continuous } => {
            commands::pull::run(
                &config,
                pull::PullOpts {
                    nomtime: no_mtime_check,
                    purge: purge || config.pull.purge,
                    force_purge,
                    runonce: !continuous,
                },
            )
        }
        Commands::Fsck {
            force,
            repack_only,
            connectivity_only,
            repack_all_quick,
            repack_all_full,
        } => commands::fsck::run(
            &config,
            &config_name,
            fsck::FsckOpts {
                force,
                repack_only,
                conn_only: connectivity_only,
                repack_all_quick,
                repack_all_full,
            },
        ),
        Commands::Bundle { outdir, gitargs, revlistargs, maxsize, include } => {
            let include = if include.is_empty() {
                vec!["*".to_string()]
            } else {
                include
            };
            commands::bundle::run(
                &config,
                &commands::bundle::BundleOpts { outdir, gitargs, revlistargs, maxsize, include },
            )
        }
        Commands::DumbPull { paths, svn, remote_names, post_update_hook } => {
            commands::dumb_pull::run(
                &config,
                &commands::dumb_pull::DumbPullOpts {
                    paths,
                    remotes: remote_names,
                    posthook: post_update_hook,
                    svn,
                },
            )
        }
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

/// Every subcommand wants a config except dumb-pull, which operates on
/// explicitly-passed repositories and can run with defaults.
fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => match cli.command {
            Commands::DumbPull { .. } => Ok(Config::default()),
            _ => anyhow::bail!("-c/--config is required (see --help)"),
        },
    }
}

/// Console gets the terse stream (info, or debug with -v); `core.log`
/// additionally receives a timestamped file log at `core.loglevel`.
fn init_logging(config: &Config, verbose: bool) -> Result<()> {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let console_filter = if verbose { "debug" } else { "info" };
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(console_filter));

    let registry = tracing_subscriber::registry().with(console);
    match &config.core.log {
        Some(logfile) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(logfile)
                .with_context(|| format!("Failed to open log file {}", logfile.display()))?;
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(std::sync::Mutex::new(file))
                .with_filter(EnvFilter::new(config.core.loglevel.clone()));
            registry.with(file_layer).init();
        }
        None => registry.init(),
    }
    Ok(())
}
