//! Thin handler for the `pull` subcommand; the engine lives in
//! [`crate::pull`].

use anyhow::Result;

use crate::config::Config;
use crate::pull::{self, PullOpts};

pub fn run(config: &Config, opts: PullOpts) -> Result<i32> {
    let mut opts = opts;
    // A refresh-less one-shot setup stays one-shot even with --continuous.
    if config.pull.refresh == 0 {
        opts.runonce = true;
    }
    pull::run(config, opts)
}
