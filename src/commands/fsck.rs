//! Thin handler for the `fsck` subcommand; the controller lives in
//! [`crate::fsck`].

use anyhow::Result;

use crate::config::Config;
use crate::fsck::{self, FsckOpts};

pub fn run(config: &Config, config_name: &str, opts: FsckOpts) -> Result<i32> {
    fsck::run(config, config_name, opts)
}
