use anyhow::{Context, Result};
use std::env;

use crate::models::config::Config;
use crate::services::caves;

pub fn run(config: &Config, pkg_ref: &str) -> Result<()> {
    let current_dir = env::current_dir().context("Failed to get current directory")?;
    caves::add_pkg(config, &current_dir, pkg_ref)
}
