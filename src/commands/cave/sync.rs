use anyhow::{Context, Result};
use std::env;

use crate::models::config::Config;
use crate::services::caves;

pub fn run(config: &Config, variant: Option<String>) -> Result<()> {
    let current_dir = env::current_dir().context("Failed to get current directory")?;
    let cave = caves::find(config, &current_dir, variant.as_deref())?;
    let prep = caves::sync(config, &cave)?;
    log::info!(
        "[{}] synced: {} symlinks, {} env vars",
        cave.qualified_name(),
        prep.symlinks.len(),
        prep.env.len()
    );
    Ok(())
}
