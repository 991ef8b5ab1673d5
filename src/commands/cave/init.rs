use anyhow::{Context, Result};
use std::env;

use crate::models::config::Config;
use crate::services::caves;

pub fn run(config: &Config) -> Result<()> {
    let current_dir = env::current_dir().context("Failed to get current directory")?;
    let cave_config = caves::init(config, &current_dir)?;
    println!(
        "Initialized cave '{}' in {}",
        cave_config.name,
        cave_config.workspace.display()
    );
    Ok(())
}
