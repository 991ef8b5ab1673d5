use anyhow::Result;
use std::fs;

use crate::models::config::Config;

pub fn run(config: &Config) -> Result<()> {
    if config.cache_dir.exists() {
        fs::remove_dir_all(&config.cache_dir)?;
        log::info!("cleaned cache: {}", config.cache_dir.display());
    } else {
        log::debug!("cache missing: {}", config.cache_dir.display());
    }
    Ok(())
}
