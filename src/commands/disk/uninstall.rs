use anyhow::Result;
use std::fs;

use crate::models::config::Config;

pub fn run(config: &Config, confirm: bool) -> Result<()> {
    if !confirm {
        println!("This would remove:");
        for dir in [&config.cache_dir, &config.config_dir, &config.state_dir] {
            println!("  {}", dir.display());
        }
        println!("Re-run with --confirm to proceed.");
        return Ok(());
    }
    for dir in [&config.cache_dir, &config.config_dir, &config.state_dir] {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
            log::info!("removed {}", dir.display());
        }
    }
    Ok(())
}
