use anyhow::{Context, Result};
use std::env;

use crate::models::config::Config;
use crate::services::caves;

pub fn run(config: &Config) -> Result<()> {
    let current_dir = env::current_dir().context("Failed to get current directory")?;
    let cave = caves::find(config, &current_dir, None)?;

    println!("Cave Name: {}", cave.config.name);
    println!("Cave File: {}", cave.file.display());
    println!("Workspace: {}", cave.workspace().display());
    println!("Home:      {}", cave.home_path.display());

    for (name, settings) in &cave.config.variants {
        if name.is_empty() {
            println!("\nBase settings:");
        } else {
            println!("\nVariant :{}", name);
        }
        println!("  Packages: {:?}", settings.pkgs);
        println!("  Env:      {:?}", settings.env);
    }
    Ok(())
}
