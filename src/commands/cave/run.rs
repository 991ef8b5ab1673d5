use anyhow::{Context, Result};
use std::env;

use crate::models::cave::Cave;
use crate::models::config::Config;
use crate::services::caves;
use crate::services::pkgs;
use crate::services::sandbox::{self, LaunchOptions};

/// `cave run` / `cave enter`: sandbox the cave found from the current
/// directory. An empty command falls back to a shell inside the launcher.
pub fn run(config: &Config, variant: Option<String>, command: Vec<String>) -> Result<()> {
    let current_dir = env::current_dir().context("Failed to get current directory")?;
    let cave = caves::find(config, &current_dir, variant.as_deref())?;
    launch(config, cave, command)
}

/// `cave use <name[:variant]>`: sandbox a registered cave from anywhere.
pub fn use_named(config: &Config, target: &str) -> Result<()> {
    let cave = caves::find_by_name(config, target)?;
    launch(config, cave, Vec::new())
}

fn launch(config: &Config, cave: Cave, command: Vec<String>) -> Result<()> {
    let settings = cave.config.resolve_settings(&cave.variant)?;
    let prep = pkgs::prepare(config, &settings.pkgs)?;
    log::debug!(
        "[{}] launching with {} symlinks",
        cave.qualified_name(),
        prep.symlinks.len()
    );
    // Replaces the process on success.
    sandbox::launch(&LaunchOptions {
        config,
        cave: &cave,
        settings: &settings,
        prep: &prep,
        command: &command,
    })
}
