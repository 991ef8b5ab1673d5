use anyhow::Result;

use crate::models::config::Config;
use crate::services::repo_index::RepoIndex;

pub fn run(config: &Config) -> Result<()> {
    let index = RepoIndex::new(config)?;
    index.sync(true)?;
    log::info!("index rebuilt: {} patterns", index.entries()?.len());
    Ok(())
}
