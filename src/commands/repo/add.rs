use anyhow::Result;
use std::path::Path;

use crate::models::config::Config;
use crate::services::repo_index::RepoIndex;

pub fn run(config: &Config, path: &str) -> Result<()> {
    let index = RepoIndex::new(config)?;
    index.add(Path::new(path))
}
