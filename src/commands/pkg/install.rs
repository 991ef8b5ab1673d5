use anyhow::Result;

use crate::models::config::Config;
use crate::services::pkgs;

pub fn run(config: &Config, pkg_ref: &str) -> Result<()> {
    let prep = pkgs::prepare(config, &[pkg_ref.to_string()])?;
    for link in &prep.symlinks {
        println!("{} -> {}", link.target.display(), link.source.display());
    }
    Ok(())
}
