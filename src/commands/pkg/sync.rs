use anyhow::Result;
use rayon::prelude::*;

use crate::models::config::Config;
use crate::models::package_ref::PackageRef;
use crate::services::pkgs;
use crate::services::repo_index::RepoIndex;

/// Forces re-discovery for every recipe/pattern matching the query and
/// refreshes the package registry.
pub fn run(config: &Config, query: &str) -> Result<()> {
    let package_ref = PackageRef::parse(query)?;
    let index = RepoIndex::new(config)?;
    let matches = index.resolve_query(&package_ref)?;

    matches.par_iter().try_for_each(|hit| -> Result<()> {
        let recipe = index.load_recipe(hit)?;
        let mut builds =
            recipe.execute_refresh(config, &hit.id, &package_ref.version, Some(&hit.pattern))?;
        for build in &mut builds {
            build.repo_uuid = hit.repo_uuid;
        }
        pkgs::record_discovery(config, hit.repo_uuid, &hit.id, &builds)?;
        log::info!(
            "{}/{} synced {} builds",
            hit.repo_name,
            hit.id,
            builds.len()
        );
        Ok(())
    })
}
