use anyhow::Result;
use comfy_table::Table;
use rayon::prelude::*;

use crate::models::config::Config;
use crate::models::package_ref::PackageRef;
use crate::services::repo_index::RepoIndex;
use crate::services::resolver;

pub fn run(config: &Config, query: &str) -> Result<()> {
    let package_ref = PackageRef::parse(query)?;
    let index = RepoIndex::new(config)?;
    let matches = index.resolve_query(&package_ref)?;

    let rows: Result<Vec<Vec<Vec<String>>>> = matches
        .par_iter()
        .map(|hit| {
            let recipe = index.load_recipe(hit)?;
            let builds = resolver::list(
                config,
                &recipe,
                &hit.pattern,
                &hit.id,
                &package_ref.version,
            )?;
            Ok(builds
                .into_iter()
                .map(|b| {
                    vec![
                        hit.repo_name.clone(),
                        b.name,
                        b.version,
                        b.release_status,
                        b.release_date,
                        format!("{}-{}", b.os, b.arch),
                    ]
                })
                .collect())
        })
        .collect();

    let mut table = Table::new();
    table.set_header(vec!["Repo", "Package", "Version", "Status", "Date", "Target"]);
    for group in rows? {
        for row in group {
            table.add_row(row);
        }
    }
    println!("{table}");
    Ok(())
}
