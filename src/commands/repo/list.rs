use anyhow::Result;
use comfy_table::Table;

use crate::models::config::Config;
use crate::services::repo_index::RepoIndex;

pub fn run(config: &Config) -> Result<()> {
    let index = RepoIndex::new(config)?;
    let repos = index.repos()?;

    let mut table = Table::new();
    table.set_header(vec!["Repo", "Recipe", "Pattern", "Handler"]);
    for entry in index.entries()? {
        let repo_name = repos
            .iter()
            .find(|r| r.uuid == entry.repo_uuid)
            .map(|r| r.name.clone())
            .unwrap_or_default();
        table.add_row(vec![
            repo_name,
            entry.recipe_name,
            entry.pattern,
            entry.handler_name,
        ]);
    }
    println!("{table}");
    Ok(())
}
