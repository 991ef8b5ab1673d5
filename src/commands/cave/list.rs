use anyhow::Result;
use comfy_table::Table;

use crate::models::config::Config;
use crate::services::caves;

pub fn run(config: &Config) -> Result<()> {
    let mut table = Table::new();
    table.set_header(vec!["Name", "Workspace"]);
    for entry in caves::registry_entries(config)? {
        table.add_row(vec![
            entry.name,
            entry.workspace.to_string_lossy().into_owned(),
        ]);
    }
    println!("{table}");
    Ok(())
}
