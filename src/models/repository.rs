use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One registered recipe source. `url` is `builtin://`, an absolute local
/// directory, or `http(s)://…` (remote sync not implemented yet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    pub uuid: Uuid,
    pub name: String,
    pub url: String,
}

pub const BUILTIN_REPO_NAME: &str = "builtin";
pub const BUILTIN_REPO_URL: &str = "builtin://";

impl RepoConfig {
    pub fn is_builtin(&self) -> bool {
        self.url == BUILTIN_REPO_URL
    }

    pub fn is_remote(&self) -> bool {
        self.url.starts_with("http://") || self.url.starts_with("https://")
    }
}

/// One `(pattern, handler)` of one recipe, flattened into the global index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub repo_uuid: Uuid,
    pub recipe_name: String,
    pub pattern: String,
    pub handler_name: String,
}

/// On-disk shape of `configDir/repo.json`. Repos and index stay flat tables
/// keyed by uuid; joins happen on load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepoFile {
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
    #[serde(default)]
    pub index: Vec<IndexEntry>,
}
