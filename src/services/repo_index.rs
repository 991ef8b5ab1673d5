use anyhow::{Context as _, Result};
use dashmap::DashMap;
use regex::Regex;
use std::fs;
use std::path::Path;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::errors::PiError;
use crate::models::config::Config;
use crate::models::package_ref::PackageRef;
use crate::models::repository::{
    BUILTIN_REPO_NAME, BUILTIN_REPO_URL, IndexEntry, RepoConfig, RepoFile,
};
use crate::recipe::Recipe;
use crate::services::store::JsonStore;

/// Outcome of matching a package id against the index: exactly one
/// `(repo, recipe, pattern)` plus the id with any repo scope stripped.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub repo_uuid: Uuid,
    pub repo_name: String,
    pub recipe_name: String,
    pub pattern: String,
    pub handler_name: String,
    pub id: String,
}

/// The registry of recipe sources and the flattened pattern index, persisted
/// at `configDir/repo.json`. Reads share the store's lock; `sync` rewrites
/// the index atomically and drops the in-memory caches.
pub struct RepoIndex {
    config: Config,
    store: JsonStore<RepoFile>,
    regexes: DashMap<String, Regex>,
    resolutions: DashMap<String, Resolution>,
}

impl RepoIndex {
    pub fn new(config: &Config) -> Result<Self> {
        let index = Self {
            config: config.clone(),
            store: JsonStore::new(config.repo_file()),
            regexes: DashMap::new(),
            resolutions: DashMap::new(),
        };
        index.init()?;
        Ok(index)
    }

    /// First-load initialization: the `builtin` repo always exists, and an
    /// empty index triggers an initial sync.
    fn init(&self) -> Result<()> {
        let missing_builtin = !self
            .store
            .get()?
            .repos
            .iter()
            .any(|r| r.name == BUILTIN_REPO_NAME);
        if missing_builtin {
            self.store.modify(|f| {
                f.repos.insert(
                    0,
                    RepoConfig {
                        uuid: Uuid::new_v4(),
                        name: BUILTIN_REPO_NAME.to_string(),
                        url: BUILTIN_REPO_URL.to_string(),
                    },
                );
                Ok(())
            })?;
        }
        if missing_builtin || self.store.get()?.index.is_empty() {
            self.sync(false)?;
        }
        Ok(())
    }

    pub fn repos(&self) -> Result<Vec<RepoConfig>> {
        Ok(self.store.get()?.repos.clone())
    }

    pub fn entries(&self) -> Result<Vec<IndexEntry>> {
        Ok(self.store.get()?.index.clone())
    }

    pub fn repo_by_uuid(&self, uuid: Uuid) -> Result<RepoConfig> {
        self.store
            .get()?
            .repos
            .iter()
            .find(|r| r.uuid == uuid)
            .cloned()
            .with_context(|| format!("Repo {} not in registry", uuid))
    }

    /// All recipes of one repo, loaded from its source.
    pub fn recipes_of(&self, repo: &RepoConfig) -> Result<Vec<Recipe>> {
        if repo.is_builtin() {
            return Ok(crate::build::BUILTIN_RECIPES
                .iter()
                .map(|(name, source)| {
                    Recipe::new(name.trim_end_matches(".star"), *source)
                })
                .collect());
        }
        if repo.is_remote() {
            return Err(PiError::UnsupportedFormat(format!(
                "remote repo '{}' ({}): sync over http(s) is not implemented",
                repo.name, repo.url
            ))
            .into());
        }
        let mut recipes = Vec::new();
        for entry in WalkDir::new(&repo.url)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "star"))
        {
            recipes.push(Recipe::from_file(entry.path())?);
        }
        recipes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(recipes)
    }

    /// Regenerates the whole index by re-registering every recipe of every
    /// repo, then persists and invalidates the caches.
    pub fn sync(&self, verbose: bool) -> Result<()> {
        let repos = self.repos()?;
        let mut entries = Vec::new();
        for repo in &repos {
            log::info!("[{}] syncing repo", repo.name);
            for recipe in self.recipes_of(repo)? {
                match recipe.registry(&self.config) {
                    Ok(registrations) => {
                        if verbose {
                            log::info!(
                                "[{}] {}: {} patterns",
                                repo.name,
                                recipe.name,
                                registrations.len()
                            );
                        }
                        entries.extend(registrations.into_iter().map(|r| IndexEntry {
                            repo_uuid: repo.uuid,
                            recipe_name: recipe.name.clone(),
                            pattern: r.pattern,
                            handler_name: r.handler,
                        }));
                    }
                    Err(e) => {
                        log::error!("[{}] eval failed {}: {:#}", repo.name, recipe.name, e)
                    }
                }
            }
        }
        self.store.modify(|f| {
            f.index = entries;
            Ok(())
        })?;
        self.store.save()?;
        self.regexes.clear();
        self.resolutions.clear();
        Ok(())
    }

    /// Registers a local recipe directory and syncs.
    pub fn add(&self, path: &Path) -> Result<()> {
        let abs = fs::canonicalize(path)
            .with_context(|| format!("Failed to resolve {}", path.display()))?;
        if !abs.is_dir() {
            return Err(PiError::validation(
                "repo path",
                format!("{} is not a directory", abs.display()),
            )
            .into());
        }
        let has_recipes = WalkDir::new(&abs)
            .into_iter()
            .filter_map(|e| e.ok())
            .any(|e| e.path().extension().is_some_and(|ext| ext == "star"));
        if !has_recipes {
            return Err(PiError::validation(
                "repo path",
                format!("{} contains no .star recipes", abs.display()),
            )
            .into());
        }

        let url = abs.to_string_lossy().into_owned();
        if self.store.get()?.repos.iter().any(|r| r.url == url) {
            return Err(PiError::validation(
                "repo path",
                format!("{} is already registered", url),
            )
            .into());
        }
        let name = abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());

        self.store.modify(|f| {
            f.repos.push(RepoConfig {
                uuid: Uuid::new_v4(),
                name: name.clone(),
                url,
            });
            Ok(())
        })?;
        self.store.save()?;
        log::info!("added repo: {} at {}", name, abs.display());
        self.sync(false)
    }

    /// Resolves a package ref to exactly one `(recipe, pattern)`.
    pub fn resolve(&self, package_ref: &PackageRef) -> Result<Resolution> {
        if let Some(hit) = self.resolutions.get(&package_ref.name) {
            return Ok(hit.clone());
        }
        let (_scope, matches) = self.matches(package_ref)?;
        match matches.len() {
            0 => Err(PiError::NoRecipe(package_ref.name.clone()).into()),
            1 => {
                let resolution = matches.into_iter().next().unwrap();
                self.resolutions
                    .insert(package_ref.name.clone(), resolution.clone());
                Ok(resolution)
            }
            _ => Err(ambiguous(&package_ref.name, &matches).into()),
        }
    }

    /// All matching `(recipe, pattern)` entries; used by multi-recipe
    /// operations (`pkg list`, `pkg sync`). Matches spanning several repos
    /// without an explicit scope are ambiguous.
    pub fn resolve_query(&self, package_ref: &PackageRef) -> Result<Vec<Resolution>> {
        let (scope, matches) = self.matches(package_ref)?;
        if matches.is_empty() {
            return Err(PiError::NoRecipe(package_ref.name.clone()).into());
        }
        if scope.is_none() {
            let mut repos: Vec<&str> = matches.iter().map(|m| m.repo_name.as_str()).collect();
            repos.dedup();
            if repos.len() > 1 {
                return Err(ambiguous(&package_ref.name, &matches).into());
            }
        }
        Ok(matches)
    }

    /// Loads the recipe behind a resolution from its repo source.
    pub fn load_recipe(&self, resolution: &Resolution) -> Result<Recipe> {
        let repo = self.repo_by_uuid(resolution.repo_uuid)?;
        self.recipes_of(&repo)?
            .into_iter()
            .find(|r| r.name == resolution.recipe_name)
            .with_context(|| {
                format!(
                    "Recipe '{}' vanished from repo '{}'",
                    resolution.recipe_name, repo.name
                )
            })
    }

    fn matches(&self, package_ref: &PackageRef) -> Result<(Option<String>, Vec<Resolution>)> {
        let file = self.store.get()?;
        let names: Vec<String> = file.repos.iter().map(|r| r.name.clone()).collect();
        let (scope, id) = package_ref.scoped(&names);
        let scope_uuid = scope.and_then(|s| {
            file.repos
                .iter()
                .find(|r| r.name == s)
                .map(|r| r.uuid)
        });

        let mut matches = Vec::new();
        for entry in &file.index {
            if let Some(uuid) = scope_uuid {
                if entry.repo_uuid != uuid {
                    continue;
                }
            }
            if self.regex_for(&entry.pattern)?.is_match(id) {
                let repo_name = file
                    .repos
                    .iter()
                    .find(|r| r.uuid == entry.repo_uuid)
                    .map(|r| r.name.clone())
                    .unwrap_or_default();
                matches.push(Resolution {
                    repo_uuid: entry.repo_uuid,
                    repo_name,
                    recipe_name: entry.recipe_name.clone(),
                    pattern: entry.pattern.clone(),
                    handler_name: entry.handler_name.clone(),
                    id: id.to_string(),
                });
            }
        }
        Ok((scope.map(|s| s.to_string()), matches))
    }

    fn regex_for(&self, pattern: &str) -> Result<Regex> {
        if let Some(re) = self.regexes.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern)
            .map_err(|e| PiError::validation(format!("pattern '{}'", pattern), e.to_string()))?;
        self.regexes.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

fn ambiguous(id: &str, matches: &[Resolution]) -> PiError {
    let mut candidates: Vec<String> = matches
        .iter()
        .map(|m| format!("({}, {}, {})", m.repo_name, m.recipe_name, m.pattern))
        .collect();
    candidates.sort();
    PiError::Ambiguous {
        id: id.to_string(),
        candidates,
    }
}
