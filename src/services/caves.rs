use anyhow::{Context as _, Result};
use std::env;
use std::path::{Path, PathBuf};

use crate::errors::PiError;
use crate::models::cave::{Cave, CaveConfig, CaveEntry, CaveRegistryFile};
use crate::models::config::Config;
use crate::models::package_ref::PackageRef;
use crate::services::pkgs::{self, PreparationResult};
use crate::services::store::JsonStore;
use crate::utils::crypto::sha256_hex;

/// Locates the cave for the current invocation.
///
/// Precedence: an explicit `PI_WORKSPACE`, then the registry entry named by
/// `PI_CAVENAME`, then an ancestry walk from `cwd`. The variant comes from
/// the `PI_CAVENAME` suffix when present, else from `variant_flag`.
pub fn find(config: &Config, cwd: &Path, variant_flag: Option<&str>) -> Result<Cave> {
    if let Ok(workspace) = env::var("PI_WORKSPACE") {
        if !workspace.is_empty() {
            let file = Path::new(&workspace).join(CaveConfig::FILENAME);
            return load(config, &file, variant_flag.unwrap_or("").to_string());
        }
    }

    if let Some(current) = config.current_cave() {
        let (name, variant) = split_qualified(&current);
        let workspace = lookup(config, name)?;
        let variant = if variant.is_empty() {
            variant_flag.unwrap_or("").to_string()
        } else {
            variant.to_string()
        };
        return load(config, &workspace.join(CaveConfig::FILENAME), variant);
    }

    let (file, _) = CaveConfig::find_in_ancestry(cwd).ok_or_else(|| PiError::NotAWorkspace {
        start: cwd.to_path_buf(),
    })?;
    load(config, &file, variant_flag.unwrap_or("").to_string())
}

/// Loads a cave by registry name, as used by `cave use <name[:variant]>`.
pub fn find_by_name(config: &Config, qualified: &str) -> Result<Cave> {
    let (name, variant) = split_qualified(qualified);
    let workspace = lookup(config, name)?;
    load(
        config,
        &workspace.join(CaveConfig::FILENAME),
        variant.to_string(),
    )
}

fn split_qualified(qualified: &str) -> (&str, &str) {
    match qualified.split_once(':') {
        Some((name, variant)) => (name, variant),
        None => (qualified, ""),
    }
}

fn load(config: &Config, file: &Path, variant: String) -> Result<Cave> {
    let cave_config = CaveConfig::load(file)?;
    let home_path = home_path(config, &cave_config);
    Ok(Cave {
        config: cave_config,
        file: file.to_path_buf(),
        home_path,
        variant,
    })
}

/// The sandboxed home backing this cave: an absolute `home`, a named
/// directory under `stateDir/homes/`, or a workspace-hash fallback.
pub fn home_path(config: &Config, cave_config: &CaveConfig) -> PathBuf {
    if !cave_config.home.is_empty() {
        let declared = Path::new(&cave_config.home);
        if declared.is_absolute() {
            return declared.to_path_buf();
        }
        return config.homes_dir.join(&cave_config.home);
    }
    let digest = sha256_hex(cave_config.workspace.to_string_lossy().as_bytes());
    config.homes_dir.join(&digest[..12])
}

/// Creates `pi.cave.json` in `dir` (unless present) and registers the cave.
pub fn init(config: &Config, dir: &Path) -> Result<CaveConfig> {
    let file = dir.join(CaveConfig::FILENAME);
    if file.exists() {
        return Err(PiError::validation(
            "cave",
            format!("already initialized in {}", dir.display()),
        )
        .into());
    }
    let workspace = dir
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", dir.display()))?;
    let cave_config = CaveConfig::new(workspace);
    cave_config.save(&file)?;
    register(config, &cave_config.name, cave_config.workspace.clone())?;
    Ok(cave_config)
}

/// Upserts a registry entry by name.
pub fn register(config: &Config, name: &str, workspace: PathBuf) -> Result<()> {
    let store = registry_store(config);
    store.modify(|f| {
        if let Some(entry) = f.caves.iter_mut().find(|c| c.name == name) {
            entry.workspace = workspace.clone();
        } else {
            f.caves.push(CaveEntry {
                name: name.to_string(),
                workspace: workspace.clone(),
            });
        }
        Ok(())
    })?;
    store.save()?;
    Ok(())
}

pub fn registry_entries(config: &Config) -> Result<Vec<CaveEntry>> {
    Ok(registry_store(config).get()?.caves.clone())
}

fn lookup(config: &Config, name: &str) -> Result<PathBuf> {
    registry_entries(config)?
        .into_iter()
        .find(|c| c.name == name)
        .map(|c| c.workspace)
        .with_context(|| format!("Cave '{}' is not registered", name))
}

fn registry_store(config: &Config) -> JsonStore<CaveRegistryFile> {
    JsonStore::new(config.cave_registry_file())
}

/// Appends `pkg_ref` to the base variant unless already present.
pub fn add_pkg(config: &Config, cwd: &Path, pkg_ref: &str) -> Result<()> {
    PackageRef::parse(pkg_ref)?;
    let cave = find(config, cwd, None)?;
    let mut cave_config = cave.config;
    let base = cave_config.variants.entry(String::new()).or_default();
    if base.pkgs.iter().any(|p| p == pkg_ref) {
        log::info!("[{}] already lists {}", cave_config.name, pkg_ref);
        return Ok(());
    }
    base.pkgs.push(pkg_ref.to_string());
    cave_config.save(&cave.file)?;
    log::info!("[{}] added {}", cave_config.name, pkg_ref);
    Ok(())
}

/// Prepares all packages of the cave's resolved settings; no sandbox spawns.
pub fn sync(config: &Config, cave: &Cave) -> Result<PreparationResult> {
    let settings = cave.config.resolve_settings(&cave.variant)?;
    pkgs::prepare(config, &settings.pkgs)
}
