use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::PiError;
use crate::utils::fs::write_atomic;

/// Packages and environment of one variant. The empty-string variant is the
/// base every other variant overlays.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaveSettings {
    #[serde(default)]
    pub pkgs: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CaveSettings {
    /// Overlay `other`: packages concatenate, env entries override.
    pub fn merge(&mut self, other: &CaveSettings) {
        self.pkgs.extend(other.pkgs.iter().cloned());
        for (k, v) in &other.env {
            self.env.insert(k.clone(), v.clone());
        }
    }
}

/// The project-local `pi.cave.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaveConfig {
    #[serde(default)]
    pub name: String,
    pub workspace: PathBuf,
    /// A home name under `stateDir/homes/`, or an absolute path. Empty means
    /// a workspace-hash fallback.
    #[serde(default)]
    pub home: String,
    #[serde(default)]
    pub variants: BTreeMap<String, CaveSettings>,
}

impl CaveConfig {
    pub const FILENAME: &'static str = "pi.cave.json";

    pub fn new(workspace: PathBuf) -> Self {
        let name = workspace
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string());
        let mut variants = BTreeMap::new();
        variants.insert(String::new(), CaveSettings::default());
        Self {
            home: name.clone(),
            name,
            workspace,
            variants,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read cave file {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse cave file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize cave")?;
        write_atomic(path, content.as_bytes())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PiError::validation("cave config", "missing name").into());
        }
        if !self.workspace.is_absolute() {
            return Err(PiError::validation(
                "cave config",
                format!("workspace '{}' is not absolute", self.workspace.display()),
            )
            .into());
        }
        Ok(())
    }

    /// Base settings, overlaid with `variant` when non-empty: variant
    /// packages append, variant env wins.
    pub fn resolve_settings(&self, variant: &str) -> Result<CaveSettings> {
        let mut settings = self.variants.get("").cloned().unwrap_or_default();
        if !variant.is_empty() {
            let overlay = self.variants.get(variant).ok_or_else(|| {
                PiError::validation("variant", format!("'{}' not defined in cave", variant))
            })?;
            settings.merge(overlay);
        }
        Ok(settings)
    }

    /// Walks parent directories from `start` looking for `pi.cave.json`.
    pub fn find_in_ancestry(start: &Path) -> Option<(PathBuf, Self)> {
        let mut current = start.to_path_buf();
        loop {
            let cave_file = current.join(Self::FILENAME);
            if cave_file.exists() {
                match Self::load(&cave_file) {
                    Ok(config) => return Some((cave_file, config)),
                    Err(e) => {
                        log::error!("failed to load cave {}: {:#}", cave_file.display(), e)
                    }
                }
            }
            if !current.pop() {
                break;
            }
        }
        None
    }
}

/// A loaded cave ready for prepare/launch.
#[derive(Debug, Clone)]
pub struct Cave {
    pub config: CaveConfig,
    pub file: PathBuf,
    pub home_path: PathBuf,
    pub variant: String,
}

impl Cave {
    pub fn workspace(&self) -> &Path {
        &self.config.workspace
    }

    /// `name` or `name:variant`; the value of `PI_CAVENAME` inside the jail.
    pub fn qualified_name(&self) -> String {
        if self.variant.is_empty() {
            self.config.name.clone()
        } else {
            format!("{}:{}", self.config.name, self.variant)
        }
    }
}

/// One row of the global cave registry at `configDir/cave.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaveEntry {
    pub name: String,
    pub workspace: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaveRegistryFile {
    #[serde(default)]
    pub caves: Vec<CaveEntry>,
}
