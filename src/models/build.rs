use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::types::{Arch, Os};
use crate::utils::fs::sanitize_name;

/// One concrete downloadable artifact for a (name, version, os, arch).
/// Produced by a recipe handler and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageBuild {
    /// Stamped by the caller after discovery; recipes do not know their repo.
    #[serde(default = "Uuid::nil")]
    pub repo_uuid: Uuid,
    pub name: String,
    pub version: String,
    pub release_status: String,
    pub release_date: String,
    pub os: Os,
    pub arch: Arch,
    pub url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checksum: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub symlinks: BTreeMap<String, String>,
}

impl PackageBuild {
    /// Directory name under `pkgDir`. Deterministic; names like `pip:numpy`
    /// are folded to filesystem-safe form.
    pub fn install_dir_name(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            sanitize_name(&self.name),
            self.version,
            self.os,
            self.arch
        )
    }

    /// Download filename: the declared one, else the URL basename, else a
    /// synthesized fallback for degenerate URLs.
    pub fn effective_filename(&self) -> String {
        if !self.filename.is_empty() {
            return self.filename.clone();
        }
        let base = self
            .url
            .rsplit('/')
            .next()
            .unwrap_or("")
            .split(['?', '#'])
            .next()
            .unwrap_or("");
        if base.is_empty() {
            format!("{}.bin", self.install_dir_name())
        } else {
            base.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(name: &str, url: &str, filename: &str) -> PackageBuild {
        PackageBuild {
            repo_uuid: Uuid::nil(),
            name: name.to_string(),
            version: "1.0".to_string(),
            release_status: "stable".to_string(),
            release_date: String::new(),
            os: Os::Linux,
            arch: Arch::X64,
            url: url.to_string(),
            filename: filename.to_string(),
            checksum: String::new(),
            env: BTreeMap::new(),
            symlinks: BTreeMap::new(),
        }
    }

    #[test]
    fn test_install_dir_name_sanitizes() {
        let b = build("pip:numpy", "https://x/y.tar.gz", "y.tar.gz");
        assert_eq!(b.install_dir_name(), "pip_numpy-1.0-linux-x64");
    }

    #[test]
    fn test_effective_filename_from_url() {
        let b = build("go", "https://dl.example/go1.22.tar.gz?sig=abc", "");
        assert_eq!(b.effective_filename(), "go1.22.tar.gz");
    }

    #[test]
    fn test_effective_filename_fallback() {
        let b = build("go", "https://dl.example/", "");
        assert_eq!(b.effective_filename(), "go-1.0-linux-x64.bin");
    }
}
