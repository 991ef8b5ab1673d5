use anyhow::{Context as _, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::PiError;
use crate::models::build::PackageBuild;
use crate::models::config::Config;
use crate::models::package_ref::PackageRef;
use crate::services::installer::{self, InstallPlan};
use crate::services::lock::PathLock;
use crate::services::repo_index::RepoIndex;
use crate::services::resolver;
use crate::services::store::JsonStore;

/// One projection from a package install into the cave home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symlink {
    /// Absolute host path inside the package install.
    pub source: PathBuf,
    /// Relative path under the cave home.
    pub target: PathBuf,
}

/// Aggregated output of preparing all of a cave's packages.
#[derive(Debug, Clone, Default)]
pub struct PreparationResult {
    pub symlinks: Vec<Symlink>,
    pub env: BTreeMap<String, String>,
    pub pkg_dir: PathBuf,
    pub cache_dir: PathBuf,
}

/// On-disk shape of `configDir/package.json`: the cache of past discovery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackageRegistryFile {
    #[serde(default)]
    pub versions: Vec<PackageBuild>,
}

const PKG_ROOT_VAR: &str = "${PI_PKG_ROOT}";

/// Resolves, installs and projects every ref, fanning out one task per ref
/// on the worker pool. Symlinks aggregate in ref order; env entries union
/// with later refs overwriting (recipe authors keep keys disjoint). The
/// first failing ref aborts the whole preparation.
pub fn prepare(config: &Config, refs: &[String]) -> Result<PreparationResult> {
    let index = RepoIndex::new(config)?;
    let outcomes: Result<Vec<_>> = refs
        .par_iter()
        .map(|raw| {
            prepare_ref(config, &index, raw)
                .with_context(|| format!("Failed to prepare '{}'", raw))
        })
        .collect();

    let mut result = PreparationResult {
        pkg_dir: config.pkgs_dir.clone(),
        cache_dir: config.cache_dir.clone(),
        ..Default::default()
    };
    for (symlinks, env) in outcomes? {
        result.symlinks.extend(symlinks);
        result.env.extend(env);
    }
    Ok(result)
}

fn prepare_ref(
    config: &Config,
    index: &RepoIndex,
    raw: &str,
) -> Result<(Vec<Symlink>, BTreeMap<String, String>)> {
    let package_ref = PackageRef::parse(raw)?;
    let hit = index.resolve(&package_ref)?;
    let recipe = index.load_recipe(&hit)?;

    let mut builds = resolver::list(config, &recipe, &hit.pattern, &hit.id, &package_ref.version)?;
    for build in &mut builds {
        build.repo_uuid = hit.repo_uuid;
    }
    record_discovery(config, hit.repo_uuid, &hit.id, &builds)?;

    let build = resolver::pick(config, &hit.id, &package_ref.version, builds)?;
    let plan = InstallPlan::new(config, build.clone())?;
    installer::install(&plan)?;

    let symlinks = discover_symlinks(&plan.install_path, &build.symlinks)?;
    let env = resolve_env(&build.env, &plan.install_path);
    log::info!("[{}] prepared {} {}", hit.repo_name, build.name, build.version);
    Ok((symlinks, env))
}

/// Replaces the registry slice for `(repo_uuid, name)` with the fresh
/// discovery. Guarded by the path lock so concurrent preparations (in this
/// process or another) do not lose updates.
pub fn record_discovery(
    config: &Config,
    repo_uuid: uuid::Uuid,
    name: &str,
    builds: &[PackageBuild],
) -> Result<()> {
    let path = config.package_registry_file();
    let _lock = PathLock::acquire(&path)?;
    let store = JsonStore::<PackageRegistryFile>::new(&path);
    store.modify(|f| {
        f.versions
            .retain(|v| !(v.repo_uuid == repo_uuid && v.name == name));
        f.versions.extend(builds.iter().cloned());
        Ok(())
    })?;
    store.save()?;
    Ok(())
}

pub fn registered_versions(config: &Config) -> Result<Vec<PackageBuild>> {
    let store = JsonStore::<PackageRegistryFile>::new(config.package_registry_file());
    Ok(store.get()?.versions.clone())
}

/// Expands a symlink spec against an install directory.
///
/// A literal `"a/b" → "c/d"` entry is one link and its source must exist. A
/// trailing `/*` expands once over the directory's direct children, files
/// only, hidden files skipped. Without a spec the default `bin/*` →
/// `.local/bin` projection applies, tolerating packages that ship no `bin/`.
pub fn discover_symlinks(
    install_path: &Path,
    spec: &BTreeMap<String, String>,
) -> Result<Vec<Symlink>> {
    let default_spec;
    let (spec, declared) = if spec.is_empty() {
        default_spec = BTreeMap::from([("bin/*".to_string(), ".local/bin".to_string())]);
        (&default_spec, false)
    } else {
        (spec, true)
    };

    let mut symlinks = Vec::new();
    for (source_pattern, target) in spec {
        if let Some(dir) = source_pattern.strip_suffix("/*") {
            let source_dir = install_path.join(dir);
            if !source_dir.is_dir() {
                if declared {
                    return Err(PiError::validation(
                        "symlink spec",
                        format!("'{}' is not a directory in the install", source_pattern),
                    )
                    .into());
                }
                continue;
            }
            let mut entries: Vec<_> = fs::read_dir(&source_dir)
                .with_context(|| format!("Failed to read {}", source_dir.display()))?
                .filter_map(|e| e.ok())
                .collect();
            entries.sort_by_key(|e| e.file_name());
            for entry in entries {
                let file_name = entry.file_name();
                let name = file_name.to_string_lossy();
                if name.starts_with('.') {
                    continue;
                }
                if entry.path().is_dir() {
                    continue;
                }
                symlinks.push(Symlink {
                    source: entry.path(),
                    target: Path::new(target).join(file_name),
                });
            }
        } else {
            let source = install_path.join(source_pattern);
            if !source.exists() {
                return Err(PiError::validation(
                    "symlink spec",
                    format!("source '{}' missing from the install", source_pattern),
                )
                .into());
            }
            symlinks.push(Symlink {
                source,
                target: PathBuf::from(target),
            });
        }
    }
    Ok(symlinks)
}

/// Materializes links under `home`, replacing whatever sits at each target.
pub fn create_symlinks(home: &Path, symlinks: &[Symlink]) -> Result<()> {
    for link in symlinks {
        let dest = home.join(&link.target);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        if let Ok(meta) = fs::symlink_metadata(&dest) {
            if meta.is_dir() {
                fs::remove_dir_all(&dest)
            } else {
                fs::remove_file(&dest)
            }
            .with_context(|| format!("Failed to replace {}", dest.display()))?;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&link.source, &dest).with_context(|| {
            format!(
                "Failed to link {} -> {}",
                dest.display(),
                link.source.display()
            )
        })?;
    }
    Ok(())
}

/// Substitutes `${PI_PKG_ROOT}` in recipe-declared env values with the
/// actual install path.
pub fn resolve_env(
    env: &BTreeMap<String, String>,
    install_path: &Path,
) -> BTreeMap<String, String> {
    let root = install_path.to_string_lossy();
    env.iter()
        .map(|(k, v)| (k.clone(), v.replace(PKG_ROOT_VAR, &root)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::TempDir;

    fn test_config(root: &TempDir) -> Config {
        let mut config = Config::with_dirs(
            root.path().join("cache"),
            root.path().join("config"),
            root.path().join("state"),
        );
        config.host.os = crate::models::types::Os::Linux;
        config.host.arch = crate::models::types::Arch::X64;
        config
    }

    fn make_tar_gz(dest: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(dest).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    /// Writes a repo with one recipe serving `name` from a local tar.gz.
    fn write_archive_repo(root: &Path, pattern: &str, archive: &Path) -> PathBuf {
        let repo = root.join("local-repo");
        fs::create_dir_all(&repo).unwrap();
        let mut f = fs::File::create(repo.join("local.star")).unwrap();
        writeln!(f, "def discover(name):").unwrap();
        writeln!(f, "    add_version(").unwrap();
        writeln!(f, "        name = name,").unwrap();
        writeln!(f, "        version = '20.11.0',").unwrap();
        writeln!(f, "        release_status = 'stable',").unwrap();
        writeln!(f, "        release_date = '2024-01-01',").unwrap();
        writeln!(f, "        os = get_os(),").unwrap();
        writeln!(f, "        arch = get_arch(),").unwrap();
        writeln!(f, "        url = 'file://{}',", archive.display()).unwrap();
        writeln!(f, "        filename = '{}',", archive.file_name().unwrap().to_str().unwrap()).unwrap();
        writeln!(f, "        checksum = '',").unwrap();
        writeln!(f, "        env = {{}},").unwrap();
        writeln!(f, "        symlinks = {{}},").unwrap();
        writeln!(f, "    )").unwrap();
        writeln!(f, "register('{}', discover)", pattern).unwrap();
        repo
    }

    #[test]
    fn test_prepare_installs_and_projects_binaries() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let archive = root.path().join("n.tar.gz");
        make_tar_gz(&archive, &[("bin/node", b"#!/bin/sh\n")]);
        let repo = write_archive_repo(root.path(), "mynode", &archive);
        RepoIndex::new(&config).unwrap().add(&repo).unwrap();

        let prep = prepare(&config, &["mynode".to_string()]).unwrap();

        assert_eq!(prep.symlinks.len(), 1);
        let link = &prep.symlinks[0];
        assert_eq!(
            link.source,
            config.pkgs_dir.join("mynode-20.11.0-linux-x64/bin/node")
        );
        assert_eq!(link.target, Path::new(".local/bin/node"));
        assert!(prep.env.is_empty());
        assert_eq!(prep.pkg_dir, config.pkgs_dir);

        // Discovery lands in the package registry.
        let versions = registered_versions(&config).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].name, "mynode");
    }

    #[test]
    fn test_prepare_failure_propagates() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let err = prepare(&config, &["definitely-missing".to_string()]).unwrap_err();
        assert!(err.to_string().contains("definitely-missing"));
    }

    #[test]
    fn test_discover_symlinks_default_rule() {
        let root = TempDir::new().unwrap();
        let install = root.path().join("pkg");
        fs::create_dir_all(install.join("bin")).unwrap();
        fs::write(install.join("bin/tool"), "x").unwrap();
        fs::write(install.join("bin/.hidden"), "x").unwrap();
        fs::create_dir_all(install.join("bin/subdir")).unwrap();

        let links = discover_symlinks(&install, &BTreeMap::new()).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].source, install.join("bin/tool"));
        assert_eq!(links[0].target, Path::new(".local/bin/tool"));
    }

    #[test]
    fn test_discover_symlinks_default_tolerates_missing_bin() {
        let root = TempDir::new().unwrap();
        let install = root.path().join("pkg");
        fs::create_dir_all(&install).unwrap();
        assert!(discover_symlinks(&install, &BTreeMap::new()).unwrap().is_empty());
    }

    #[test]
    fn test_discover_symlinks_literal_entry() {
        let root = TempDir::new().unwrap();
        let install = root.path().join("pkg");
        fs::create_dir_all(&install).unwrap();
        fs::write(install.join("zig"), "x").unwrap();

        let spec = BTreeMap::from([("zig".to_string(), ".local/bin/zig".to_string())]);
        let links = discover_symlinks(&install, &spec).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].target, Path::new(".local/bin/zig"));

        let missing = BTreeMap::from([("nope".to_string(), "x".to_string())]);
        assert!(discover_symlinks(&install, &missing).is_err());
    }

    #[test]
    fn test_create_symlinks_replaces_existing() {
        let root = TempDir::new().unwrap();
        let home = root.path().join("home");
        let source = root.path().join("pkg/bin/node");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, "x").unwrap();

        let link = Symlink {
            source: source.clone(),
            target: PathBuf::from(".local/bin/node"),
        };
        let dest = home.join(".local/bin/node");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, "stale").unwrap();

        create_symlinks(&home, std::slice::from_ref(&link)).unwrap();
        let meta = fs::symlink_metadata(&dest).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(fs::read_link(&dest).unwrap(), source);

        // Idempotent re-link.
        create_symlinks(&home, std::slice::from_ref(&link)).unwrap();
        assert_eq!(fs::read_link(&dest).unwrap(), source);
    }

    #[test]
    fn test_resolve_env_substitutes_pkg_root() {
        let env = BTreeMap::from([(
            "ZIG_CACHE".to_string(),
            "${PI_PKG_ROOT}/.cache".to_string(),
        )]);
        let resolved = resolve_env(&env, Path::new("/pkgs/zig-1"));
        assert_eq!(resolved.get("ZIG_CACHE").unwrap(), "/pkgs/zig-1/.cache");
    }

    #[test]
    fn test_record_discovery_replaces_slice() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let uuid = uuid::Uuid::new_v4();
        let mk = |version: &str| PackageBuild {
            repo_uuid: uuid,
            name: "tool".to_string(),
            version: version.to_string(),
            release_status: "stable".to_string(),
            release_date: String::new(),
            os: crate::models::types::Os::Linux,
            arch: crate::models::types::Arch::X64,
            url: String::new(),
            filename: "t.tar.gz".to_string(),
            checksum: String::new(),
            env: BTreeMap::new(),
            symlinks: BTreeMap::new(),
        };

        record_discovery(&config, uuid, "tool", &[mk("1.0"), mk("1.1")]).unwrap();
        assert_eq!(registered_versions(&config).unwrap().len(), 2);

        record_discovery(&config, uuid, "tool", &[mk("2.0")]).unwrap();
        let versions = registered_versions(&config).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, "2.0");
    }
}
