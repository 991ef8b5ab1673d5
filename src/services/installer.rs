use anyhow::{Context as _, Result};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::PiError;
use crate::models::build::PackageBuild;
use crate::models::config::Config;
use crate::services::fetch::fetch_to_file;
use crate::services::lock::ensure;
use crate::services::unarchiver;
use crate::utils::crypto::calculate_file_checksum;
use crate::utils::fs::tmp_sibling;

/// Deterministic paths for one build: identical inputs always hit the same
/// download and install locations, which is what makes installs idempotent
/// and resumable across processes.
#[derive(Debug, Clone)]
pub struct InstallPlan {
    pub build: PackageBuild,
    pub download_path: PathBuf,
    pub install_path: PathBuf,
}

impl InstallPlan {
    pub fn new(config: &Config, build: PackageBuild) -> Result<Self> {
        fs::create_dir_all(&config.download_dir)
            .with_context(|| format!("Failed to create {}", config.download_dir.display()))?;
        fs::create_dir_all(&config.pkgs_dir)
            .with_context(|| format!("Failed to create {}", config.pkgs_dir.display()))?;
        let download_path = config.download_dir.join(build.effective_filename());
        let install_path = config.pkgs_dir.join(build.install_dir_name());
        Ok(Self {
            build,
            download_path,
            install_path,
        })
    }
}

/// Download → verify → extract → publish.
///
/// Each stage runs under the per-path file lock, so exactly one process does
/// the work while others wait and then observe the result. A crash between
/// stages leaves a reusable download; a crash mid-extract leaves only an
/// `.tmp` directory that the next run wipes.
pub fn install(plan: &InstallPlan) -> Result<()> {
    if plan.install_path.is_dir() {
        log::debug!("already installed: {}", plan.install_path.display());
        return Ok(());
    }

    ensure(&plan.download_path, Duration::ZERO, || {
        log::info!(
            "downloading {} {} from {}",
            plan.build.name,
            plan.build.version,
            plan.build.url
        );
        fetch_to_file(&plan.build.url, &plan.download_path)?;
        verify_checksum(plan)
    })?;

    ensure(&plan.install_path, Duration::ZERO, || {
        let staging = tmp_sibling(&plan.install_path);
        if staging.exists() {
            fs::remove_dir_all(&staging)
                .with_context(|| format!("Failed to clear stale {}", staging.display()))?;
        }
        let extract = || -> Result<()> {
            fs::create_dir_all(&staging)?;
            unarchiver::unarchive(&plan.download_path, &staging)?;
            fs::rename(&staging, &plan.install_path)
                .with_context(|| format!("Failed to publish {}", plan.install_path.display()))?;
            Ok(())
        };
        extract().inspect_err(|_| {
            let _ = fs::remove_dir_all(&staging);
        })
    })
}

fn verify_checksum(plan: &InstallPlan) -> Result<()> {
    let expected = plan.build.checksum.trim();
    if expected.is_empty() {
        return Ok(());
    }
    let actual = calculate_file_checksum(&plan.download_path, expected.len())?;
    if !actual.eq_ignore_ascii_case(expected) {
        let _ = fs::remove_file(&plan.download_path);
        return Err(PiError::ChecksumMismatch {
            path: plan.download_path.clone(),
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::types::{Arch, Os};
    use crate::utils::crypto::sha256_hex;
    use std::collections::BTreeMap;
    use std::fs::File;
    use std::path::Path;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn test_config(root: &TempDir) -> Config {
        Config::with_dirs(
            root.path().join("cache"),
            root.path().join("config"),
            root.path().join("state"),
        )
    }

    fn make_tar_gz(dest: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(dest).unwrap();
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

    fn build_for(archive: &Path, checksum: &str) -> PackageBuild {
        PackageBuild {
            repo_uuid: Uuid::nil(),
            name: "tool".to_string(),
            version: "1.0".to_string(),
            release_status: "stable".to_string(),
            release_date: String::new(),
            os: Os::Linux,
            arch: Arch::X64,
            url: format!("file://{}", archive.display()),
            filename: "tool.tar.gz".to_string(),
            checksum: checksum.to_string(),
            env: BTreeMap::new(),
            symlinks: BTreeMap::new(),
        }
    }

    #[test]
    fn test_plan_paths_are_deterministic() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let build = build_for(Path::new("/src/tool.tar.gz"), "");
        let a = InstallPlan::new(&config, build.clone()).unwrap();
        let b = InstallPlan::new(&config, build).unwrap();
        assert_eq!(a.download_path, config.download_dir.join("tool.tar.gz"));
        assert_eq!(a.install_path, config.pkgs_dir.join("tool-1.0-linux-x64"));
        assert_eq!(a.install_path, b.install_path);
    }

    #[test]
    fn test_install_downloads_and_extracts() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let archive = root.path().join("tool.tar.gz");
        make_tar_gz(&archive, &[("bin/tool", b"#!/bin/sh\n")]);

        let plan = InstallPlan::new(&config, build_for(&archive, "")).unwrap();
        install(&plan).unwrap();

        assert!(plan.install_path.join("bin/tool").exists());
        assert!(plan.download_path.exists());
        assert!(!tmp_sibling(&plan.install_path).exists());
    }

    #[test]
    fn test_install_is_idempotent() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let archive = root.path().join("tool.tar.gz");
        make_tar_gz(&archive, &[("bin/tool", b"x")]);

        let plan = InstallPlan::new(&config, build_for(&archive, "")).unwrap();
        install(&plan).unwrap();
        let mtime = fs::metadata(&plan.install_path).unwrap().modified().unwrap();

        install(&plan).unwrap();
        assert_eq!(
            fs::metadata(&plan.install_path).unwrap().modified().unwrap(),
            mtime
        );
    }

    #[test]
    fn test_install_reuses_existing_download() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let archive = root.path().join("tool.tar.gz");
        make_tar_gz(&archive, &[("bin/tool", b"x")]);

        let plan = InstallPlan::new(&config, build_for(&archive, "")).unwrap();
        // Seed the download cache, then delete the origin: install must not
        // need the network again.
        fs::create_dir_all(&config.download_dir).unwrap();
        fs::copy(&archive, &plan.download_path).unwrap();
        fs::remove_file(&archive).unwrap();

        install(&plan).unwrap();
        assert!(plan.install_path.join("bin/tool").exists());
    }

    #[test]
    fn test_checksum_mismatch_removes_download() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let archive = root.path().join("tool.tar.gz");
        make_tar_gz(&archive, &[("bin/tool", b"x")]);

        let bogus = sha256_hex(b"not the archive");
        let plan = InstallPlan::new(&config, build_for(&archive, &bogus)).unwrap();
        let err = install(&plan).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PiError>(),
            Some(PiError::ChecksumMismatch { .. })
        ));
        assert!(!plan.download_path.exists());
        assert!(!plan.install_path.exists());
    }

    #[test]
    fn test_checksum_match_passes() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        let archive = root.path().join("tool.tar.gz");
        make_tar_gz(&archive, &[("bin/tool", b"x")]);
        let digest = sha256_hex(&fs::read(&archive).unwrap());

        let plan = InstallPlan::new(&config, build_for(&archive, &digest)).unwrap();
        install(&plan).unwrap();
        assert!(plan.install_path.join("bin/tool").exists());
    }

    #[test]
    fn test_failed_extract_leaves_no_partial_install() {
        let root = TempDir::new().unwrap();
        let config = test_config(&root);
        // A truncated archive: download succeeds, extraction fails.
        let archive = root.path().join("tool.tar.gz");
        fs::write(&archive, b"\x1f\x8b garbage").unwrap();

        let plan = InstallPlan::new(&config, build_for(&archive, "")).unwrap();
        assert!(install(&plan).is_err());
        assert!(!plan.install_path.exists());
        assert!(!tmp_sibling(&plan.install_path).exists());

        // The next run with a corrected archive succeeds.
        fs::remove_file(&plan.download_path).unwrap();
        make_tar_gz(&archive, &[("bin/tool", b"x")]);
        install(&plan).unwrap();
        assert!(plan.install_path.join("bin/tool").exists());
    }
}
