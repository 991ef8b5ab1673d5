use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use xz2::read::XzDecoder;
use zip::ZipArchive;

use crate::errors::PiError;
use crate::models::types::Os;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarZst,
    TarXz,
    TarGz,
    Tar,
}

/// Detects the archive format from the filename suffix.
pub fn detect(filename: &str) -> Result<ArchiveFormat, PiError> {
    if filename.ends_with(".zip") {
        Ok(ArchiveFormat::Zip)
    } else if filename.ends_with(".tar.zst") {
        Ok(ArchiveFormat::TarZst)
    } else if filename.ends_with(".tar.xz") {
        Ok(ArchiveFormat::TarXz)
    } else if filename.ends_with(".tar.gz") || filename.ends_with(".tgz") {
        Ok(ArchiveFormat::TarGz)
    } else if filename.ends_with(".tar") {
        Ok(ArchiveFormat::Tar)
    } else {
        Err(PiError::UnsupportedFormat(format!("archive '{}'", filename)))
    }
}

/// Archive suffixes the resolver accepts for builds targeting `os`.
pub fn allowed_extensions(os: Os) -> &'static [&'static str] {
    match os {
        Os::Linux | Os::Unknown => &[".tar.gz", ".tar.zst", ".tar.xz", ".tgz", ".tar"],
        Os::Darwin => &[".tar.gz", ".tar.zst", ".tar.xz", ".tgz", ".tar", ".zip"],
        Os::Windows => &[".zip"],
    }
}

/// Extracts `src` into `dest`. Every entry path is joined lexically and must
/// stay beneath `dest`; an escaping entry fails the whole extraction before
/// anything of it is written.
pub fn unarchive(src: &Path, dest: &Path) -> Result<()> {
    let filename = src.file_name().and_then(|n| n.to_str()).unwrap_or("");
    let format = detect(filename)?;

    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create directory {}", dest.display()))?;

    let open = || File::open(src).with_context(|| format!("Failed to open {}", src.display()));
    match format {
        ArchiveFormat::TarGz => unpack_tar(GzDecoder::new(open()?), dest),
        ArchiveFormat::TarZst => unpack_tar(
            zstd::stream::read::Decoder::new(open()?)
                .with_context(|| format!("Failed to read zstd stream {}", src.display()))?,
            dest,
        ),
        ArchiveFormat::TarXz => unpack_tar(XzDecoder::new(open()?), dest),
        ArchiveFormat::Tar => unpack_tar(open()?, dest),
        ArchiveFormat::Zip => unpack_zip(open()?, dest),
    }
    .with_context(|| format!("Failed to extract {}", src.display()))
}

/// Lexically joins `entry` under `dest`, rejecting absolute paths and any
/// `..` that would climb out.
fn safe_join(dest: &Path, entry: &Path) -> Result<PathBuf> {
    let mut depth: usize = 0;
    let mut target = dest.to_path_buf();
    for component in entry.components() {
        match component {
            Component::Normal(c) => {
                target.push(c);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    anyhow::bail!("entry '{}' escapes the destination", entry.display());
                }
                target.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                anyhow::bail!("entry '{}' is absolute", entry.display());
            }
        }
    }
    Ok(target)
}

fn unpack_tar<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries().context("Failed to read tar entries")? {
        let mut entry = entry.context("Failed to read tar entry")?;
        let path = entry.path().context("Failed to read tar entry path")?;
        let target = safe_join(dest, &path)?;

        if entry.header().entry_type().is_dir() {
            make_dir(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            make_dir(parent)?;
        }
        entry
            .unpack(&target)
            .with_context(|| format!("Failed to unpack {}", target.display()))?;
    }
    Ok(())
}

fn unpack_zip(file: File, dest: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(file).context("Failed to open zip archive")?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("Failed to read zip entry")?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| anyhow::anyhow!("entry '{}' escapes the destination", entry.name()))?;
        let target = safe_join(dest, &rel)?;

        if entry.is_dir() {
            make_dir(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            make_dir(parent)?;
        }
        let mut out = File::create(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(())
}

fn make_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn make_tar_gz(dest: &Path, entries: &[(&str, &[u8], u32)]) {
        let file = File::create(dest).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, data, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_detect_priority() {
        assert_eq!(detect("a.zip").unwrap(), ArchiveFormat::Zip);
        assert_eq!(detect("a.tar.zst").unwrap(), ArchiveFormat::TarZst);
        assert_eq!(detect("a.tar.xz").unwrap(), ArchiveFormat::TarXz);
        assert_eq!(detect("a.tar.gz").unwrap(), ArchiveFormat::TarGz);
        assert_eq!(detect("a.tgz").unwrap(), ArchiveFormat::TarGz);
        assert_eq!(detect("a.tar").unwrap(), ArchiveFormat::Tar);
        assert!(matches!(
            detect("a.rar"),
            Err(PiError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_allowed_extensions_per_os() {
        assert!(allowed_extensions(Os::Linux).contains(&".tar.gz"));
        assert!(!allowed_extensions(Os::Linux).contains(&".zip"));
        assert!(allowed_extensions(Os::Darwin).contains(&".zip"));
        assert_eq!(allowed_extensions(Os::Windows), &[".zip"]);
    }

    #[test]
    fn test_unarchive_tar_gz() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.tar.gz");
        make_tar_gz(
            &archive,
            &[
                ("bin/tool", b"#!/bin/sh\n", 0o755),
                ("share/doc.txt", b"docs", 0o644),
            ],
        );
        let dest = dir.path().join("out");
        unarchive(&archive, &dest).unwrap();

        assert_eq!(fs::read(dest.join("share/doc.txt")).unwrap(), b"docs");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(dest.join("bin/tool")).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_unarchive_zip() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("pkg.zip");
        let file = File::create(&archive).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("bin/tool", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"binary").unwrap();
        zip.finish().unwrap();

        let dest = dir.path().join("out");
        unarchive(&archive, &dest).unwrap();
        assert_eq!(fs::read(dest.join("bin/tool")).unwrap(), b"binary");
    }

    #[test]
    fn test_zip_slip_is_rejected() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        let file = File::create(&archive).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("../evil.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"boom").unwrap();
        zip.finish().unwrap();

        let dest = dir.path().join("out");
        assert!(unarchive(&archive, &dest).is_err());
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn test_tar_traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out");
        // Deep ../ chains must not climb out even past intermediate dirs.
        assert!(safe_join(&dest, Path::new("a/../../evil")).is_err());
        assert_eq!(
            safe_join(&dest, Path::new("a/../b")).unwrap(),
            dest.join("b")
        );
        assert!(safe_join(&dest, Path::new("/abs")).is_err());
    }
}
