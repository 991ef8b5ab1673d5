use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Folds characters that are unsafe in file names to `_`.
pub fn sanitize_name(name: &str) -> String {
    name.replace(['/', '\\', ' ', ':'], "_")
}

/// `<path>.tmp` sibling used for atomic publication.
pub fn tmp_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// `<path>.lock` sibling used by the cross-process lock protocol.
pub fn lock_sibling(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// Writes `content` to `path` via tmp-file + rename so readers never observe
/// a partial file. Creates parent directories as needed.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let tmp = tmp_sibling(path);
    let write = || -> Result<()> {
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
        Ok(())
    };
    write().inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}
