use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::PiError;
use crate::models::config::Config;
use crate::services::lock::ensure;
use crate::utils::fs::tmp_sibling;

/// Hard cap for text responses handed back to recipes.
pub const MAX_TEXT_BYTES: u64 = 64 * 1024 * 1024;

/// Freshness window for discovery fetches and cached handler results.
pub const DISCOVERY_TTL: Duration = Duration::from_secs(3600);

/// Streams the resource at `url` into `sink`, dispatching on the URI scheme.
/// `http`/`https` follow redirects; `file` reads the local path.
pub fn fetch(url: &str, sink: &mut dyn Write) -> Result<u64> {
    let scheme = url
        .split_once("://")
        .map(|(s, _)| s)
        .ok_or_else(|| PiError::UnsupportedFormat(format!("uri without scheme: {}", url)))?;
    match scheme {
        "http" | "https" => fetch_http(url, sink),
        "file" => fetch_file(url, sink),
        other => Err(PiError::UnsupportedFormat(format!("uri scheme '{}'", other)).into()),
    }
}

fn fetch_http(url: &str, sink: &mut dyn Write) -> Result<u64> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("Failed to fetch {}", url))?;
    let mut reader = response.into_body().into_reader();
    io::copy(&mut reader, sink).with_context(|| format!("Failed to read body of {}", url))
}

fn fetch_file(url: &str, sink: &mut dyn Write) -> Result<u64> {
    let path = url.strip_prefix("file://").unwrap_or(url);
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {}", path))?;
    io::copy(&mut file, sink).with_context(|| format!("Failed to read {}", path))
}

/// Fetches `url` into `dest` atomically: the body streams to a `.tmp`
/// sibling which is renamed over `dest` on successful close, so an
/// interrupted transfer never leaves a partial file at `dest`.
pub fn fetch_to_file(url: &str, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    let tmp = tmp_sibling(dest);
    let stream = || -> Result<u64> {
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create {}", tmp.display()))?;
        let n = fetch(url, &mut file)?;
        file.flush()?;
        drop(file);
        fs::rename(&tmp, dest)
            .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
        Ok(n)
    };
    stream().inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

/// Fetches `url` as UTF-8 text, enforcing [`MAX_TEXT_BYTES`].
pub fn fetch_text(url: &str) -> Result<String> {
    let mut sink = CappedBuf::new(MAX_TEXT_BYTES);
    fetch(url, &mut sink)?;
    String::from_utf8(sink.buf).with_context(|| format!("Response from {} is not UTF-8", url))
}

struct CappedBuf {
    buf: Vec<u8>,
    cap: u64,
}

impl CappedBuf {
    fn new(cap: u64) -> Self {
        Self {
            buf: Vec::new(),
            cap,
        }
    }
}

impl Write for CappedBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() as u64 + data.len() as u64 > self.cap {
            return Err(io::Error::other(format!(
                "text response exceeds {} byte cap",
                self.cap
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Cache filename for a discovery fetch: the URL with everything outside
/// `[A-Za-z0-9._-]` folded to `_`.
pub fn discovery_cache_path(discovery_dir: &Path, url: &str) -> PathBuf {
    let encoded: String = url
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    discovery_dir.join(encoded)
}

/// Fetches `url` through the discovery disk cache (one hour TTL). A fresh
/// cache entry is returned without touching the network; misses are
/// populated under the cross-process path lock, with an in-process mutex on
/// top so parallel recipe evaluations do not spin on the lock file.
pub fn fetch_text_cached(config: &Config, url: &str) -> Result<String> {
    let target = discovery_cache_path(&config.discovery_dir, url);

    let mutex = config
        .state
        .download_locks
        .entry(url.to_string())
        .or_insert_with(|| Arc::new(parking_lot::Mutex::new(())))
        .clone();
    let _guard = mutex.lock();

    ensure(&target, DISCOVERY_TTL, || {
        log::info!("fetching {}", url);
        let text = fetch_text(url)?;
        crate::utils::fs::write_atomic(&target, text.as_bytes())
    })?;

    let mut content = String::new();
    File::open(&target)
        .with_context(|| format!("Failed to open cache file {}", target.display()))?
        .read_to_string(&mut content)?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_url(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    #[test]
    fn test_fetch_file_scheme() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("payload.txt");
        fs::write(&src, "hello").unwrap();
        let mut out = Vec::new();
        let n = fetch(&file_url(&src), &mut out).unwrap();
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn test_unknown_scheme_is_unsupported() {
        let mut out = Vec::new();
        let err = fetch("ftp://example/x", &mut out).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PiError>(),
            Some(PiError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_fetch_to_file_is_atomic() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, b"data").unwrap();
        let dest = dir.path().join("out/dest.bin");
        fetch_to_file(&file_url(&src), &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"data");
        assert!(!tmp_sibling(&dest).exists());
    }

    #[test]
    fn test_fetch_to_file_failure_leaves_nothing() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("dest.bin");
        let missing = dir.path().join("missing.bin");
        assert!(fetch_to_file(&file_url(&missing), &dest).is_err());
        assert!(!dest.exists());
        assert!(!tmp_sibling(&dest).exists());
    }

    #[test]
    fn test_capped_buf_rejects_oversize() {
        let mut sink = CappedBuf::new(4);
        assert!(sink.write_all(b"12345").is_err());
    }

    #[test]
    fn test_discovery_cache_path_encoding() {
        let p = discovery_cache_path(Path::new("/d"), "https://a.example/x?y=1");
        assert_eq!(p, Path::new("/d/https___a.example_x_y_1"));
    }

    #[test]
    fn test_fetch_text_cached_hits_cache() {
        let root = TempDir::new().unwrap();
        let config = Config::with_dirs(
            root.path().join("cache"),
            root.path().join("config"),
            root.path().join("state"),
        );
        let src = root.path().join("index.json");
        fs::write(&src, "[1]").unwrap();
        let url = file_url(&src);

        assert_eq!(fetch_text_cached(&config, &url).unwrap(), "[1]");

        // Prove the second read is served from disk cache, not the source.
        let cached = discovery_cache_path(&config.discovery_dir, &url);
        fs::write(&cached, "[2]").unwrap();
        assert_eq!(fetch_text_cached(&config, &url).unwrap(), "[2]");
    }
}
