use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::ser::PrettyFormatter;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::errors::StoreError;
use crate::utils::fs::tmp_sibling;

/// Formatting and lifecycle options for a [`JsonStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Indent string; empty means compact output.
    pub indent: String,
    pub mode: u32,
    pub create_if_missing: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            indent: "  ".to_string(),
            mode: 0o644,
            create_if_missing: true,
        }
    }
}

struct Inner<T> {
    value: Option<T>,
    dirty: bool,
}

/// A typed, lazily loaded wrapper around one JSON file.
///
/// The first access loads from disk (or initializes the default value when
/// the file is absent and `create_if_missing` is set). Mutations go through
/// [`modify`](Self::modify) and only reach disk on [`save`](Self::save),
/// which publishes atomically via tmp-file + rename. A readers-writer lock
/// serializes `modify`/`save` against everything while concurrent `get`s
/// share one stable snapshot.
pub struct JsonStore<T> {
    path: PathBuf,
    opts: StoreOptions,
    inner: RwLock<Inner<T>>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_options(path, StoreOptions::default())
    }

    pub fn with_options(path: impl Into<PathBuf>, opts: StoreOptions) -> Self {
        Self {
            path: path.into(),
            opts,
            inner: RwLock::new(Inner {
                value: None,
                dirty: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.read().value.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// Read access to the (lazily loaded) value.
    pub fn get(&self) -> Result<MappedRwLockReadGuard<'_, T>, StoreError> {
        {
            let guard = self.inner.read();
            if guard.value.is_some() {
                return Ok(RwLockReadGuard::map(guard, |i| i.value.as_ref().unwrap()));
            }
        }
        let mut guard = self.inner.write();
        self.ensure_loaded(&mut guard)?;
        let guard = RwLockWriteGuard::downgrade(guard);
        Ok(RwLockReadGuard::map(guard, |i| i.value.as_ref().unwrap()))
    }

    /// Runs `f` on the value and marks the store dirty when it succeeds.
    /// Nothing is written until [`save`](Self::save).
    pub fn modify(&self, f: impl FnOnce(&mut T) -> anyhow::Result<()>) -> anyhow::Result<()> {
        let mut guard = self.inner.write();
        self.ensure_loaded(&mut guard)?;
        f(guard.value.as_mut().unwrap())?;
        guard.dirty = true;
        Ok(())
    }

    pub fn mark_dirty(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        self.ensure_loaded(&mut guard)?;
        guard.dirty = true;
        Ok(())
    }

    /// Discards the in-memory value and re-reads from disk.
    pub fn reload(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        guard.value = None;
        guard.dirty = false;
        self.ensure_loaded(&mut guard)
    }

    /// Writes the value atomically; a no-op unless dirty.
    pub fn save(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.write();
        if !guard.dirty {
            return Ok(());
        }
        self.ensure_loaded(&mut guard)?;
        let bytes = self.marshal(guard.value.as_ref().unwrap())?;
        self.write_atomic(&bytes)?;
        guard.dirty = false;
        Ok(())
    }

    /// [`save`](Self::save) for contexts where losing registry state is not
    /// an option; panics on failure.
    pub fn must_save(&self) {
        if let Err(e) = self.save() {
            panic!("failed to save {}: {}", self.path.display(), e);
        }
    }

    fn ensure_loaded(&self, guard: &mut Inner<T>) -> Result<(), StoreError> {
        if guard.value.is_some() {
            return Ok(());
        }
        match fs::read(&self.path) {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| StoreError::Parse {
                    path: self.path.clone(),
                    source: e,
                })?;
                guard.value = Some(value);
                guard.dirty = false;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if self.opts.create_if_missing {
                    guard.value = Some(T::default());
                    guard.dirty = true;
                    Ok(())
                } else {
                    Err(StoreError::NotFound(self.path.clone()))
                }
            }
            Err(e) => Err(StoreError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    fn marshal(&self, value: &T) -> Result<Vec<u8>, StoreError> {
        let map_err = |e: serde_json::Error| StoreError::Parse {
            path: self.path.clone(),
            source: e,
        };
        if self.opts.indent.is_empty() {
            return serde_json::to_vec(value).map_err(map_err);
        }
        let mut bytes = Vec::new();
        let fmt = PrettyFormatter::with_indent(self.opts.indent.as_bytes());
        let mut ser = serde_json::Serializer::with_formatter(&mut bytes, fmt);
        value.serialize(&mut ser).map_err(map_err)?;
        Ok(bytes)
    }

    fn write_atomic(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let io_err = |e: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source: e,
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = tmp_sibling(&self.path);
        let write = || -> std::io::Result<()> {
            fs::write(&tmp, bytes)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&tmp, fs::Permissions::from_mode(self.opts.mode))?;
            }
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            io_err(e)
        })
    }
}
