use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;

use crate::models::types::HostTriple;

/// Process-wide configuration: XDG-derived paths and the detected host
/// triple. Built once in `main` and passed by reference; never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
    pub download_dir: PathBuf,
    pub pkgs_dir: PathBuf,
    pub discovery_dir: PathBuf,
    pub homes_dir: PathBuf,
    pub host: HostTriple,
    pub state: Arc<State>,
}

/// In-process shared mutable state. Cross-process coordination happens via
/// the on-disk lock protocol; these maps only dedup work inside one process.
#[derive(Debug, Default)]
pub struct State {
    pub download_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Config {
    pub fn new() -> Self {
        let cache_dir = dirs_next::cache_dir()
            .expect("Failed to get cache directory")
            .join("pi");
        let config_dir = dirs_next::config_dir()
            .expect("Failed to get config directory")
            .join("pi");
        let state_dir = state_home().join("pi");
        Self::with_dirs(cache_dir, config_dir, state_dir)
    }

    /// Builds a config rooted at explicit directories. Tests use this to
    /// point everything at a temp tree.
    pub fn with_dirs(cache_dir: PathBuf, config_dir: PathBuf, state_dir: PathBuf) -> Self {
        Self {
            download_dir: cache_dir.join("downloads"),
            pkgs_dir: cache_dir.join("pkgs"),
            discovery_dir: cache_dir.join("discovery"),
            homes_dir: state_dir.join("homes"),
            cache_dir,
            config_dir,
            state_dir,
            host: HostTriple::default(),
            state: Arc::new(State::default()),
        }
    }

    pub fn repo_file(&self) -> PathBuf {
        self.config_dir.join("repo.json")
    }

    pub fn cave_registry_file(&self) -> PathBuf {
        self.config_dir.join("cave.json")
    }

    pub fn package_registry_file(&self) -> PathBuf {
        self.config_dir.join("package.json")
    }

    pub fn get_user(&self) -> String {
        whoami::username()
    }

    pub fn get_host_home(&self) -> PathBuf {
        dirs_next::home_dir().expect("Failed to get home directory")
    }

    /// The `name[:variant]` of the cave we are running inside, if any.
    pub fn current_cave(&self) -> Option<String> {
        std::env::var("PI_CAVENAME").ok().filter(|v| !v.is_empty())
    }
}

// XDG_STATE_HOME is absent from dirs-next; resolve it by hand.
fn state_home() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs_next::home_dir()
        .expect("Failed to get home directory")
        .join(".local/state")
}
