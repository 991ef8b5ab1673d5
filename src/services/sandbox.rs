use anyhow::{Context, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::models::cave::{Cave, CaveSettings};
use crate::models::config::Config;
use crate::services::pkgs::{self, PreparationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BindType {
    Bind,
    BindTry,
    DevBind,
    DevBindTry,
    RoBind,
    RoBindTry,
    Proc,
    Dev,
    Tmpfs,
}

impl BindType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindType::Bind => "--bind",
            BindType::BindTry => "--bind-try",
            BindType::DevBind => "--dev-bind",
            BindType::DevBindTry => "--dev-bind-try",
            BindType::RoBind => "--ro-bind",
            BindType::RoBindTry => "--ro-bind-try",
            BindType::Proc => "--proc",
            BindType::Dev => "--dev",
            BindType::Tmpfs => "--tmpfs",
        }
    }
}

#[derive(Debug, Clone)]
struct BindPair {
    jail_target: PathBuf,
    host_source: Option<PathBuf>,
    bind_type: BindType,
}

/// Assembles the argv/env for a bubblewrap invocation.
///
/// Mounts key on the jail-side path in a sorted map and env vars live in a
/// sorted map too, so identical inputs always emit identical argv.
pub struct Bubblewrap {
    binds: BTreeMap<PathBuf, BindPair>,
    envs: BTreeMap<String, String>,
    unsets: BTreeSet<String>,
    flags: Vec<String>,
    executable: Option<String>,
    args: Vec<String>,
}

impl Bubblewrap {
    pub const BWRAP: &'static str = "/usr/bin/bwrap";

    /// Starts from the current process environment; the launcher then
    /// overrides and unsets selectively.
    pub fn new() -> Self {
        Self::with_env(std::env::vars().collect())
    }

    pub fn with_env(envs: BTreeMap<String, String>) -> Self {
        Self {
            binds: BTreeMap::new(),
            envs,
            unsets: BTreeSet::new(),
            flags: Vec::new(),
            executable: None,
            args: Vec::new(),
        }
    }

    pub fn add_bind<P: AsRef<Path>>(&mut self, typ: BindType, path: P) {
        let path = path.as_ref().to_path_buf();
        self.binds.insert(
            path.clone(),
            BindPair {
                jail_target: path.clone(),
                host_source: Some(path),
                bind_type: typ,
            },
        );
    }

    pub fn add_map_bind<P1: AsRef<Path>, P2: AsRef<Path>>(
        &mut self,
        typ: BindType,
        host_path: P1,
        jail_path: P2,
    ) {
        let jail_path = jail_path.as_ref().to_path_buf();
        self.binds.insert(
            jail_path.clone(),
            BindPair {
                jail_target: jail_path,
                host_source: Some(host_path.as_ref().to_path_buf()),
                bind_type: typ,
            },
        );
    }

    pub fn add_virtual<P: AsRef<Path>>(&mut self, typ: BindType, path: P) {
        let path = path.as_ref().to_path_buf();
        self.binds.insert(
            path.clone(),
            BindPair {
                jail_target: path,
                host_source: None,
                bind_type: typ,
            },
        );
    }

    pub fn add_flag(&mut self, flag: &str) {
        self.flags.push(flag.to_string());
    }

    pub fn set_env(&mut self, name: &str, value: &str) {
        self.envs.insert(name.to_string(), value.to_string());
    }

    pub fn get_env(&self, name: &str) -> Option<&str> {
        self.envs.get(name).map(|s| s.as_str())
    }

    pub fn unset_env(&mut self, name: &str) {
        self.unsets.insert(name.to_string());
        self.envs.remove(name);
    }

    /// Prepends `entry` to a `:`-separated env var, deduplicating.
    pub fn add_env_first(&mut self, name: &str, entry: &str) {
        let val = self.envs.get(name).cloned().unwrap_or_default();
        let mut parts: Vec<String> = val
            .split(':')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        if !parts.contains(&entry.to_string()) {
            parts.insert(0, entry.to_string());
        }
        self.envs.insert(name.to_string(), parts.join(":"));
    }

    pub fn set_command(&mut self, executable: &str, args: &[String]) {
        self.executable = Some(executable.to_string());
        self.args = args.to_vec();
    }

    /// The bwrap argument vector: flags, path-sorted mounts, sorted env
    /// assignments and unsets, then the command.
    pub fn to_argv(&self) -> Vec<String> {
        let mut argv: Vec<String> = self.flags.clone();
        for bind in self.binds.values() {
            argv.push(bind.bind_type.as_str().to_string());
            if let Some(ref source) = bind.host_source {
                argv.push(source.to_string_lossy().into_owned());
            }
            argv.push(bind.jail_target.to_string_lossy().into_owned());
        }
        for (key, value) in &self.envs {
            argv.push("--setenv".to_string());
            argv.push(key.clone());
            argv.push(value.clone());
        }
        for unset in &self.unsets {
            argv.push("--unsetenv".to_string());
            argv.push(unset.clone());
        }
        if let Some(ref exe) = self.executable {
            argv.push("--".to_string());
            argv.push(exe.clone());
            argv.extend(self.args.iter().cloned());
        }
        argv
    }

    pub fn build_command(&self) -> Command {
        let mut cmd = Command::new(Self::BWRAP);
        cmd.args(self.to_argv());
        cmd
    }

    /// Process-replaces into bwrap so signals and the TTY transfer cleanly.
    /// Returns only on failure.
    pub fn exec(&self) -> Result<()> {
        let err = self.build_command().exec();
        Err(anyhow::Error::from(err).context("Failed to exec into bubblewrap"))
    }
}

pub struct LaunchOptions<'a> {
    pub config: &'a Config,
    pub cave: &'a Cave,
    pub settings: &'a CaveSettings,
    pub prep: &'a PreparationResult,
    pub command: &'a [String],
}

/// Builds the namespace-jail spec for a cave session: a minimal read-only
/// system view, virtual filesystems, the workspace bound read-write at its
/// host path, and the per-cave home remapped over the user's `HOME` so
/// `~/.*` writes land in the cave.
pub fn build(opts: &LaunchOptions) -> Result<Bubblewrap> {
    let mut b = Bubblewrap::new();
    populate(&mut b, opts);
    Ok(b)
}

fn populate(b: &mut Bubblewrap, opts: &LaunchOptions) {
    let config = opts.config;
    let cave = opts.cave;
    let host_home = config.get_host_home();

    b.add_flag("--unshare-pid");
    b.add_flag("--die-with-parent");

    for path in ["/usr", "/lib", "/lib64", "/bin", "/sbin", "/opt", "/etc"] {
        if Path::new(path).exists() {
            b.add_bind(BindType::RoBind, path);
        }
    }
    b.add_bind(BindType::RoBind, "/sys");
    if Path::new("/dev/dri").exists() {
        b.add_bind(BindType::DevBind, "/dev/dri");
    }
    b.add_bind(BindType::DevBindTry, "/dev/bus/usb");

    b.add_virtual(BindType::Proc, "/proc");
    b.add_virtual(BindType::Dev, "/dev");
    b.add_virtual(BindType::Tmpfs, "/tmp");
    b.add_virtual(BindType::Tmpfs, "/run");

    // Workspace keeps its host path so relative paths stay valid.
    b.add_bind(BindType::Bind, cave.workspace());

    // The cave home becomes the jail's HOME.
    b.add_map_bind(BindType::Bind, &cave.home_path, &host_home);

    // Shared download/package cache, read-only inside the jail.
    b.add_map_bind(
        BindType::RoBind,
        &config.cache_dir,
        host_home.join(".cache/pi"),
    );

    if let Some(runtime_dir) = b.get_env("XDG_RUNTIME_DIR").map(|s| s.to_string()) {
        b.add_bind(BindType::Bind, &runtime_dir);
    }
    if let Some(sock) = b.get_env("SSH_AUTH_SOCK").map(|s| s.to_string()) {
        b.add_bind(BindType::RoBindTry, &sock);
    }

    b.set_env("HOME", &host_home.to_string_lossy());
    b.set_env("USER", &config.get_user());
    b.set_env("PI_WORKSPACE", &cave.workspace().to_string_lossy());
    b.set_env("PI_CAVENAME", &cave.qualified_name());

    b.add_env_first("PATH", "/usr/bin:/bin");
    b.add_env_first("PATH", &host_home.join(".local/bin").to_string_lossy());

    for (key, value) in &opts.prep.env {
        b.set_env(key, value);
    }
    // Variant-resolved settings win over package-declared env.
    for (key, value) in &opts.settings.env {
        b.set_env(key, value);
    }

    b.unset_env("GTK_USE_PORTAL");
    b.unset_env("QT_USE_PORTAL");

    if opts.command.is_empty() {
        b.set_command("/bin/bash", &[]);
    } else {
        b.set_command(&opts.command[0], &opts.command[1..]);
    }
}

/// Materializes the prepared symlinks into the cave home, then replaces the
/// current process with the jail.
pub fn launch(opts: &LaunchOptions) -> Result<()> {
    fs::create_dir_all(&opts.cave.home_path).with_context(|| {
        format!(
            "Failed to create cave home {}",
            opts.cave.home_path.display()
        )
    })?;
    pkgs::create_symlinks(&opts.cave.home_path, &opts.prep.symlinks)?;
    build(opts)?.exec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cave::CaveConfig;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn test_cave(root: &TempDir) -> Cave {
        let workspace = root.path().join("proj");
        std::fs::create_dir_all(&workspace).unwrap();
        Cave {
            config: CaveConfig::new(workspace.clone()),
            file: workspace.join(CaveConfig::FILENAME),
            home_path: root.path().join("homes/proj"),
            variant: "dev".to_string(),
        }
    }

    fn test_opts_argv(root: &TempDir, command: &[String]) -> Vec<String> {
        let config = crate::models::config::Config::with_dirs(
            root.path().join("cache"),
            root.path().join("config"),
            root.path().join("state"),
        );
        let cave = test_cave(root);
        let settings = CaveSettings {
            pkgs: vec![],
            env: [("A".to_string(), "2".to_string())].into(),
        };
        let prep = PreparationResult {
            symlinks: vec![],
            env: [
                ("A".to_string(), "1".to_string()),
                ("NODE_OPTIONS".to_string(), "--x".to_string()),
            ]
            .into(),
            pkg_dir: config.pkgs_dir.clone(),
            cache_dir: config.cache_dir.clone(),
        };
        let opts = LaunchOptions {
            config: &config,
            cave: &cave,
            settings: &settings,
            prep: &prep,
            command,
        };
        // Fixed base env for deterministic assertions.
        let mut b = Bubblewrap::with_env(
            [("PATH".to_string(), "/usr/local/bin".to_string())].into(),
        );
        populate(&mut b, &opts);
        b.to_argv()
    }

    #[test]
    fn test_spec_is_stable() {
        let root = TempDir::new().unwrap();
        let a = test_opts_argv(&root, &[]);
        let b = test_opts_argv(&root, &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_spec_contains_core_mounts_and_flags() {
        let root = TempDir::new().unwrap();
        let argv = test_opts_argv(&root, &[]);
        let joined = argv.join(" ");

        assert!(argv.contains(&"--unshare-pid".to_string()));
        assert!(argv.contains(&"--die-with-parent".to_string()));
        assert!(joined.contains("--proc /proc"));
        assert!(joined.contains("--dev /dev"));
        assert!(joined.contains("--tmpfs /tmp"));
        assert!(joined.contains("--tmpfs /run"));
        assert!(joined.contains("--ro-bind /usr /usr"));
        // Workspace bound read-write at its own path.
        let workspace = root.path().join("proj");
        assert!(joined.contains(&format!(
            "--bind {} {}",
            workspace.display(),
            workspace.display()
        )));
    }

    #[test]
    fn test_home_remap_and_cache_bind() {
        let root = TempDir::new().unwrap();
        let argv = test_opts_argv(&root, &[]);
        let joined = argv.join(" ");
        let host_home = dirs_next::home_dir().unwrap();
        let home = root.path().join("homes/proj");

        assert!(joined.contains(&format!(
            "--bind {} {}",
            home.display(),
            host_home.display()
        )));
        assert!(joined.contains(&format!(
            "--ro-bind {} {}",
            root.path().join("cache").display(),
            host_home.join(".cache/pi").display()
        )));
    }

    #[test]
    fn test_env_setup() {
        let root = TempDir::new().unwrap();
        let argv = test_opts_argv(&root, &[]);
        let joined = argv.join(" ");
        let host_home = dirs_next::home_dir().unwrap();

        assert!(joined.contains("--setenv PI_CAVENAME proj:dev"));
        assert!(joined.contains(&format!(
            "--setenv PI_WORKSPACE {}",
            root.path().join("proj").display()
        )));
        // Variant env wins over package env; package-only entries survive.
        assert!(joined.contains("--setenv A 2"));
        assert!(joined.contains("--setenv NODE_OPTIONS --x"));
        // PATH gets the cave bin first and keeps /usr/bin:/bin.
        let path_value = argv
            .iter()
            .position(|a| a == "PATH")
            .map(|i| argv[i + 1].clone())
            .unwrap();
        assert!(path_value.starts_with(&format!("{}", host_home.join(".local/bin").display())));
        assert!(path_value.contains("/usr/bin:/bin"));
        assert!(path_value.ends_with("/usr/local/bin"));

        assert!(joined.contains("--unsetenv GTK_USE_PORTAL"));
        assert!(joined.contains("--unsetenv QT_USE_PORTAL"));
    }

    #[test]
    fn test_command_defaults_to_bash() {
        let root = TempDir::new().unwrap();
        let argv = test_opts_argv(&root, &[]);
        let tail: Vec<&str> = argv[argv.len() - 2..].iter().map(|s| s.as_str()).collect();
        assert_eq!(tail, ["--", "/bin/bash"]);

        let argv = test_opts_argv(&root, &["make".to_string(), "test".to_string()]);
        let tail: Vec<&str> = argv[argv.len() - 3..].iter().map(|s| s.as_str()).collect();
        assert_eq!(tail, ["--", "make", "test"]);
    }

    #[test]
    fn test_mounts_are_path_sorted() {
        let root = TempDir::new().unwrap();
        let argv = test_opts_argv(&root, &[]);
        let mut mount_targets = Vec::new();
        let mut i = 0;
        while i < argv.len() {
            match argv[i].as_str() {
                "--bind" | "--ro-bind" | "--dev-bind" | "--bind-try" | "--ro-bind-try"
                | "--dev-bind-try" => {
                    mount_targets.push(argv[i + 2].clone());
                    i += 3;
                }
                "--proc" | "--dev" | "--tmpfs" => {
                    mount_targets.push(argv[i + 1].clone());
                    i += 2;
                }
                "--setenv" => i += 3,
                _ => i += 1,
            }
        }
        let mut sorted = mount_targets.clone();
        sorted.sort();
        assert_eq!(mount_targets, sorted);
    }
}
