use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pi")]
#[command(about = "A sandbox-first developer package manager", long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Trace-level logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print version information
    Version,
    /// Manage caves (per-project sandboxed environments)
    Cave {
        #[command(subcommand)]
        command: CaveCommands,
    },
    /// Manage recipe repositories
    Repo {
        #[command(subcommand)]
        command: RepoCommands,
    },
    /// Discover and install packages
    Pkg {
        #[command(subcommand)]
        command: PkgCommands,
    },
    /// Disk usage and cleanup
    Disk {
        #[command(subcommand)]
        command: DiskCommands,
    },
}

impl Commands {
    /// The few commands that stay safe when already inside a cave session.
    pub fn allowed_in_cave(&self) -> bool {
        match self {
            Commands::Version => true,
            Commands::Cave { command } => {
                matches!(command, CaveCommands::Info | CaveCommands::List)
            }
            Commands::Repo { command } => matches!(command, RepoCommands::List),
            Commands::Pkg { command } => matches!(command, PkgCommands::List { .. }),
            Commands::Disk { command } => matches!(command, DiskCommands::Info),
        }
    }
}

#[derive(Subcommand)]
pub enum CaveCommands {
    /// Create pi.cave.json in the current directory
    Init,
    /// Show the cave governing the current directory
    Info,
    /// List registered caves
    List,
    /// Enter a registered cave by name[:variant]
    Use { target: String },
    /// Run a command inside the cave sandbox
    Run {
        /// Variant to resolve settings with
        #[arg(long)]
        variant: Option<String>,
        /// Command and arguments (defaults to a shell)
        #[arg(trailing_var_arg = true)]
        command: Vec<String>,
    },
    /// Open a shell inside the cave sandbox
    Enter {
        #[arg(long)]
        variant: Option<String>,
    },
    /// Prepare all packages without entering the sandbox
    Sync {
        #[arg(long)]
        variant: Option<String>,
    },
    /// Add a package ref to the cave's base settings
    Add { pkg_ref: String },
}

#[derive(Subcommand)]
pub enum RepoCommands {
    /// Register a local recipe directory
    Add { path: String },
    /// List repositories and their indexed patterns
    List,
    /// Re-evaluate all recipes and rebuild the index
    Sync,
}

#[derive(Subcommand)]
pub enum PkgCommands {
    /// Resolve and install one package ref
    Install { pkg_ref: String },
    /// List discovered builds for a query
    List { query: String },
    /// Force re-discovery for a query
    Sync { query: String },
}

#[derive(Subcommand)]
pub enum DiskCommands {
    /// Show disk usage of the pi directories
    Info,
    /// Remove the download/package cache
    Clean,
    /// Remove everything pi has written
    Uninstall {
        /// Actually delete; without this flag nothing happens
        #[arg(long)]
        confirm: bool,
    },
}
