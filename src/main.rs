mod build;
mod cli;
mod commands;
mod errors;
mod logging;
mod models;
mod recipe;
mod services;
mod utils;

use clap::Parser;

use crate::cli::parser::{CaveCommands, Cli, Commands, DiskCommands, PkgCommands, RepoCommands};
use crate::errors::PiError;
use crate::logging::init::init_logging;
use crate::models::config::Config;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose, cli.debug);
    let config = Config::new();

    if let Err(e) = dispatch(&config, cli.command) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn dispatch(config: &Config, command: Commands) -> anyhow::Result<()> {
    // Refuse to nest cave sessions; only the read-only commands stay usable
    // from inside a jail.
    if let Some(current) = config.current_cave() {
        if !command.allowed_in_cave() {
            return Err(PiError::AlreadyInCave(current).into());
        }
    }

    match command {
        Commands::Version => {
            println!("pi version: {}", build::BUILD_VERSION);
            println!("build date: {}", build::BUILD_DATE);
            Ok(())
        }
        Commands::Cave { command } => match command {
            CaveCommands::Init => commands::cave::init::run(config),
            CaveCommands::Info => commands::cave::info::run(config),
            CaveCommands::List => commands::cave::list::run(config),
            CaveCommands::Use { target } => commands::cave::run::use_named(config, &target),
            CaveCommands::Run { variant, command } => {
                commands::cave::run::run(config, variant, command)
            }
            CaveCommands::Enter { variant } => {
                commands::cave::run::run(config, variant, Vec::new())
            }
            CaveCommands::Sync { variant } => commands::cave::sync::run(config, variant),
            CaveCommands::Add { pkg_ref } => commands::cave::add::run(config, &pkg_ref),
        },
        Commands::Repo { command } => match command {
            RepoCommands::Add { path } => commands::repo::add::run(config, &path),
            RepoCommands::List => commands::repo::list::run(config),
            RepoCommands::Sync => commands::repo::sync::run(config),
        },
        Commands::Pkg { command } => match command {
            PkgCommands::Install { pkg_ref } => commands::pkg::install::run(config, &pkg_ref),
            PkgCommands::List { query } => commands::pkg::list::run(config, &query),
            PkgCommands::Sync { query } => commands::pkg::sync::run(config, &query),
        },
        Commands::Disk { command } => match command {
            DiskCommands::Info => commands::disk::info::run(config),
            DiskCommands::Clean => commands::disk::clean::run(config),
            DiskCommands::Uninstall { confirm } => {
                commands::disk::uninstall::run(config, confirm)
            }
        },
    }
}
