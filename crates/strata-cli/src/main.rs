//! # strata CLI
//!
//! Deduplicated, encrypted backups of local directories to a file or
//! in-memory target.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use strata_config::{log_cli_debug, logging, path::expand_tilde, Config};
use strata_engine::{Controller, Options};

mod commands;
mod output;

/// Strata - deduplicating, encrypted, interruption-safe backups
#[derive(Parser)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Use this config file instead of ~/.strata and .strata
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Backend URL, e.g. file:///mnt/backup
    #[arg(long, global = true)]
    target: Option<String>,

    /// Remote file-name prefix
    #[arg(long, global = true)]
    prefix: Option<String>,

    /// Local catalog directory
    #[arg(long, global = true, value_name = "DIR")]
    catalog: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// More log output (-v, -vv, ...)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up files and directories into a new version
    Backup {
        #[arg(value_name = "PATH", required = true)]
        sources: Vec<PathBuf>,

        /// Skip paths matching this pattern (repeatable)
        #[arg(long, value_name = "PATTERN")]
        exclude: Vec<String>,
    },

    /// Restore files from a version
    Restore {
        /// Path patterns to restore (default: everything)
        #[arg(value_name = "PATTERN")]
        paths: Vec<String>,

        /// Version to restore (default: newest)
        #[arg(long)]
        version: Option<u64>,

        /// Restore below this directory instead of the original locations
        #[arg(long, value_name = "DIR")]
        to: Option<PathBuf>,

        /// Replace existing files
        #[arg(long)]
        overwrite: bool,
    },

    /// List versions, or the files of one version
    List {
        /// Show the files of this version
        #[arg(long)]
        version: Option<u64>,

        /// Show files of the newest version
        #[arg(long)]
        files: bool,

        /// Only files matching these patterns
        #[arg(value_name = "PATTERN")]
        paths: Vec<String>,
    },

    /// List remote files under the configured prefix
    ListRemote,

    /// Remove files from existing versions
    Purge {
        #[arg(value_name = "PATTERN", required = true)]
        paths: Vec<String>,

        /// Only purge from these versions (repeatable)
        #[arg(long = "version", value_name = "VERSION")]
        versions: Vec<u64>,
    },

    /// Delete one version, or apply the retention policy
    Delete {
        #[arg(long)]
        version: Option<u64>,
    },

    /// Rebuild or reconcile the catalog against the remote
    Repair,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file locations
    Path,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load configuration")?,
    };
    if let Some(target) = &cli.target {
        config.storage.target = target.clone();
    }
    if let Some(prefix) = &cli.prefix {
        config.storage.prefix = prefix.clone();
    }
    if let Some(catalog) = &cli.catalog {
        config.storage.catalog = catalog.clone();
    }
    config.validate()?;

    let mut level = config.logging.level;
    for _ in 0..cli.verbose {
        level = level.louder();
    }
    match &config.logging.log_file {
        Some(file) => logging::init_file_logging(level, &expand_tilde(file))?,
        None => logging::init_logging(level),
    }
    strata_config::install(config.clone());

    if let Commands::Config { command } = &cli.command {
        return match command {
            ConfigCommands::Show => commands::config_show(),
            ConfigCommands::Path => commands::config_path(cli.config.as_deref()),
        };
    }

    let mut options = Options::from_config(&config)?;
    if let Commands::Backup { exclude, .. } = &cli.command {
        options.exclude.extend(exclude.iter().cloned());
    }
    log_cli_debug!(
        "opening catalog",
        catalog = tracing::field::display(options.catalog_dir.display()),
        target = options.target.as_str()
    );
    let controller = Controller::open(options).context("failed to open the backup catalog")?;
    let out = output::Output::new(cli.json);

    match cli.command {
        Commands::Backup { sources, .. } => commands::backup(&controller, &out, &sources),
        Commands::Restore {
            paths,
            version,
            to,
            overwrite,
        } => commands::restore(&controller, &out, paths, version, to, overwrite),
        Commands::List {
            version,
            files,
            paths,
        } => {
            if files || version.is_some() || !paths.is_empty() {
                commands::list_files(&controller, &out, version, paths)
            } else {
                commands::list_versions(&controller, &out)
            }
        }
        Commands::ListRemote => commands::list_remote(&controller, &out),
        Commands::Purge { paths, versions } => commands::purge(&controller, &out, paths, versions),
        Commands::Delete { version } => commands::delete(&controller, &out, version),
        Commands::Repair => commands::repair(&controller, &out),
        Commands::Config { .. } => Ok(()),
    }
}
