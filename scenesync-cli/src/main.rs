//! SceneSync CLI - command-line interface
//!
//! Mirrors remote scenery trees onto local disk and unpacks scenery
//! archives, using the scenesync library.

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use scenesync::config::ConfigFile;
use scenesync::logging::{init_logging, LogOptions};

use commands::config::ConfigCommands;
use commands::extract::ExtractArgs;
use commands::sync::SyncArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "scenesync", version, about = "Mirror remote scenery trees onto local disk")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write log output to this file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Synchronize a local directory with a remote repository
    Sync {
        /// Repository root URL (overrides sync.base_url)
        #[arg(long)]
        url: Option<String>,

        /// Local destination directory (overrides sync.dest)
        #[arg(long)]
        dest: Option<PathBuf>,

        /// Pre-installed tree to copy matching files from
        #[arg(long, value_name = "PATH")]
        installed: Option<PathBuf>,

        /// Maximum concurrent requests
        #[arg(long, value_name = "N")]
        concurrency: Option<usize>,

        /// Only sync this subtree (repeatable)
        #[arg(long, value_name = "PREFIX")]
        include: Vec<String>,

        /// Skip paths matching this regular expression (repeatable)
        #[arg(long, value_name = "REGEX")]
        exclude: Vec<String>,

        /// Always refetch the root index
        #[arg(long)]
        no_recheck_timeout: bool,

        /// Configuration file to use instead of the default
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Write a JSON report of the outcome
        #[arg(long, value_name = "PATH")]
        report: Option<PathBuf>,

        /// Hide the progress bar
        #[arg(short, long)]
        quiet: bool,
    },

    /// Extract a tar, tar.gz, tar.xz or zip archive
    Extract {
        /// Archive file
        archive: PathBuf,

        /// Destination directory
        dest: PathBuf,

        /// Drop the top-level directory of every entry
        #[arg(long)]
        strip_top: bool,
    },

    /// View or modify configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn log_options(cli: &Cli) -> LogOptions {
    // A broken config file is reported by the command itself
    let logging = ConfigFile::load().map(|c| c.logging).unwrap_or_default();
    LogOptions {
        level: logging.level,
        file: cli.log_file.clone().or(logging.file),
        verbose: cli.verbose,
    }
}

fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Sync {
            url,
            dest,
            installed,
            concurrency,
            include,
            exclude,
            no_recheck_timeout,
            config,
            report,
            quiet,
        } => commands::sync::run(SyncArgs {
            url,
            dest,
            installed,
            concurrency,
            include,
            exclude,
            no_recheck_timeout,
            config,
            report,
            quiet,
        }),
        Commands::Extract {
            archive,
            dest,
            strip_top,
        } => commands::extract::run(ExtractArgs {
            archive,
            dest,
            strip_top,
        }),
        Commands::Config { command } => commands::config::run(command),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _log_guard = init_logging(&log_options(&cli));

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
