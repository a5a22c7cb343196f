//! Sync command - mirror a remote scenery tree into a local directory.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use console::style;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use scenesync::config::ConfigFile;
use scenesync::http::ReqwestClient;
use scenesync::repository::{HttpRepository, PathFilter, RepoConfig, ResultCode, SyncReport};
use tracing::info;

use crate::error::CliError;

/// Interval between `process()` calls.
const TICK: Duration = Duration::from_millis(10);

/// Failures listed in the summary before truncating.
const MAX_LISTED_FAILURES: usize = 20;

/// Arguments for the sync command.
#[derive(Debug, Default)]
pub struct SyncArgs {
    pub url: Option<String>,
    pub dest: Option<PathBuf>,
    pub installed: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub no_recheck_timeout: bool,
    pub config: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub quiet: bool,
}

/// Build the repository configuration. CLI > config file > defaults.
fn resolve_config(args: &SyncArgs, file: &ConfigFile) -> Result<RepoConfig, CliError> {
    let mut config = file.apply_to(RepoConfig::default());

    if let Some(url) = &args.url {
        config.base_url = url.clone();
    }
    if config.base_url.is_empty() {
        return Err(CliError::Config(
            "No repository URL. Set sync.base_url in config.ini or use --url.".to_string(),
        ));
    }

    match (&args.dest, &file.sync.dest) {
        (Some(dest), _) => config.fs_base = dest.clone(),
        (None, Some(_)) => {}
        (None, None) => {
            return Err(CliError::Config(
                "No destination directory. Set sync.dest in config.ini or use --dest.".to_string(),
            ))
        }
    }

    if let Some(installed) = &args.installed {
        config.installed_copy_path = Some(installed.clone());
    }
    if let Some(limit) = args.concurrency {
        config = config.with_concurrency_limit(limit);
    }
    if args.no_recheck_timeout {
        config.recheck_timeout_enabled = false;
    }
    Ok(config)
}

fn build_filter(args: &SyncArgs) -> Result<Option<PathFilter>, CliError> {
    if args.include.is_empty() && args.exclude.is_empty() {
        return Ok(None);
    }
    let mut filter = PathFilter::new();
    for prefix in &args.include {
        filter = filter.include(prefix);
    }
    for pattern in &args.exclude {
        filter = filter
            .exclude(pattern)
            .map_err(|e| CliError::Config(format!("Invalid --exclude '{}': {}", pattern, e)))?;
    }
    Ok(Some(filter))
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {wide_msg}",
    )
    .map(|style| style.progress_chars("=> "))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    let bar = ProgressBar::new(0);
    bar.set_style(style);
    bar
}

/// Run the sync command.
pub fn run(args: SyncArgs) -> Result<(), CliError> {
    let file = match &args.config {
        Some(path) => ConfigFile::load_from(path)?,
        None => ConfigFile::load()?,
    };
    let config = resolve_config(&args, &file)?;
    let filter = build_filter(&args)?;

    let client = ReqwestClient::with_options(config.request_timeout, &config.user_agent)
        .map_err(|e| CliError::Http(e.to_string()))?;

    println!("Source:      {}", config.base_url);
    println!("Destination: {}", config.fs_base.display());
    if let Some(installed) = &config.installed_copy_path {
        println!("Installed:   {}", installed.display());
    }
    println!();

    let mut repo = HttpRepository::new(config, Box::new(client))?;
    if let Some(filter) = filter {
        repo.set_filter(filter.into_filter_fn());
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_clone = cancel.clone();
    ctrlc::set_handler(move || {
        cancel_clone.store(true, Ordering::SeqCst);
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let bar = progress_bar(args.quiet);
    repo.update();
    while repo.is_doing_sync() {
        if cancel.load(Ordering::SeqCst) {
            bar.println("Cancelling...");
            repo.cancel();
            break;
        }
        repo.process();

        bar.set_length(repo.bytes_to_download());
        bar.set_position(repo.bytes_downloaded());
        bar.set_message(repo.last_checked_path().to_string());
        std::thread::sleep(TICK);
    }
    bar.finish_and_clear();

    print_summary(&repo);

    if let Some(path) = &args.report {
        let json = SyncReport::from_repository(&repo)
            .to_json()
            .map_err(|e| CliError::Io(e.into()))?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), "Report written");
    }

    match repo.failure() {
        ResultCode::NoError => Ok(()),
        code => Err(CliError::Sync(code)),
    }
}

fn print_summary(repo: &HttpRepository) {
    let stats = repo.stats();
    let code = repo.failure();
    let status = match code {
        ResultCode::NoError => style(code.to_string()).green(),
        ResultCode::PartialUpdate => style(code.to_string()).yellow(),
        _ => style(code.to_string()).red(),
    };
    println!("Sync finished: {}", status);
    println!(
        "  Downloaded: {} in {} file(s)",
        HumanBytes(repo.bytes_downloaded()),
        stats.files_written
    );
    println!("  Indexes:    {} fetched", stats.indexes_fetched);
    if stats.files_copied > 0 {
        println!("  Copied:     {} from installed tree", stats.files_copied);
    }
    if stats.files_extracted > 0 {
        println!("  Extracted:  {} file(s)", stats.files_extracted);
    }
    if stats.files_filtered > 0 {
        println!("  Skipped:    {} by filter", stats.files_filtered);
    }

    let failures = repo.failures();
    if !failures.is_empty() {
        println!();
        println!("Failures ({}):", failures.len());
        for failure in failures.iter().take(MAX_LISTED_FAILURES) {
            println!("  {} ({})", failure.path, failure.error);
        }
        if failures.len() > MAX_LISTED_FAILURES {
            println!("  ... and {} more", failures.len() - MAX_LISTED_FAILURES);
        }
    }
}
