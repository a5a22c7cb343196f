//! Logging setup.
//!
//! Human-readable output goes to stderr. An optional log file receives the
//! same events without ANSI colors. Filtering follows `RUST_LOG` when set,
//! otherwise the configured default level.

use std::path::PathBuf;

use time::format_description::well_known::Rfc3339;
use time::UtcOffset;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when neither `RUST_LOG` nor options give one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Logging options.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Level or filter directive such as `debug` or `scenesync=trace`.
    pub level: Option<String>,
    /// Append log lines to this file as well.
    pub file: Option<PathBuf>,
    pub verbose: bool,
}

impl LogOptions {
    fn directive(&self) -> String {
        match (&self.level, self.verbose) {
            (Some(level), _) => level.clone(),
            (None, true) => "debug".to_string(),
            (None, false) => DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the log file on drop; keep it alive until
/// the program exits. Returns `None` when no file was requested or a
/// subscriber was already installed.
pub fn init_logging(options: &LogOptions) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(options.directive()))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL));

    // Local offset is unavailable once threads exist on some platforms
    let timer = OffsetTime::local_rfc_3339()
        .unwrap_or_else(|_| OffsetTime::new(UtcOffset::UTC, Rfc3339));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_timer(timer.clone());

    let (file_layer, guard) = match &options.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "scenesync.log".into());
            if std::fs::create_dir_all(&dir).is_err() {
                (None, None)
            } else {
                let appender = tracing_appender::rolling::never(dir, name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_timer(timer);
                (Some(layer), Some(guard))
            }
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    match installed {
        Ok(()) => guard,
        Err(_) => None,
    }
}
