//! CLI error type and exit codes.

use std::fmt;

use scenesync::archive::ArchiveError;
use scenesync::config::ConfigError;
use scenesync::repository::{RepoError, ResultCode};

/// Errors surfaced to the user.
#[derive(Debug)]
pub enum CliError {
    /// Bad configuration or arguments.
    Config(String),
    /// The repository could not be set up.
    Repo(RepoError),
    /// A sync ran but did not succeed.
    Sync(ResultCode),
    /// Archive extraction failed.
    Archive(ArchiveError),
    /// HTTP client construction failed.
    Http(String),
    Io(std::io::Error),
}

impl CliError {
    /// Process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::Sync(ResultCode::PartialUpdate) => 3,
            CliError::Sync(ResultCode::Cancelled) => 130,
            _ => 1,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Repo(e) => write!(f, "Repository error: {}", e),
            CliError::Sync(code) => write!(f, "Sync failed: {}", code),
            CliError::Archive(e) => write!(f, "Extraction failed: {}", e),
            CliError::Http(msg) => write!(f, "HTTP client error: {}", msg),
            CliError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Repo(e) => Some(e),
            CliError::Archive(e) => Some(e),
            CliError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<RepoError> for CliError {
    fn from(e: RepoError) -> Self {
        CliError::Repo(e)
    }
}

impl From<ArchiveError> for CliError {
    fn from(e: ArchiveError) -> Self {
        CliError::Archive(e)
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e)
    }
}
