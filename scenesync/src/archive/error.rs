//! Error types for archive extraction.

use std::fmt;
use std::io;
use std::path::PathBuf;

use super::state::ArchiveState;

/// Result type for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Errors that can occur while extracting an archive.
#[derive(Debug)]
pub enum ArchiveError {
    /// Malformed header or container structure.
    BadArchive(String),

    /// Entry data could not be decoded or written to disk.
    BadData { path: PathBuf, source: io::Error },

    /// The path filter stopped extraction at this entry.
    FilterStopped(String),

    /// Input ended before the archive was complete.
    Truncated(ArchiveState),

    /// The extractor already reached a terminal state.
    Finished(ArchiveState),

    /// Failed to read the archive source file.
    ReadFailed { path: PathBuf, source: io::Error },
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::BadArchive(reason) => write!(f, "bad archive: {}", reason),
            ArchiveError::BadData { path, source } => {
                write!(f, "failed to extract {}: {}", path.display(), source)
            }
            ArchiveError::FilterStopped(path) => {
                write!(f, "extraction stopped by filter at {}", path)
            }
            ArchiveError::Truncated(state) => {
                write!(f, "archive ended unexpectedly while in state {:?}", state)
            }
            ArchiveError::Finished(state) => {
                write!(f, "extractor already finished in state {:?}", state)
            }
            ArchiveError::ReadFailed { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArchiveError::BadData { source, .. } => Some(source),
            ArchiveError::ReadFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl ArchiveError {
    /// The terminal state this error leaves the extractor in.
    pub fn state(&self) -> ArchiveState {
        match self {
            ArchiveError::BadArchive(_) | ArchiveError::Truncated(_) => ArchiveState::BadArchive,
            ArchiveError::BadData { .. } | ArchiveError::ReadFailed { .. } => {
                ArchiveState::BadData
            }
            ArchiveError::FilterStopped(_) => ArchiveState::FilterStopped,
            ArchiveError::Finished(state) => *state,
        }
    }
}
