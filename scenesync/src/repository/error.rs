//! Result codes, failure records and error types for repository sync.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;

use crate::archive::ArchiveError;

/// Result type for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;

/// Terminal status of a sync, and the code attached to each [`Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    /// Sync completed with every entry up to date.
    NoError,
    /// A directory index was not found on the server.
    NotFound,
    /// Connection-level failure or timeout.
    Socket,
    /// A directory index could not be parsed.
    SvnXml,
    /// Delta application failed (kept for protocol compatibility).
    SvnTxDelta,
    /// Local filesystem failure, or an archive could not be extracted.
    Io,
    /// Downloaded content did not match the manifest hash.
    Checksum,
    /// A file named in an index was not found on the server.
    FileNotFound,
    /// The server answered with an unexpected HTTP status.
    Http,
    /// The sync was cancelled.
    Cancelled,
    /// Some entries failed but the rest of the tree is usable.
    PartialUpdate,
}

impl ResultCode {
    /// Short human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NoError => "no error",
            Self::NotFound => "not found",
            Self::Socket => "socket error",
            Self::SvnXml => "malformed directory index",
            Self::SvnTxDelta => "delta error",
            Self::Io => "I/O error",
            Self::Checksum => "checksum mismatch",
            Self::FileNotFound => "file not found",
            Self::Http => "HTTP error",
            Self::Cancelled => "cancelled",
            Self::PartialUpdate => "partial update",
        }
    }

    /// Whether a failure with this code is worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Socket | Self::Http)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A path that could not be synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    /// Path relative to the repository root.
    pub path: String,
    /// Why it failed.
    pub error: ResultCode,
}

/// Errors raised inside the sync engine.
///
/// Most of these are recorded as a [`Failure`] and do not interrupt the
/// sync; [`RepoError::result_code`] tells which code is recorded.
#[derive(Debug)]
pub enum RepoError {
    /// Failed to read a local file or directory.
    ReadFailed { path: PathBuf, source: io::Error },

    /// Failed to write a local file.
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to create a local directory.
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// Failed to remove a local file or directory.
    RemoveFailed { path: PathBuf, source: io::Error },

    /// Directory index could not be parsed.
    IndexParse { path: String, reason: String },

    /// Content hash did not match the manifest.
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Archive extraction failed.
    Extraction { path: String, source: ArchiveError },

    /// Invalid base URL or path.
    InvalidUrl(String),
}

impl RepoError {
    /// Code recorded for this error.
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::ReadFailed { .. }
            | Self::WriteFailed { .. }
            | Self::CreateDirFailed { .. }
            | Self::RemoveFailed { .. }
            | Self::Extraction { .. } => ResultCode::Io,
            Self::IndexParse { .. } => ResultCode::SvnXml,
            Self::ChecksumMismatch { .. } => ResultCode::Checksum,
            Self::InvalidUrl(_) => ResultCode::Http,
        }
    }

    /// Local filesystem errors abort the whole sync.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::WriteFailed { .. } | Self::CreateDirFailed { .. } | Self::RemoveFailed { .. }
        )
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            Self::WriteFailed { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
            Self::CreateDirFailed { path, source } => {
                write!(
                    f,
                    "failed to create directory {}: {}",
                    path.display(),
                    source
                )
            }
            Self::RemoveFailed { path, source } => {
                write!(f, "failed to remove {}: {}", path.display(), source)
            }
            Self::IndexParse { path, reason } => {
                write!(f, "failed to parse index for '{}': {}", path, reason)
            }
            Self::ChecksumMismatch {
                path,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "checksum mismatch for {}: expected {}, got {}",
                    path, expected, actual
                )
            }
            Self::Extraction { path, source } => {
                write!(f, "failed to extract {}: {}", path, source)
            }
            Self::InvalidUrl(msg) => write!(f, "invalid URL: {}", msg),
        }
    }
}

impl std::error::Error for RepoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFailed { source, .. } => Some(source),
            Self::WriteFailed { source, .. } => Some(source),
            Self::CreateDirFailed { source, .. } => Some(source),
            Self::RemoveFailed { source, .. } => Some(source),
            Self::Extraction { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_mismatch_display() {
        let err = RepoError::ChecksumMismatch {
            path: "Terrain/a.stg".to_string(),
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        assert!(err.to_string().contains("checksum mismatch"));
        assert!(err.to_string().contains("abc123"));
        assert_eq!(err.result_code(), ResultCode::Checksum);
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_index_parse_maps_to_svn_xml() {
        let err = RepoError::IndexParse {
            path: "Terrain/.dirindex".to_string(),
            reason: "missing version line".to_string(),
        };
        assert_eq!(err.result_code(), ResultCode::SvnXml);
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("Terrain/.dirindex"));
    }

    #[test]
    fn test_only_network_codes_are_transient() {
        assert!(ResultCode::Socket.is_transient());
        assert!(ResultCode::Http.is_transient());
        assert!(!ResultCode::Cancelled.is_transient());
        assert!(!ResultCode::NotFound.is_transient());
        assert!(!ResultCode::Checksum.is_transient());
    }

    #[test]
    fn test_write_failure_is_fatal() {
        let err = RepoError::WriteFailed {
            path: PathBuf::from("/x"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.is_fatal());
        assert_eq!(err.result_code(), ResultCode::Io);
    }

    #[test]
    fn test_result_code_serializes_snake_case() {
        let failure = Failure {
            path: "a.txt".to_string(),
            error: ResultCode::FileNotFound,
        };
        let json = serde_json::to_string(&failure).unwrap();
        assert_eq!(json, r#"{"path":"a.txt","error":"file_not_found"}"#);
    }
}
