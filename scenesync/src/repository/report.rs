//! Machine-readable summary of a finished sync.

use serde::Serialize;

use super::engine::SyncStats;
use super::error::{Failure, ResultCode};
use super::HttpRepository;

/// JSON-serializable outcome of a sync.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub status: ResultCode,
    pub base_url: String,
    pub fs_base: String,
    pub bytes_downloaded: u64,
    pub bytes_to_download: u64,
    pub stats: SyncStats,
    pub failures: Vec<Failure>,
}

impl SyncReport {
    /// Snapshot the current state of `repo`.
    pub fn from_repository(repo: &HttpRepository) -> Self {
        Self {
            status: repo.failure(),
            base_url: repo.base_url().to_string(),
            fs_base: repo.fs_base().display().to_string(),
            bytes_downloaded: repo.bytes_downloaded(),
            bytes_to_download: repo.bytes_to_download(),
            stats: repo.stats(),
            failures: repo.failures().to_vec(),
        }
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MemoryTransport;
    use crate::repository::RepoConfig;
    use tempfile::TempDir;

    #[test]
    fn test_report_before_sync() {
        let temp = TempDir::new().unwrap();
        let repo = HttpRepository::new(
            RepoConfig::new("http://host.invalid/ws2", temp.path()),
            Box::new(MemoryTransport::new()),
        )
        .unwrap();

        let report = SyncReport::from_repository(&repo);
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

        assert_eq!(json["status"], "no_error");
        assert_eq!(json["base_url"], "http://host.invalid/ws2");
        assert_eq!(json["stats"]["files_written"], 0);
        assert!(json["failures"].as_array().unwrap().is_empty());
    }
}
