//! Incremental, hash-verified mirroring of a remote directory tree.
//!
//! The remote side is a plain HTTP tree where every directory carries a
//! `.dirindex` listing its children with their SHA-1 and size. A sync walks
//! the tree top-down: each index is diffed against the local directory,
//! removals are applied, and only missing or changed files are fetched.
//! Archives listed as tarball entries are downloaded and extracted in place.
//!
//! [`HttpRepository`] never blocks. The caller drives it:
//!
//! ```ignore
//! let mut repo = HttpRepository::new(config, Box::new(ReqwestClient::new()?))?;
//! repo.update();
//! while repo.is_doing_sync() {
//!     repo.process();
//!     std::thread::sleep(Duration::from_millis(10));
//! }
//! ```

mod config;
mod directory;
mod engine;
mod error;
mod filter;
mod hash_cache;
mod index;
mod report;
mod request;
mod task;

pub use config::RepoConfig;
pub use directory::{SyncAction, SyncItem};
pub use engine::{SyncFilterFn, SyncStats};
pub use error::{Failure, RepoError, RepoResult, ResultCode};
pub use filter::PathFilter;
pub use hash_cache::{HashCache, HashCacheEntry, HASH_CACHE_FILE_NAME};
pub use index::{
    DirectoryIndex, DirectoryIndexEntry, EntryType, IndexParseError, INDEX_FILE_NAME,
};
pub use report::SyncReport;
pub use task::ProcessResult;

use std::path::{Path, PathBuf};

use url::Url;

use crate::http::HttpClient;
use engine::SyncEngine;

/// Public handle to one mirrored repository.
///
/// The local tree under [`fs_base`](Self::fs_base) must not be shared with
/// another `HttpRepository`.
pub struct HttpRepository {
    engine: SyncEngine,
}

impl HttpRepository {
    /// Create a repository using `client` for all requests.
    ///
    /// # Errors
    ///
    /// Returns [`RepoError::InvalidUrl`] if `config.base_url` is not an
    /// absolute URL that can hold a path.
    pub fn new(config: RepoConfig, client: Box<dyn HttpClient>) -> RepoResult<Self> {
        Ok(Self {
            engine: SyncEngine::new(config, client)?,
        })
    }

    /// Start synchronizing from the root. While a sync is running further
    /// calls are ignored.
    pub fn update(&mut self) {
        self.engine.update();
    }

    /// Do whatever work is ready. Call regularly until
    /// [`is_doing_sync`](Self::is_doing_sync) returns false.
    pub fn process(&mut self) {
        self.engine.process();
    }

    /// Abandon the running sync, keeping what is already on disk.
    pub fn cancel(&mut self) {
        self.engine.cancel();
    }

    pub fn is_doing_sync(&self) -> bool {
        self.engine.is_doing_sync()
    }

    /// Outcome of the most recent sync.
    ///
    /// [`ResultCode::NoError`] while a sync is running without a hard error,
    /// [`ResultCode::PartialUpdate`] once it finished with some failures.
    pub fn failure(&self) -> ResultCode {
        self.engine.failure()
    }

    /// Every path that failed in the most recent sync.
    pub fn failures(&self) -> &[Failure] {
        self.engine.failures()
    }

    /// Bytes of file and archive content scheduled for download.
    pub fn bytes_to_download(&self) -> u64 {
        self.engine.bytes_to_download()
    }

    /// Bytes of file and archive content received.
    pub fn bytes_downloaded(&self) -> u64 {
        self.engine.bytes_downloaded()
    }

    /// Archive bytes downloaded but not yet extracted.
    pub fn bytes_to_extract(&self) -> u64 {
        self.engine.bytes_to_extract()
    }

    /// Directory most recently diffed.
    pub fn last_checked_path(&self) -> &str {
        self.engine.last_checked_path()
    }

    /// Counters for the most recent sync.
    pub fn stats(&self) -> SyncStats {
        self.engine.stats()
    }

    /// Requests currently in flight.
    pub fn active_requests(&self) -> usize {
        self.engine.active_requests()
    }

    /// Requests waiting for a free slot.
    pub fn queued_requests(&self) -> usize {
        self.engine.queued_requests()
    }

    /// Install a predicate consulted once per [`SyncItem`]; returning
    /// false leaves that item untouched.
    pub fn set_filter<F>(&mut self, filter: F)
    where
        F: FnMut(&SyncItem) -> bool + 'static,
    {
        self.engine.set_filter(Some(Box::new(filter)));
    }

    pub fn clear_filter(&mut self) {
        self.engine.set_filter(None);
    }

    /// Copy missing files from `path` when their hash matches the index.
    pub fn set_installed_copy_path(&mut self, path: impl Into<PathBuf>) {
        self.engine.set_installed_copy_path(Some(path.into()));
    }

    pub fn set_recheck_timeout_enabled(&mut self, enabled: bool) {
        self.engine.set_recheck_timeout_enabled(enabled);
    }

    /// Point at a different remote root. Applies to requests queued after
    /// the call.
    pub fn set_base_url(&mut self, base_url: &str) -> RepoResult<()> {
        self.engine.set_base_url(base_url)
    }

    pub fn base_url(&self) -> &Url {
        self.engine.base_url()
    }

    /// Local root of the mirror.
    pub fn fs_base(&self) -> &Path {
        &self.engine.config().fs_base
    }

    pub fn config(&self) -> &RepoConfig {
        self.engine.config()
    }
}

impl std::fmt::Debug for HttpRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRepository")
            .field("base_url", &self.base_url().as_str())
            .field("fs_base", &self.fs_base())
            .field("syncing", &self.is_doing_sync())
            .finish()
    }
}
