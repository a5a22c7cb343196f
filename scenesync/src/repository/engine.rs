//! The sync engine behind [`HttpRepository`](super::HttpRepository).
//!
//! Everything here runs on the caller's thread inside `update()`,
//! `process()` and `cancel()`. Waiting is modelled as requests sitting in
//! the pool and tasks sitting in the queue between calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};
use url::Url;

use super::config::RepoConfig;
use super::directory::{
    compute_sync_items, join_relative, local_path, saved_index_hash, tarball_stem, DirArena,
    DirId, HttpDirectory, LocalKind, SyncAction, SyncItem,
};
use super::error::{Failure, RepoError, RepoResult, ResultCode};
use super::hash_cache::{HashCache, HashCacheEntry};
use super::index::{DirectoryIndex, DirectoryIndexEntry, EntryType, INDEX_FILE_NAME};
use super::request::{ReceivedBody, RepoGetRequest, RequestFinish, RequestKind, RequestPool};
use super::task::{ExtractTask, ProcessResult, RepoProcessTask};
use crate::archive::ExtractedFile;
use crate::hash;
use crate::http::{HttpClient, TransportErrorKind, TransportEvent};

/// Predicate deciding whether a [`SyncItem`] is acted on.
pub type SyncFilterFn = Box<dyn FnMut(&SyncItem) -> bool>;

/// Counters for the most recent sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// GET requests started, retries included.
    pub requests_issued: u64,
    /// Directory indexes downloaded.
    pub indexes_fetched: u64,
    /// Files downloaded and written.
    pub files_written: u64,
    /// Files copied from the installed-copy tree.
    pub files_copied: u64,
    /// Files written by archive extraction.
    pub files_extracted: u64,
    /// Sync items rejected by the filter.
    pub files_filtered: u64,
}

/// Validate a repository base URL.
pub(crate) fn parse_base_url(base_url: &str) -> RepoResult<Url> {
    let url = Url::parse(base_url)
        .map_err(|e| RepoError::InvalidUrl(format!("{}: {}", base_url, e)))?;
    if url.cannot_be_a_base() {
        return Err(RepoError::InvalidUrl(format!(
            "{}: cannot hold a path",
            base_url
        )));
    }
    Ok(url)
}

pub(crate) struct SyncEngine {
    config: RepoConfig,
    base_url: Url,
    client: Box<dyn HttpClient>,
    dirs: DirArena,
    root: Option<DirId>,
    pool: RequestPool,
    tasks: VecDeque<RepoProcessTask>,
    failures: Vec<Failure>,
    hard_failure: Option<ResultCode>,
    status: ResultCode,
    syncing: bool,
    filter: Option<SyncFilterFn>,
    bytes_to_download: u64,
    bytes_downloaded: u64,
    bytes_to_extract: u64,
    last_checked_path: String,
    stats: SyncStats,
    requests_at_start: u64,
    /// Unix time captured when the current sync started.
    now: i64,
}

impl SyncEngine {
    pub fn new(config: RepoConfig, client: Box<dyn HttpClient>) -> RepoResult<Self> {
        let base_url = parse_base_url(&config.base_url)?;
        let pool = RequestPool::new(config.concurrency_limit);
        Ok(Self {
            config,
            base_url,
            client,
            dirs: DirArena::new(),
            root: None,
            pool,
            tasks: VecDeque::new(),
            failures: Vec::new(),
            hard_failure: None,
            status: ResultCode::NoError,
            syncing: false,
            filter: None,
            bytes_to_download: 0,
            bytes_downloaded: 0,
            bytes_to_extract: 0,
            last_checked_path: String::new(),
            stats: SyncStats::default(),
            requests_at_start: 0,
            now: 0,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn set_base_url(&mut self, base_url: &str) -> RepoResult<()> {
        self.base_url = parse_base_url(base_url)?;
        self.config.base_url = base_url.to_string();
        Ok(())
    }

    pub fn set_filter(&mut self, filter: Option<SyncFilterFn>) {
        self.filter = filter;
    }

    pub fn set_installed_copy_path(&mut self, path: Option<PathBuf>) {
        self.config.installed_copy_path = path;
    }

    pub fn set_recheck_timeout_enabled(&mut self, enabled: bool) {
        self.config.recheck_timeout_enabled = enabled;
    }

    pub fn is_doing_sync(&self) -> bool {
        self.syncing
    }

    pub fn failure(&self) -> ResultCode {
        self.status
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn bytes_to_download(&self) -> u64 {
        self.bytes_to_download
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    pub fn bytes_to_extract(&self) -> u64 {
        self.bytes_to_extract
    }

    pub fn last_checked_path(&self) -> &str {
        &self.last_checked_path
    }

    pub fn stats(&self) -> SyncStats {
        let mut stats = self.stats;
        stats.requests_issued = self.pool.started() - self.requests_at_start;
        stats
    }

    pub fn active_requests(&self) -> usize {
        self.pool.active_len()
    }

    pub fn queued_requests(&self) -> usize {
        self.pool.queued_len()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a sync from the root. Ignored while one is running.
    pub fn update(&mut self) {
        if self.syncing {
            debug!("Sync already running, update coalesced");
            return;
        }

        info!(
            url = %self.base_url,
            dest = %self.config.fs_base.display(),
            "Starting sync"
        );
        self.syncing = true;
        self.failures.clear();
        self.hard_failure = None;
        self.status = ResultCode::NoError;
        self.bytes_to_download = 0;
        self.bytes_downloaded = 0;
        self.bytes_to_extract = 0;
        self.last_checked_path.clear();
        self.stats = SyncStats::default();
        self.requests_at_start = self.pool.started();
        self.now = chrono::Utc::now().timestamp();

        let fs_base = self.config.fs_base.clone();
        if let Err(source) = fs::create_dir_all(&fs_base) {
            self.fatal(
                "",
                RepoError::CreateDirFailed {
                    path: fs_base,
                    source,
                },
            );
            return;
        }

        let root = match self.root.filter(|id| self.dirs.contains(*id)) {
            Some(root) => root,
            None => {
                let root = self
                    .dirs
                    .insert(HttpDirectory::new(&fs_base, String::new(), None));
                self.root = Some(root);
                root
            }
        };
        self.start_directory(root);
    }

    /// Drain ready transport events and run queued tasks once.
    pub fn process(&mut self) {
        if !self.syncing {
            return;
        }

        for event in self.client.poll_events() {
            self.handle_event(event);
            if !self.syncing {
                return;
            }
        }

        self.pool.admit(self.client.as_mut());
        self.run_tasks();

        if self.syncing && self.pool.is_empty() && self.tasks.is_empty() {
            self.finish_sync();
        }
    }

    /// Abandon the running sync. The directory tree is kept so a later
    /// `update()` resumes from what is on disk.
    pub fn cancel(&mut self) {
        if !self.syncing {
            return;
        }
        info!("Cancelling sync");
        self.abort(ResultCode::Cancelled);
    }

    fn finish_sync(&mut self) {
        self.flush_hash_caches();
        self.stats.requests_issued = self.pool.started() - self.requests_at_start;
        self.status = match self.hard_failure {
            Some(code) => code,
            None if !self.failures.is_empty() => ResultCode::PartialUpdate,
            None => ResultCode::NoError,
        };
        self.syncing = false;

        info!(
            status = %self.status,
            failures = self.failures.len(),
            bytes = self.bytes_downloaded,
            files = self.stats.files_written,
            "Sync finished"
        );
    }

    /// Stop everything and finish with `code`.
    fn abort(&mut self, code: ResultCode) {
        self.hard_failure = Some(code);
        for mut request in self.pool.cancel_all(self.client.as_mut()) {
            request.discard_temp();
        }
        for task in self.tasks.drain(..) {
            if let RepoProcessTask::Extract(task) = task {
                remove_temp(&task.archive_path);
            }
        }
        self.bytes_to_extract = 0;
        self.finish_sync();
    }

    fn flush_hash_caches(&mut self) {
        let fs_base = self.config.fs_base.clone();
        for id in self.dirs.ids() {
            let Some(dir) = self.dirs.get_mut(id) else {
                continue;
            };
            let path = dir.local_path(&fs_base);
            if let Err(e) = dir.hash_cache.save_if_dirty(&path) {
                warn!(path = %path.display(), error = %e, "Failed to save hash cache");
            }
        }
    }

    // ========================================================================
    // Failures
    // ========================================================================

    fn record_failure(&mut self, path: &str, code: ResultCode) {
        warn!(path, error = %code, "Sync failure");
        self.failures.push(Failure {
            path: path.to_string(),
            error: code,
        });

        if self.failures.len() > self.config.max_permitted_failures {
            warn!(
                failures = self.failures.len(),
                "Too many failures, aborting sync"
            );
            self.abort(code);
        }
    }

    /// Local filesystem errors end the sync.
    fn fatal(&mut self, path: &str, err: RepoError) {
        error!(path, error = %err, "Aborting sync");
        let code = err.result_code();
        self.failures.push(Failure {
            path: path.to_string(),
            error: code,
        });
        self.abort(code);
    }

    /// A directory could not be synced. Only the root is fatal.
    fn directory_failed(&mut self, id: DirId, code: ResultCode) {
        let path = self
            .dirs
            .get(id)
            .map(|dir| dir.relative_path.clone())
            .unwrap_or_default();

        if Some(id) == self.root {
            warn!(error = %code, "Root index failed");
            self.failures.push(Failure { path, error: code });
            self.abort(code);
        } else {
            self.record_failure(&path, code);
        }
    }

    fn handle_error(&mut self, id: DirId, path: &str, err: RepoError) {
        if err.is_fatal() {
            self.fatal(path, err);
        } else {
            warn!(path, error = %err, "Directory sync failed");
            self.directory_failed(id, err.result_code());
        }
    }

    // ========================================================================
    // Directories
    // ========================================================================

    fn resource_url(&self, relative: &str) -> RepoResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RepoError::InvalidUrl(self.base_url.to_string()))?;
            segments.pop_if_empty();
            segments.extend(relative.split('/').filter(|s| !s.is_empty()));
        }
        Ok(url)
    }

    /// Fetch a directory's index, or re-diff the saved copy when it is
    /// known to be current.
    fn start_directory(&mut self, id: DirId) {
        if !self.syncing {
            return;
        }
        let Some(dir) = self.dirs.get(id) else {
            return;
        };
        let dir_path = dir.local_path(&self.config.fs_base);
        let timeout = self.config.recheck_timeout.as_secs() as i64;

        let current = match saved_index_hash(&dir_path) {
            Some(saved) if !dir.expected_index_hash.is_empty() => {
                hash::hashes_match(&saved, &dir.expected_index_hash)
            }
            Some(_) => {
                self.config.recheck_timeout_enabled
                    && dir.hash_cache.verified_within(self.now, timeout)
            }
            None => false,
        };

        if current {
            debug!(path = %dir.relative_path, "Index current, diffing saved copy");
            self.tasks
                .push_back(RepoProcessTask::DiffLocalIndex { directory: id });
        } else {
            self.request_index(id);
        }
    }

    fn request_index(&mut self, id: DirId) {
        let Some(dir) = self.dirs.get(id) else {
            return;
        };
        let path = dir.child_path(INDEX_FILE_NAME);
        let expected = dir.expected_index_hash.clone();

        match self.resource_url(&path) {
            Ok(url) => {
                let request = RepoGetRequest::index(id, path, url, expected);
                self.pool.make_request(request, self.client.as_mut());
            }
            Err(e) => {
                warn!(path, error = %e, "Cannot build index URL");
                self.directory_failed(id, e.result_code());
            }
        }
    }

    fn filter_accepts(&mut self, item: &SyncItem) -> bool {
        match self.filter.as_mut() {
            Some(filter) => filter(item),
            None => true,
        }
    }

    /// Diff `index` against disk and act on every accepted item.
    ///
    /// Removals happen before any request is queued. Child directories are
    /// started only after the whole index has been applied.
    fn apply_index(&mut self, id: DirId, index: &DirectoryIndex) -> RepoResult<()> {
        let fs_base = self.config.fs_base.clone();
        let Some(dir) = self.dirs.get_mut(id) else {
            return Ok(());
        };
        let relative = dir.relative_path.clone();
        let dir_path = dir.local_path(&fs_base);
        self.last_checked_path = relative.clone();

        fs::create_dir_all(&dir_path).map_err(|source| RepoError::CreateDirFailed {
            path: dir_path.clone(),
            source,
        })?;
        let planned = compute_sync_items(&relative, &dir_path, index, &mut dir.hash_cache)
            .map_err(|source| RepoError::ReadFailed {
                path: dir_path.clone(),
                source,
            })?;

        let mut accepted = Vec::with_capacity(planned.len());
        for plan in planned {
            if self.filter_accepts(&plan.item) {
                accepted.push(plan);
            } else {
                debug!(path = %plan.item.relative_path(), action = ?plan.item.action, "Filtered");
                self.stats.files_filtered += 1;
            }
        }

        for plan in &accepted {
            if plan.item.action == SyncAction::Delete || plan.needs_type_change() {
                self.remove_local(id, &dir_path, &plan.item.filename, plan.local)?;
            }
        }

        let mut requests = Vec::new();
        let mut children = Vec::new();
        for plan in accepted {
            let Some(entry) = plan.entry else {
                continue;
            };
            match (entry.entry_type, plan.item.action) {
                (_, SyncAction::Delete) => {}
                (EntryType::Directory, _) => {
                    children.push(self.ensure_child(id, &relative, &dir_path, &entry)?);
                }
                (_, SyncAction::UpToDate) => {}
                (EntryType::File, action) => {
                    let installed = match action {
                        SyncAction::Add => self.installed_copy_for(&relative, &entry),
                        _ => None,
                    };
                    match installed {
                        Some(source) => self.tasks.push_back(RepoProcessTask::CopyInstalled {
                            directory: id,
                            entry,
                            source,
                        }),
                        None => requests.push(self.content_request(
                            RequestKind::File,
                            id,
                            &relative,
                            &dir_path,
                            entry,
                        )?),
                    }
                }
                (EntryType::Tarball, _) => {
                    requests.push(self.content_request(
                        RequestKind::Tarball,
                        id,
                        &relative,
                        &dir_path,
                        entry,
                    )?);
                }
            }
        }

        let names: HashSet<&str> = index.entries.iter().map(|e| e.name.as_str()).collect();
        if let Some(dir) = self.dirs.get_mut(id) {
            dir.hash_cache.retain(|name| names.contains(name));
        }

        if !self.syncing {
            return Ok(());
        }
        for request in requests {
            self.pool.make_request(request, self.client.as_mut());
        }
        for child in children {
            self.start_directory(child);
        }
        Ok(())
    }

    fn remove_local(
        &mut self,
        id: DirId,
        dir_path: &Path,
        name: &str,
        local: Option<LocalKind>,
    ) -> RepoResult<()> {
        let path = dir_path.join(name);
        let removed = match local {
            Some(LocalKind::Directory) => {
                if let Some(child) = self.dirs.find_child(id, name) {
                    self.drop_directory_nodes(child);
                }
                fs::remove_dir_all(&path)
            }
            Some(LocalKind::File) => fs::remove_file(&path),
            None => Ok(()),
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(RepoError::RemoveFailed { path, source }),
        }

        if let Some(dir) = self.dirs.get_mut(id) {
            dir.hash_cache.remove(name);
        }
        debug!(path = %path.display(), "Removed");
        Ok(())
    }

    /// Forget a directory subtree, abandoning its requests and tasks.
    fn drop_directory_nodes(&mut self, id: DirId) {
        let removed: HashSet<DirId> = self.dirs.remove_subtree(id).into_iter().collect();
        for mut request in self
            .pool
            .cancel_for_directories(&removed, self.client.as_mut())
        {
            request.discard_temp();
        }
        self.tasks.retain(|task| !removed.contains(&task.directory()));
    }

    fn ensure_child(
        &mut self,
        id: DirId,
        relative: &str,
        dir_path: &Path,
        entry: &DirectoryIndexEntry,
    ) -> RepoResult<DirId> {
        let child_path = dir_path.join(&entry.name);
        fs::create_dir_all(&child_path).map_err(|source| RepoError::CreateDirFailed {
            path: child_path,
            source,
        })?;

        let child = match self.dirs.find_child(id, &entry.name) {
            Some(child) => child,
            None => {
                let node = HttpDirectory::new(
                    &self.config.fs_base,
                    join_relative(relative, &entry.name),
                    Some(id),
                );
                let child = self.dirs.insert(node);
                if let Some(parent) = self.dirs.get_mut(id) {
                    parent.children.push(child);
                }
                child
            }
        };
        if let Some(node) = self.dirs.get_mut(child) {
            node.expected_index_hash = entry.hash.clone();
        }
        Ok(child)
    }

    fn installed_copy_for(&self, relative: &str, entry: &DirectoryIndexEntry) -> Option<PathBuf> {
        let base = self.config.installed_copy_path.as_ref()?;
        if entry.hash.is_empty() {
            return None;
        }
        let candidate = local_path(base, &join_relative(relative, &entry.name));
        candidate.is_file().then_some(candidate)
    }

    fn content_request(
        &mut self,
        kind: RequestKind,
        id: DirId,
        relative: &str,
        dir_path: &Path,
        entry: DirectoryIndexEntry,
    ) -> RepoResult<RepoGetRequest> {
        let path = join_relative(relative, &entry.name);
        let url = self.resource_url(&path)?;
        let temp_path = dir_path.join(format!(".{}.part", entry.name));
        self.bytes_to_download += entry.size;
        Ok(RepoGetRequest::content(kind, id, path, url, entry, temp_path))
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn handle_event(&mut self, event: TransportEvent) {
        let id = event.id();
        match event {
            TransportEvent::Started {
                status,
                content_length,
                ..
            } => {
                let Some(request) = self.pool.active_mut(id) else {
                    return;
                };
                request.status = Some(status);
                if !request.is_success() {
                    return;
                }
                if let Err(e) = request.begin_body(content_length) {
                    let path = request.path.clone();
                    self.fatal(&path, e);
                }
            }
            TransportEvent::Data { chunk, .. } => {
                let outcome = match self.pool.active_mut(id) {
                    Some(request) if request.is_success() => request
                        .write_body(&chunk)
                        .map(|()| request.is_content())
                        .map_err(|e| (request.path.clone(), e)),
                    _ => return,
                };
                match outcome {
                    Ok(true) => self.bytes_downloaded += chunk.len() as u64,
                    Ok(false) => {}
                    Err((path, e)) => self.fatal(&path, e),
                }
            }
            TransportEvent::Completed { .. } => {
                if let Some(request) = self.pool.take_active(id) {
                    self.request_completed(request);
                }
            }
            TransportEvent::Failed { kind, message, .. } => {
                if let Some(request) = self.pool.take_active(id) {
                    debug!(path = %request.path, ?kind, message, "Transfer failed");
                    let code = match kind {
                        TransportErrorKind::Cancelled => ResultCode::Cancelled,
                        TransportErrorKind::Socket | TransportErrorKind::Timeout => {
                            ResultCode::Socket
                        }
                    };
                    self.retry_or_fail(request, code, code.is_transient());
                }
            }
        }
    }

    fn request_completed(&mut self, mut request: RepoGetRequest) {
        if !request.is_success() {
            let status = request.status.unwrap_or(0);
            let code = match (status, request.kind) {
                (404, RequestKind::Index) => ResultCode::NotFound,
                (404, _) => ResultCode::FileNotFound,
                _ => ResultCode::Http,
            };
            debug!(path = %request.path, status, "HTTP error");
            // Client errors will not change on a second attempt
            let retryable = code.is_transient() && (500..600).contains(&status);
            self.retry_or_fail(request, code, retryable);
            return;
        }

        let (body, actual) = match request.finish_body() {
            Ok(finished) => finished,
            Err(e) => {
                let path = request.path.clone();
                self.fatal(&path, e);
                return;
            }
        };

        if !request.expected_hash.is_empty() && !hash::hashes_match(&actual, &request.expected_hash)
        {
            self.checksum_mismatch(request, &actual);
            return;
        }

        match body {
            ReceivedBody::Memory(bytes) => self.index_received(&request, &bytes, &actual),
            ReceivedBody::File(temp_path) => self.content_received(&request, temp_path, &actual),
        }
        self.pool
            .finished_request(request, RequestFinish::Done, self.client.as_mut());
    }

    fn retry_or_fail(&mut self, mut request: RepoGetRequest, code: ResultCode, retryable: bool) {
        if retryable && request.attempts < self.config.max_attempts {
            warn!(
                path = %request.path,
                error = %code,
                attempt = request.attempts,
                "Request failed, retrying"
            );
            if request.is_content() {
                self.bytes_to_download += request.bytes_received;
            }
            self.pool
                .finished_request(request, RequestFinish::Retry, self.client.as_mut());
            return;
        }

        request.discard_temp();
        let (kind, directory, path) = (request.kind, request.directory, request.path.clone());
        self.pool
            .finished_request(request, RequestFinish::Done, self.client.as_mut());

        match kind {
            RequestKind::Index => self.directory_failed(directory, code),
            RequestKind::File | RequestKind::Tarball => self.record_failure(&path, code),
        }
    }

    fn checksum_mismatch(&mut self, mut request: RepoGetRequest, actual: &str) {
        let err = RepoError::ChecksumMismatch {
            path: request.path.clone(),
            expected: request.expected_hash.clone(),
            actual: actual.to_string(),
        };
        warn!(error = %err, retries = request.checksum_retries, "Download rejected");
        if request.checksum_retries < 1 {
            request.checksum_retries += 1;
            if request.is_content() {
                self.bytes_to_download += request.bytes_received;
            }
            self.pool
                .finished_request(request, RequestFinish::Retry, self.client.as_mut());
            return;
        }

        request.discard_temp();
        let (kind, directory, path) = (request.kind, request.directory, request.path.clone());
        self.pool
            .finished_request(request, RequestFinish::Done, self.client.as_mut());
        match kind {
            RequestKind::Index => self.directory_failed(directory, err.result_code()),
            _ => self.record_failure(&path, err.result_code()),
        }
    }

    fn index_received(&mut self, request: &RepoGetRequest, bytes: &[u8], hash: &str) {
        let id = request.directory;
        let Some(dir) = self.dirs.get(id) else {
            debug!(path = %request.path, "Directory gone, dropping index");
            return;
        };
        let relative = dir.relative_path.clone();
        let dir_path = dir.local_path(&self.config.fs_base);
        self.stats.indexes_fetched += 1;

        let index = match DirectoryIndex::parse(bytes) {
            Ok(index) => index,
            Err(e) => {
                let err = RepoError::IndexParse {
                    path: request.path.clone(),
                    reason: e.to_string(),
                };
                self.handle_error(id, &relative, err);
                return;
            }
        };

        if let Err(source) = fs::create_dir_all(&dir_path) {
            self.fatal(
                &relative,
                RepoError::CreateDirFailed {
                    path: dir_path,
                    source,
                },
            );
            return;
        }
        let index_path = dir_path.join(INDEX_FILE_NAME);
        let unchanged = saved_index_hash(&dir_path)
            .is_some_and(|saved| hash::hashes_match(&saved, hash));
        if unchanged {
            debug!(path = %request.path, "Index unchanged on disk");
        } else if let Err(source) = fs::write(&index_path, bytes) {
            self.fatal(
                &relative,
                RepoError::WriteFailed {
                    path: index_path,
                    source,
                },
            );
            return;
        }

        match self.apply_index(id, &index) {
            Ok(()) => {
                let now = self.now;
                let timeout = self.config.recheck_timeout.as_secs() as i64;
                if let Some(dir) = self.dirs.get_mut(id) {
                    // A stamp still inside the window is as good as a new one
                    if !dir.hash_cache.verified_within(now, timeout) {
                        dir.hash_cache.set_verified_at(now);
                    }
                }
            }
            Err(e) => self.handle_error(id, &relative, e),
        }
    }

    fn content_received(&mut self, request: &RepoGetRequest, temp_path: PathBuf, actual: &str) {
        let (Some(dir), Some(entry)) = (self.dirs.get(request.directory), request.entry.clone())
        else {
            remove_temp(&temp_path);
            return;
        };
        let dir_path = dir.local_path(&self.config.fs_base);

        match request.kind {
            RequestKind::File => {
                let final_path = dir_path.join(&entry.name);
                if let Err(source) = fs::rename(&temp_path, &final_path) {
                    remove_temp(&temp_path);
                    self.fatal(
                        &request.path,
                        RepoError::WriteFailed {
                            path: final_path,
                            source,
                        },
                    );
                    return;
                }
                if let Some(dir) = self.dirs.get_mut(request.directory) {
                    if let Err(e) = dir.hash_cache.record_file(&dir_path, &entry.name, actual) {
                        warn!(path = %request.path, error = %e, "Failed to stat downloaded file");
                    }
                }
                self.stats.files_written += 1;
                debug!(path = %request.path, bytes = request.bytes_received, "File updated");
            }
            RequestKind::Tarball => {
                let target = dir_path.join(tarball_stem(&entry.name));
                match fs::remove_dir_all(&target) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => {
                        remove_temp(&temp_path);
                        self.fatal(
                            &request.path,
                            RepoError::RemoveFailed {
                                path: target,
                                source,
                            },
                        );
                        return;
                    }
                }
                self.bytes_to_extract += request.bytes_received;
                self.tasks
                    .push_back(RepoProcessTask::Extract(ExtractTask::new(
                        request.directory,
                        request.path.clone(),
                        entry,
                        temp_path,
                        target,
                        request.bytes_received,
                    )));
            }
            RequestKind::Index => {}
        }
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    fn run_tasks(&mut self) {
        for _ in 0..self.tasks.len() {
            let Some(mut task) = self.tasks.pop_front() else {
                break;
            };
            if !self.dirs.contains(task.directory()) {
                continue;
            }

            match self.run_task(&mut task) {
                ProcessResult::Continue => self.tasks.push_back(task),
                ProcessResult::Done => self.task_done(task),
                ProcessResult::Failed(e) => self.task_failed(task, e),
            }
            if !self.syncing {
                return;
            }
        }
    }

    fn run_task(&mut self, task: &mut RepoProcessTask) -> ProcessResult {
        match task {
            RepoProcessTask::DiffLocalIndex { directory } => self.diff_local_index(*directory),
            RepoProcessTask::Extract(extract) => {
                let before = extract.remaining();
                let result = extract.step();
                let fed = before - extract.remaining();
                self.bytes_to_extract = self.bytes_to_extract.saturating_sub(fed);
                result
            }
            RepoProcessTask::CopyInstalled {
                directory,
                entry,
                source,
            } => self.copy_installed(*directory, entry, source),
        }
    }

    fn diff_local_index(&mut self, id: DirId) -> ProcessResult {
        let Some(dir) = self.dirs.get(id) else {
            return ProcessResult::Done;
        };
        let index_path = dir.local_path(&self.config.fs_base).join(INDEX_FILE_NAME);
        let index = fs::read(&index_path)
            .ok()
            .and_then(|bytes| DirectoryIndex::parse(&bytes).ok());

        match index {
            Some(index) => match self.apply_index(id, &index) {
                Ok(()) => ProcessResult::Done,
                Err(e) => ProcessResult::Failed(e),
            },
            None => {
                debug!(path = %index_path.display(), "Saved index unusable, fetching");
                self.request_index(id);
                ProcessResult::Done
            }
        }
    }

    fn copy_installed(
        &mut self,
        id: DirId,
        entry: &DirectoryIndexEntry,
        source: &Path,
    ) -> ProcessResult {
        let Some(dir) = self.dirs.get(id) else {
            return ProcessResult::Done;
        };
        let relative = dir.relative_path.clone();
        let dir_path = dir.local_path(&self.config.fs_base);
        let temp_path = dir_path.join(format!(".{}.part", entry.name));

        let copied = match hash::hash_file(source) {
            Ok(hash) if hash::hashes_match(&hash, &entry.hash) => {
                fs::copy(source, &temp_path).map(|_| ())
            }
            Ok(_) => Err(io::Error::new(io::ErrorKind::InvalidData, "content differs")),
            Err(e) => Err(e),
        };
        if let Err(e) = copied {
            debug!(source = %source.display(), error = %e, "Installed copy unusable, downloading");
            remove_temp(&temp_path);
            return match self.content_request(
                RequestKind::File,
                id,
                &relative,
                &dir_path,
                entry.clone(),
            ) {
                Ok(request) => {
                    self.pool.make_request(request, self.client.as_mut());
                    ProcessResult::Done
                }
                Err(e) => ProcessResult::Failed(e),
            };
        }

        let final_path = dir_path.join(&entry.name);
        if let Err(source) = fs::rename(&temp_path, &final_path) {
            remove_temp(&temp_path);
            return ProcessResult::Failed(RepoError::WriteFailed {
                path: final_path,
                source,
            });
        }
        if let Some(dir) = self.dirs.get_mut(id) {
            if let Err(e) = dir.hash_cache.record_file(&dir_path, &entry.name, &entry.hash) {
                warn!(path = %final_path.display(), error = %e, "Failed to stat copied file");
            }
        }
        self.stats.files_copied += 1;
        debug!(path = %join_relative(&relative, &entry.name), "Copied from installed tree");
        ProcessResult::Done
    }

    fn task_done(&mut self, task: RepoProcessTask) {
        let RepoProcessTask::Extract(mut extract) = task else {
            return;
        };
        remove_temp(&extract.archive_path);

        let files = extract.take_extracted();
        self.stats.files_extracted += files.len() as u64;
        self.record_extracted_hashes(&extract.target_dir(), &files);

        if let Some(dir) = self.dirs.get_mut(extract.directory) {
            dir.hash_cache.insert(
                extract.entry.name.clone(),
                HashCacheEntry {
                    hash: extract.entry.hash.clone(),
                    mtime: 0,
                    size: extract.entry.size,
                },
            );
        }
        info!(path = %extract.path, files = files.len(), "Archive installed");
    }

    fn task_failed(&mut self, task: RepoProcessTask, err: RepoError) {
        let id = task.directory();
        match task {
            RepoProcessTask::Extract(extract) => {
                remove_temp(&extract.archive_path);
                self.bytes_to_extract = self.bytes_to_extract.saturating_sub(extract.remaining());
                if err.is_fatal() {
                    self.fatal(&extract.path, err);
                } else {
                    warn!(path = %extract.path, error = %err, "Extraction failed");
                    self.record_failure(&extract.path, err.result_code());
                }
            }
            RepoProcessTask::CopyInstalled { entry, .. } => {
                let path = self
                    .dirs
                    .get(id)
                    .map(|dir| dir.child_path(&entry.name))
                    .unwrap_or(entry.name);
                if err.is_fatal() {
                    self.fatal(&path, err);
                } else {
                    self.record_failure(&path, err.result_code());
                }
            }
            RepoProcessTask::DiffLocalIndex { .. } => {
                let path = self
                    .dirs
                    .get(id)
                    .map(|dir| dir.relative_path.clone())
                    .unwrap_or_default();
                self.handle_error(id, &path, err);
            }
        }
    }

    /// Store hashes of extracted files in the caches of the directories
    /// they landed in: a live node's cache if there is one, otherwise the
    /// directory's `.dirhash` on disk.
    fn record_extracted_hashes(&mut self, target_dir: &Path, files: &[ExtractedFile]) {
        let mut by_dir: HashMap<PathBuf, Vec<(String, &str)>> = HashMap::new();
        for file in files {
            let Some(file_hash) = file.hash.as_deref() else {
                continue;
            };
            let full = target_dir.join(&file.path);
            let (Some(parent), Some(name)) = (full.parent(), full.file_name()) else {
                continue;
            };
            by_dir
                .entry(parent.to_path_buf())
                .or_default()
                .push((name.to_string_lossy().into_owned(), file_hash));
        }

        for (dir_path, entries) in by_dir {
            let node = dir_path
                .strip_prefix(&self.config.fs_base)
                .ok()
                .and_then(|rel| rel.to_str())
                .map(|rel| rel.replace('\\', "/"))
                .and_then(|rel| self.dirs.find_by_path(&rel));

            match node.and_then(|id| self.dirs.get_mut(id)) {
                Some(dir) => {
                    for (name, file_hash) in entries {
                        if let Err(e) = dir.hash_cache.record_file(&dir_path, &name, file_hash) {
                            debug!(name, error = %e, "Failed to record extracted hash");
                        }
                    }
                }
                None => {
                    let mut cache = HashCache::load(&dir_path);
                    for (name, file_hash) in entries {
                        if let Err(e) = cache.record_file(&dir_path, &name, file_hash) {
                            debug!(name, error = %e, "Failed to record extracted hash");
                        }
                    }
                    if let Err(e) = cache.save_if_dirty(&dir_path) {
                        warn!(path = %dir_path.display(), error = %e, "Failed to save hash cache");
                    }
                }
            }
        }
    }
}

fn remove_temp(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "Failed to remove temp file");
        }
    }
}
