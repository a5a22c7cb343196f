//! Outstanding GET requests and the admission-controlled request pool.
//!
//! A [`RepoGetRequest`] sits in exactly one of two places: the pool's queue
//! or its active map. [`RequestPool::make_request`] is the only path from
//! the queue into the active map, and it admits requests only while fewer
//! than `concurrency_limit` are active.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::{debug, trace};
use url::Url;

use super::directory::DirId;
use super::error::{RepoError, RepoResult};
use super::index::DirectoryIndexEntry;
use crate::hash::Sha1Hasher;
use crate::http::{HttpClient, RequestId};

/// What a request fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A directory's `.dirindex`.
    Index,
    /// A plain file.
    File,
    /// An archive to extract.
    Tarball,
}

/// How a finished request leaves the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFinish {
    /// Drop the request.
    Done,
    /// Put it back in the queue for another attempt.
    Retry,
}

#[derive(Debug, Default)]
enum Body {
    #[default]
    None,
    Memory(Vec<u8>),
    File(BufWriter<File>),
}

/// Completed response body.
#[derive(Debug)]
pub enum ReceivedBody {
    /// Index content.
    Memory(Vec<u8>),
    /// File or archive content written to the request's temp path.
    File(PathBuf),
}

/// One GET, from queueing until it is done or abandoned.
#[derive(Debug)]
pub struct RepoGetRequest {
    pub kind: RequestKind,
    /// Owning directory.
    pub directory: DirId,
    /// Repository-relative path of the fetched resource.
    pub path: String,
    pub url: Url,
    /// Manifest entry for file and tarball requests.
    pub entry: Option<DirectoryIndexEntry>,
    /// Hash the content must have; empty if unknown.
    pub expected_hash: String,
    pub expected_content_size: Option<u64>,
    pub bytes_received: u64,
    /// Transport attempts started so far.
    pub attempts: u32,
    /// Re-downloads triggered by a hash mismatch.
    pub checksum_retries: u32,
    /// HTTP status of the current attempt.
    pub status: Option<u16>,
    temp_path: Option<PathBuf>,
    hasher: Sha1Hasher,
    body: Body,
}

impl RepoGetRequest {
    /// Request for a directory index.
    pub fn index(directory: DirId, path: String, url: Url, expected_hash: String) -> Self {
        Self {
            kind: RequestKind::Index,
            directory,
            path,
            url,
            entry: None,
            expected_hash,
            expected_content_size: None,
            bytes_received: 0,
            attempts: 0,
            checksum_retries: 0,
            status: None,
            temp_path: None,
            hasher: Sha1Hasher::new(),
            body: Body::None,
        }
    }

    /// Request for a file or tarball, streamed into `temp_path`.
    pub fn content(
        kind: RequestKind,
        directory: DirId,
        path: String,
        url: Url,
        entry: DirectoryIndexEntry,
        temp_path: PathBuf,
    ) -> Self {
        Self {
            kind,
            directory,
            path,
            url,
            expected_hash: entry.hash.clone(),
            expected_content_size: Some(entry.size),
            entry: Some(entry),
            bytes_received: 0,
            attempts: 0,
            checksum_retries: 0,
            status: None,
            temp_path: Some(temp_path),
            hasher: Sha1Hasher::new(),
            body: Body::None,
        }
    }

    /// Whether the current attempt got a 2xx status.
    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|s| (200..300).contains(&s))
    }

    /// Prepare to receive the body of a successful response.
    pub fn begin_body(&mut self, content_length: Option<u64>) -> RepoResult<()> {
        if content_length.is_some() {
            self.expected_content_size = content_length;
        }
        self.body = match &self.temp_path {
            None => Body::Memory(Vec::new()),
            Some(path) => {
                let file = File::create(path).map_err(|source| RepoError::WriteFailed {
                    path: path.clone(),
                    source,
                })?;
                Body::File(BufWriter::new(file))
            }
        };
        Ok(())
    }

    /// Hash and store a body chunk.
    pub fn write_body(&mut self, chunk: &[u8]) -> RepoResult<()> {
        self.hasher.update(chunk);
        self.bytes_received += chunk.len() as u64;
        match &mut self.body {
            Body::None => {}
            Body::Memory(buffer) => buffer.extend_from_slice(chunk),
            Body::File(writer) => {
                writer
                    .write_all(chunk)
                    .map_err(|source| RepoError::WriteFailed {
                        path: self.temp_path.clone().unwrap_or_default(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Close the body, returning it with its SHA-1.
    pub fn finish_body(&mut self) -> RepoResult<(ReceivedBody, String)> {
        let hash = std::mem::take(&mut self.hasher).finish_hex();
        let body = match std::mem::take(&mut self.body) {
            Body::Memory(buffer) => ReceivedBody::Memory(buffer),
            Body::None if self.temp_path.is_none() => ReceivedBody::Memory(Vec::new()),
            Body::None => {
                let path = self.temp_path.clone().unwrap_or_default();
                File::create(&path).map_err(|source| RepoError::WriteFailed {
                    path: path.clone(),
                    source,
                })?;
                ReceivedBody::File(path)
            }
            Body::File(mut writer) => {
                let path = self.temp_path.clone().unwrap_or_default();
                writer.flush().map_err(|source| RepoError::WriteFailed {
                    path: path.clone(),
                    source,
                })?;
                ReceivedBody::File(path)
            }
        };
        Ok((body, hash))
    }

    /// Clear per-attempt state and remove any partial temp file.
    pub fn reset_transfer(&mut self) {
        self.status = None;
        self.bytes_received = 0;
        self.hasher = Sha1Hasher::new();
        self.body = Body::None;
        self.discard_temp();
    }

    /// Remove the temp file, if one was written.
    pub fn discard_temp(&mut self) {
        self.body = Body::None;
        if let Some(path) = &self.temp_path {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %e, "Failed to remove temp file");
                }
            }
        }
    }

    /// Whether this request fetches file or archive content.
    pub fn is_content(&self) -> bool {
        self.kind != RequestKind::Index
    }
}

/// Queued and active requests.
#[derive(Debug)]
pub struct RequestPool {
    queued: VecDeque<RepoGetRequest>,
    active: BTreeMap<RequestId, RepoGetRequest>,
    concurrency_limit: usize,
    next_id: u64,
    started: u64,
}

impl RequestPool {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            queued: VecDeque::new(),
            active: BTreeMap::new(),
            concurrency_limit: concurrency_limit.max(1),
            next_id: 1,
            started: 0,
        }
    }

    /// Queue `request` and admit as many queued requests as the limit allows.
    pub fn make_request(&mut self, request: RepoGetRequest, client: &mut dyn HttpClient) {
        self.queued.push_back(request);
        self.admit(client);
    }

    /// Move queued requests to active while below the concurrency limit.
    pub fn admit(&mut self, client: &mut dyn HttpClient) {
        while self.active.len() < self.concurrency_limit {
            let Some(mut request) = self.queued.pop_front() else {
                break;
            };
            let id = RequestId(self.next_id);
            self.next_id += 1;
            self.started += 1;
            request.attempts += 1;

            trace!(%id, path = %request.path, attempt = request.attempts, "Starting request");
            client.start_get(id, &request.url);
            self.active.insert(id, request);
        }
    }

    /// Return a request taken with [`take_active`](Self::take_active).
    pub fn finished_request(
        &mut self,
        mut request: RepoGetRequest,
        finish: RequestFinish,
        client: &mut dyn HttpClient,
    ) {
        match finish {
            RequestFinish::Done => {}
            RequestFinish::Retry => {
                debug!(path = %request.path, attempts = request.attempts, "Retrying request");
                request.reset_transfer();
                self.queued.push_back(request);
            }
        }
        self.admit(client);
    }

    pub fn active_mut(&mut self, id: RequestId) -> Option<&mut RepoGetRequest> {
        self.active.get_mut(&id)
    }

    /// Remove an active request, e.g. once its terminal event arrived.
    pub fn take_active(&mut self, id: RequestId) -> Option<RepoGetRequest> {
        self.active.remove(&id)
    }

    /// Cancel everything, returning the abandoned requests.
    pub fn cancel_all(&mut self, client: &mut dyn HttpClient) -> Vec<RepoGetRequest> {
        let ids: Vec<RequestId> = self.active.keys().copied().collect();
        let mut cancelled = Vec::with_capacity(ids.len() + self.queued.len());
        for id in ids {
            client.cancel(id);
            if let Some(request) = self.active.remove(&id) {
                cancelled.push(request);
            }
        }
        cancelled.extend(self.queued.drain(..));
        cancelled
    }

    /// Cancel every request owned by one of `directories`.
    pub fn cancel_for_directories(
        &mut self,
        directories: &HashSet<DirId>,
        client: &mut dyn HttpClient,
    ) -> Vec<RepoGetRequest> {
        let ids: Vec<RequestId> = self
            .active
            .iter()
            .filter(|(_, request)| directories.contains(&request.directory))
            .map(|(id, _)| *id)
            .collect();

        let mut cancelled = Vec::new();
        for id in ids {
            client.cancel(id);
            if let Some(request) = self.active.remove(&id) {
                cancelled.push(request);
            }
        }

        let (dropped, kept): (Vec<_>, Vec<_>) = self
            .queued
            .drain(..)
            .partition(|request| directories.contains(&request.directory));
        self.queued = kept.into();
        cancelled.extend(dropped);

        self.admit(client);
        cancelled
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.queued.is_empty()
    }

    /// Requests started since the pool was created, retries included.
    pub fn started(&self) -> u64 {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::MemoryTransport;
    use crate::repository::directory::{DirArena, HttpDirectory};
    use crate::repository::hash_cache::HashCache;

    fn dir_id() -> DirId {
        let mut arena = DirArena::new();
        arena.insert(HttpDirectory {
            relative_path: String::new(),
            parent: None,
            children: Vec::new(),
            hash_cache: HashCache::new(),
            expected_index_hash: String::new(),
        })
    }

    fn index_request(dir: DirId, path: &str) -> RepoGetRequest {
        let url = Url::parse("http://repo.invalid/").unwrap().join(path).unwrap();
        RepoGetRequest::index(dir, path.to_string(), url, String::new())
    }

    #[test]
    fn test_admission_respects_limit() {
        let mut client = MemoryTransport::new();
        let mut pool = RequestPool::new(2);
        let dir = dir_id();

        for i in 0..5 {
            pool.make_request(index_request(dir, &format!("d{}/.dirindex", i)), &mut client);
        }

        assert_eq!(pool.active_len(), 2);
        assert_eq!(pool.queued_len(), 3);
        assert_eq!(client.stats().max_active, 2);
    }

    #[test]
    fn test_finished_request_admits_next_and_retries() {
        let mut client = MemoryTransport::new();
        let mut pool = RequestPool::new(1);
        let dir = dir_id();
        pool.make_request(index_request(dir, "a/.dirindex"), &mut client);
        pool.make_request(index_request(dir, "b/.dirindex"), &mut client);

        let first = pool.take_active(RequestId(1)).unwrap();
        assert_eq!(first.attempts, 1);
        pool.finished_request(first, RequestFinish::Retry, &mut client);

        // b was admitted; a waits behind it
        assert_eq!(pool.active_len(), 1);
        assert_eq!(pool.queued_len(), 1);
        assert_eq!(pool.active_mut(RequestId(2)).unwrap().path, "b/.dirindex");
        assert_eq!(pool.started(), 2);
    }

    #[test]
    fn test_cancel_all_empties_both_sets() {
        let mut client = MemoryTransport::new();
        let mut pool = RequestPool::new(1);
        let dir = dir_id();
        pool.make_request(index_request(dir, "a/.dirindex"), &mut client);
        pool.make_request(index_request(dir, "b/.dirindex"), &mut client);

        let cancelled = pool.cancel_all(&mut client);
        assert_eq!(cancelled.len(), 2);
        assert!(pool.is_empty());
        assert_eq!(client.stats().cancelled, 1);
    }

    #[test]
    fn test_body_hash_and_memory_buffer() {
        let dir = dir_id();
        let mut request = index_request(dir, ".dirindex");
        request.status = Some(200);
        request.begin_body(Some(11)).unwrap();
        request.write_body(b"hello ").unwrap();
        request.write_body(b"world").unwrap();

        let (body, hash) = request.finish_body().unwrap();
        assert_eq!(hash, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert!(matches!(body, ReceivedBody::Memory(ref b) if b == b"hello world"));
        assert_eq!(request.bytes_received, 11);
    }

    #[test]
    fn test_content_body_goes_to_temp_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join(".a.txt.part");
        let url = Url::parse("http://repo.invalid/a.txt").unwrap();
        let entry = DirectoryIndexEntry::file("a.txt", "", 3);
        let mut request = RepoGetRequest::content(
            RequestKind::File,
            dir_id(),
            "a.txt".to_string(),
            url,
            entry,
            path.clone(),
        );

        request.begin_body(None).unwrap();
        request.write_body(b"abc").unwrap();
        let (body, _) = request.finish_body().unwrap();
        assert!(matches!(body, ReceivedBody::File(ref p) if *p == path));
        assert_eq!(fs::read(&path).unwrap(), b"abc");

        request.reset_transfer();
        assert!(!path.exists());
    }
}
