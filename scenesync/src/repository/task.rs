//! Deferred work drained by `process()`.
//!
//! Tasks are state-tagged values rather than closures. Each call to
//! `process()` runs every task that was queued at its start once; a task
//! that returns [`ProcessResult::Continue`] goes to the back of the queue.

use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use tracing::debug;

use super::directory::DirId;
use super::error::RepoError;
use super::index::DirectoryIndexEntry;
use crate::archive::{ArchiveExtractor, ExtractedFile};

/// Bytes of archive fed to the extractor per task step.
const EXTRACT_STEP_SIZE: usize = 256 * 1024;

/// Outcome of running a task once.
#[derive(Debug)]
pub enum ProcessResult {
    /// More work remains; run again on a later tick.
    Continue,
    /// The task finished.
    Done,
    /// The task gave up.
    Failed(RepoError),
}

/// A queued unit of work.
#[derive(Debug)]
pub(crate) enum RepoProcessTask {
    /// Re-diff a directory from its saved `.dirindex` without fetching.
    DiffLocalIndex { directory: DirId },
    /// Feed a downloaded archive to the extractor.
    Extract(ExtractTask),
    /// Copy a file from the installed-copy tree instead of downloading it.
    CopyInstalled {
        directory: DirId,
        entry: DirectoryIndexEntry,
        source: PathBuf,
    },
}

impl RepoProcessTask {
    /// Directory the task works in.
    pub fn directory(&self) -> DirId {
        match self {
            Self::DiffLocalIndex { directory } => *directory,
            Self::Extract(task) => task.directory,
            Self::CopyInstalled { directory, .. } => *directory,
        }
    }
}

/// Incremental extraction of one downloaded archive.
pub(crate) struct ExtractTask {
    pub directory: DirId,
    /// Repository-relative path of the archive.
    pub path: String,
    pub entry: DirectoryIndexEntry,
    /// Downloaded archive, removed once the task completes.
    pub archive_path: PathBuf,
    reader: Option<File>,
    extractor: ArchiveExtractor,
    remaining: u64,
    buffer: Vec<u8>,
}

impl std::fmt::Debug for ExtractTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractTask")
            .field("path", &self.path)
            .field("archive_path", &self.archive_path)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl ExtractTask {
    /// Prepare to extract `archive_path` into `target_dir`.
    ///
    /// The archive's single top-level directory is stripped and every
    /// extracted file is hashed.
    pub fn new(
        directory: DirId,
        path: String,
        entry: DirectoryIndexEntry,
        archive_path: PathBuf,
        target_dir: PathBuf,
        size: u64,
    ) -> Self {
        let mut extractor = ArchiveExtractor::new(target_dir);
        extractor.set_remove_topmost_directory(true);
        extractor.set_create_dir_hash_entries(true);

        Self {
            directory,
            path,
            entry,
            archive_path,
            reader: None,
            extractor,
            remaining: size,
            buffer: vec![0u8; EXTRACT_STEP_SIZE],
        }
    }

    /// Archive bytes not yet fed to the extractor.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Directory the archive is extracted into.
    pub fn target_dir(&self) -> PathBuf {
        self.extractor.root_path().to_path_buf()
    }

    /// Feed the next chunk; flushes the extractor at end of file.
    pub fn step(&mut self) -> ProcessResult {
        let read_failed = |path: &PathBuf, source: io::Error| RepoError::ReadFailed {
            path: path.clone(),
            source,
        };

        if self.reader.is_none() {
            match File::open(&self.archive_path) {
                Ok(file) => self.reader = Some(file),
                Err(e) => return ProcessResult::Failed(read_failed(&self.archive_path, e)),
            }
        }
        let Some(reader) = self.reader.as_mut() else {
            return ProcessResult::Done;
        };

        let read = match reader.read(&mut self.buffer) {
            Ok(read) => read,
            Err(e) => return ProcessResult::Failed(read_failed(&self.archive_path, e)),
        };

        if read == 0 {
            self.remaining = 0;
            self.reader = None;
            return match self.extractor.flush() {
                Ok(()) => {
                    debug!(path = %self.path, files = self.extractor.extracted_files().len(), "Archive extracted");
                    ProcessResult::Done
                }
                Err(source) => ProcessResult::Failed(RepoError::Extraction {
                    path: self.path.clone(),
                    source,
                }),
            };
        }

        self.remaining = self.remaining.saturating_sub(read as u64);
        match self.extractor.extract_bytes(&self.buffer[..read]) {
            Ok(()) => ProcessResult::Continue,
            Err(source) => ProcessResult::Failed(RepoError::Extraction {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Files written so far, with their hashes.
    pub fn take_extracted(&mut self) -> Vec<ExtractedFile> {
        self.extractor.take_extracted_files()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::directory::{DirArena, HttpDirectory};
    use crate::repository::hash_cache::HashCache;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    fn dir_id() -> DirId {
        DirArena::new().insert(HttpDirectory {
            relative_path: String::new(),
            parent: None,
            children: Vec::new(),
            hash_cache: HashCache::new(),
            expected_index_hash: String::new(),
        })
    }

    fn gzip_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = ::tar::Builder::new(encoder);
        for (path, data) in entries {
            let mut header = ::tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, path, *data).unwrap();
        }
        let mut encoder = builder.into_inner().unwrap();
        encoder.flush().unwrap();
        encoder.finish().unwrap()
    }

    fn run(task: &mut ExtractTask) -> ProcessResult {
        for _ in 0..1000 {
            match task.step() {
                ProcessResult::Continue => continue,
                other => return other,
            }
        }
        panic!("task never finished");
    }

    #[test]
    fn test_extract_task_writes_files() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join(".Models.tgz.part");
        let bytes = gzip_tar(&[("Models/a.ac", &b"model a"[..]), ("Models/sub/b.ac", &b"b"[..])]);
        fs::write(&archive, &bytes).unwrap();

        let mut task = ExtractTask::new(
            dir_id(),
            "Models.tgz".to_string(),
            DirectoryIndexEntry::tarball("Models.tgz", "", bytes.len() as u64),
            archive,
            temp.path().join("Models"),
            bytes.len() as u64,
        );

        assert!(matches!(run(&mut task), ProcessResult::Done));
        assert_eq!(task.remaining(), 0);
        assert_eq!(fs::read(temp.path().join("Models/a.ac")).unwrap(), b"model a");
        assert_eq!(fs::read(temp.path().join("Models/sub/b.ac")).unwrap(), b"b");

        let mut extracted = task.take_extracted();
        extracted.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(extracted[0].path, "a.ac");
        assert!(extracted[0].hash.is_some());
    }

    #[test]
    fn test_extract_task_fails_on_garbage() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join(".bad.tgz.part");
        fs::write(&archive, vec![0x42u8; 1024]).unwrap();

        let mut task = ExtractTask::new(
            dir_id(),
            "bad.tgz".to_string(),
            DirectoryIndexEntry::tarball("bad.tgz", "", 1024),
            archive,
            temp.path().join("bad"),
            1024,
        );

        match run(&mut task) {
            ProcessResult::Failed(e) => assert_eq!(e.result_code(), crate::repository::ResultCode::Io),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_missing_archive_fails() {
        let temp = TempDir::new().unwrap();
        let mut task = ExtractTask::new(
            dir_id(),
            "gone.tgz".to_string(),
            DirectoryIndexEntry::tarball("gone.tgz", "", 1),
            temp.path().join("nope"),
            temp.path().join("gone"),
            1,
        );
        assert!(matches!(task.step(), ProcessResult::Failed(_)));
    }
}
