//! Shared entry handling for all archive formats.
//!
//! Every entry name coming out of a tar or zip stream passes through
//! [`EntrySink::resolve`]: top-level directory stripping, the caller's
//! filter, and the path safety check, in that order. Only then does the sink
//! touch the filesystem.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::error::{ArchiveError, ArchiveResult};
use crate::hash::Sha1Hasher;

/// Decision returned by a path filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathResult {
    /// Extract the entry under its own name.
    Accepted,
    /// Do not extract this entry.
    Skipped,
    /// Extract the entry under a different relative path.
    Modified(String),
    /// Stop extracting; the extractor moves to `FilterStopped`.
    Stop,
}

/// Caller-supplied per-entry filter.
pub type PathFilterFn = Box<dyn FnMut(&str) -> PathResult + Send>;

/// A file written by the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    /// Path relative to the extraction root, `/` separated.
    pub path: String,
    /// SHA-1 of the content, when hash entries are enabled.
    pub hash: Option<String>,
    /// Content length in bytes.
    pub size: u64,
}

/// Where an entry should go.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Resolution {
    Write(String),
    Skip,
    Stop(String),
}

/// An entry currently being written.
pub(crate) struct OpenEntry {
    path: String,
    full_path: PathBuf,
    writer: BufWriter<File>,
    hasher: Option<Sha1Hasher>,
    size: u64,
}

/// Check that an archive entry path stays below the extraction root.
///
/// Rejects empty paths, absolute paths (including drive prefixes) and any
/// `..` component.
pub fn is_safe_path(path: &str) -> bool {
    if path.is_empty() || path.starts_with('/') || path.starts_with('\\') {
        return false;
    }

    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return false;
    }

    !path.split(['/', '\\']).any(|component| component == "..")
}

/// Entry writer and bookkeeping shared by the format backends.
pub(crate) struct EntrySink {
    root: PathBuf,
    remove_topmost_directory: bool,
    create_hash_entries: bool,
    filter: Option<PathFilterFn>,
    skipped: Vec<String>,
    extracted: Vec<ExtractedFile>,
    most_recent_path: Option<String>,
}

impl EntrySink {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            remove_topmost_directory: false,
            create_hash_entries: false,
            filter: None,
            skipped: Vec::new(),
            extracted: Vec::new(),
            most_recent_path: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_remove_topmost_directory(&mut self, remove: bool) {
        self.remove_topmost_directory = remove;
    }

    pub fn set_create_hash_entries(&mut self, create: bool) {
        self.create_hash_entries = create;
    }

    pub fn set_filter(&mut self, filter: PathFilterFn) {
        self.filter = Some(filter);
    }

    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn extracted(&self) -> &[ExtractedFile] {
        &self.extracted
    }

    pub fn take_extracted(&mut self) -> Vec<ExtractedFile> {
        std::mem::take(&mut self.extracted)
    }

    pub fn most_recent_path(&self) -> Option<&str> {
        self.most_recent_path.as_deref()
    }

    /// Map a raw entry name to its destination.
    pub fn resolve(&mut self, raw: &str, is_dir: bool) -> Resolution {
        let normalized = raw.trim_start_matches("./").trim_end_matches('/');
        if normalized.is_empty() || normalized == "." {
            return Resolution::Skip;
        }
        self.most_recent_path = Some(normalized.to_string());

        if !is_safe_path(normalized) {
            warn!(path = %raw, "Skipping unsafe archive entry");
            self.skipped.push(raw.to_string());
            return Resolution::Skip;
        }

        let mut path = normalized.to_string();
        if self.remove_topmost_directory {
            match normalized.split_once('/') {
                Some((_, rest)) if !rest.is_empty() => path = rest.to_string(),
                // The wrapping directory itself
                _ if is_dir => return Resolution::Skip,
                _ => {
                    debug!(path = %raw, "Skipping top-level file outside wrapper directory");
                    self.skipped.push(raw.to_string());
                    return Resolution::Skip;
                }
            }
        }

        if let Some(filter) = self.filter.as_mut() {
            match filter(&path) {
                PathResult::Accepted => {}
                PathResult::Skipped => {
                    self.skipped.push(raw.to_string());
                    return Resolution::Skip;
                }
                PathResult::Modified(replacement) => path = replacement,
                PathResult::Stop => return Resolution::Stop(path),
            }
        }

        if !is_safe_path(&path) {
            warn!(path = %path, "Skipping archive entry rewritten to an unsafe path");
            self.skipped.push(raw.to_string());
            return Resolution::Skip;
        }

        Resolution::Write(path)
    }

    pub fn create_dir(&mut self, path: &str) -> ArchiveResult<()> {
        let full_path = self.root.join(path);
        fs::create_dir_all(&full_path).map_err(|source| ArchiveError::BadData {
            path: full_path,
            source,
        })
    }

    pub fn open_file(&mut self, path: String) -> ArchiveResult<OpenEntry> {
        let full_path = self.root.join(&path);
        let bad_data = |source: io::Error| ArchiveError::BadData {
            path: full_path.clone(),
            source,
        };

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).map_err(bad_data)?;
        }
        if full_path.is_dir() {
            fs::remove_dir_all(&full_path).map_err(bad_data)?;
        }
        let file = File::create(&full_path).map_err(bad_data)?;

        Ok(OpenEntry {
            path,
            full_path: full_path.clone(),
            writer: BufWriter::new(file),
            hasher: self.create_hash_entries.then(Sha1Hasher::new),
            size: 0,
        })
    }

    pub fn write(&mut self, entry: &mut OpenEntry, data: &[u8]) -> ArchiveResult<()> {
        entry
            .writer
            .write_all(data)
            .map_err(|source| ArchiveError::BadData {
                path: entry.full_path.clone(),
                source,
            })?;
        if let Some(hasher) = entry.hasher.as_mut() {
            hasher.update(data);
        }
        entry.size += data.len() as u64;
        Ok(())
    }

    pub fn finish_file(&mut self, mut entry: OpenEntry) -> ArchiveResult<()> {
        entry.writer.flush().map_err(|source| ArchiveError::BadData {
            path: entry.full_path.clone(),
            source,
        })?;
        self.extracted.push(ExtractedFile {
            path: entry.path,
            hash: entry.hasher.map(Sha1Hasher::finish_hex),
            size: entry.size,
        });
        Ok(())
    }
}
