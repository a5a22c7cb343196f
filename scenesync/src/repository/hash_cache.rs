//! Per-directory hash cache (`.dirhash`).
//!
//! Maps child names to their last verified SHA-1 together with the size and
//! modification time observed when the hash was computed. A cached hash is
//! trusted only while the file on disk still has that size and mtime.
//!
//! ```text
//! @verified:1718000000
//! 3088961.stg:0c4f...:1717990000:1432
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use crate::hash;

/// Name of the cache file inside every directory.
pub const HASH_CACHE_FILE_NAME: &str = ".dirhash";

const VERIFIED_PREFIX: &str = "@verified:";

/// One cached hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCacheEntry {
    pub hash: String,
    /// Modification time in whole seconds since the Unix epoch.
    pub mtime: i64,
    pub size: u64,
}

/// In-memory view of a directory's `.dirhash`.
#[derive(Debug, Clone, Default)]
pub struct HashCache {
    entries: BTreeMap<String, HashCacheEntry>,
    verified_at: Option<i64>,
    dirty: bool,
}

/// Size and mtime of a file, as recorded in the cache.
pub(crate) fn file_stamp(path: &Path) -> io::Result<(i64, u64)> {
    let metadata = fs::metadata(path)?;
    let mtime = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok((mtime, metadata.len()))
}

impl HashCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cache stored in `dir`. A missing or unreadable file yields an
    /// empty cache; malformed lines are skipped.
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(HASH_CACHE_FILE_NAME);
        match fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Self::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read hash cache");
                Self::new()
            }
        }
    }

    fn parse(text: &str) -> Self {
        let mut cache = Self::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            if let Some(secs) = line.strip_prefix(VERIFIED_PREFIX) {
                cache.verified_at = secs.trim().parse().ok();
                continue;
            }

            // Split from the right so only the name may contain ':'
            let mut fields = line.rsplitn(4, ':');
            let parsed = match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(size), Some(mtime), Some(hash), Some(name)) if !name.is_empty() => {
                    match (size.parse(), mtime.parse()) {
                        (Ok(size), Ok(mtime)) => Some((name, hash, mtime, size)),
                        _ => None,
                    }
                }
                _ => None,
            };

            match parsed {
                Some((name, hash, mtime, size)) => {
                    cache.entries.insert(
                        name.to_string(),
                        HashCacheEntry {
                            hash: hash.to_string(),
                            mtime,
                            size,
                        },
                    );
                }
                None => debug!(line, "Skipping malformed hash cache line"),
            }
        }
        cache
    }

    /// Serialized form.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(secs) = self.verified_at {
            let _ = writeln!(out, "{}{}", VERIFIED_PREFIX, secs);
        }
        for (name, entry) in &self.entries {
            let _ = writeln!(out, "{}:{}:{}:{}", name, entry.hash, entry.mtime, entry.size);
        }
        out
    }

    /// Write the cache into `dir` and clear the dirty flag.
    pub fn save(&mut self, dir: &Path) -> io::Result<()> {
        fs::write(dir.join(HASH_CACHE_FILE_NAME), self.render())?;
        self.dirty = false;
        Ok(())
    }

    /// Write the cache only if it changed since the last load or save.
    ///
    /// Returns whether anything was written.
    pub fn save_if_dirty(&mut self, dir: &Path) -> io::Result<bool> {
        if !self.dirty || !dir.is_dir() {
            return Ok(false);
        }
        self.save(dir)?;
        Ok(true)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&HashCacheEntry> {
        self.entries.get(name)
    }

    /// Cached hash for `name`, regardless of the file's current state.
    pub fn hash(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(|e| e.hash.as_str())
    }

    /// Store an entry, marking the cache dirty if it changed.
    pub fn insert(&mut self, name: impl Into<String>, entry: HashCacheEntry) {
        let name = name.into();
        if self.entries.get(&name) != Some(&entry) {
            self.entries.insert(name, entry);
            self.dirty = true;
        }
    }

    /// Drop the entry for `name`.
    pub fn remove(&mut self, name: &str) {
        if self.entries.remove(name).is_some() {
            self.dirty = true;
        }
    }

    /// Drop every entry whose name fails `keep`.
    pub fn retain<F: FnMut(&str) -> bool>(&mut self, mut keep: F) {
        let before = self.entries.len();
        self.entries.retain(|name, _| keep(name));
        if self.entries.len() != before {
            self.dirty = true;
        }
    }

    /// Unix time at which the directory was last fully verified.
    pub fn verified_at(&self) -> Option<i64> {
        self.verified_at
    }

    pub fn set_verified_at(&mut self, secs: i64) {
        if self.verified_at != Some(secs) {
            self.verified_at = Some(secs);
            self.dirty = true;
        }
    }

    /// Whether the directory was verified less than `timeout_secs` before `now`.
    pub fn verified_within(&self, now: i64, timeout_secs: i64) -> bool {
        match self.verified_at {
            Some(at) => at <= now && now - at < timeout_secs,
            None => false,
        }
    }

    /// Hash of `dir/name`, from the cache when its stamp still matches the
    /// file on disk, otherwise computed and cached.
    pub fn hash_for_file(&mut self, dir: &Path, name: &str) -> io::Result<String> {
        let path = dir.join(name);
        let (mtime, size) = file_stamp(&path)?;

        if let Some(entry) = self.entries.get(name) {
            if entry.mtime == mtime && entry.size == size && !entry.hash.is_empty() {
                return Ok(entry.hash.clone());
            }
        }

        debug!(path = %path.display(), "Hashing file");
        let hash = hash::hash_file(&path)?;
        self.insert(
            name,
            HashCacheEntry {
                hash: hash.clone(),
                mtime,
                size,
            },
        );
        Ok(hash)
    }

    /// Record `hash` for the file currently at `dir/name`.
    pub fn record_file(&mut self, dir: &Path, name: &str, hash: &str) -> io::Result<()> {
        let (mtime, size) = file_stamp(&dir.join(name))?;
        self.insert(
            name,
            HashCacheEntry {
                hash: hash.to_string(),
                mtime,
                size,
            },
        );
        Ok(())
    }
}
