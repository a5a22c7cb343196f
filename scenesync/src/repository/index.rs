//! Directory index (`.dirindex`) parsing.
//!
//! An index lists the direct children of one remote directory:
//!
//! ```text
//! version:1
//! path:Terrain/e000n50
//! time:20240101T000000Z
//! d:e007n50:5a1b...          # child directory, SHA-1 of its .dirindex
//! f:3088961.stg:0c4f...:1432 # file, SHA-1 and size
//! t:Models.tgz:77e2...:90211 # tarball, extracted into Models/
//! ```

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;
use tracing::warn;

/// Name of the index file inside every directory.
pub const INDEX_FILE_NAME: &str = ".dirindex";

/// Only supported index version.
const INDEX_VERSION: u32 = 1;

/// Kind of entry listed in an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    File,
    Directory,
    Tarball,
}

impl EntryType {
    fn tag(&self) -> char {
        match self {
            EntryType::File => 'f',
            EntryType::Directory => 'd',
            EntryType::Tarball => 't',
        }
    }
}

/// One child listed in a directory index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryIndexEntry {
    pub entry_type: EntryType,
    /// Single path segment.
    pub name: String,
    /// Lowercase hex SHA-1; may be empty.
    pub hash: String,
    /// Content size in bytes; zero for directories.
    pub size: u64,
}

impl DirectoryIndexEntry {
    pub fn file(name: impl Into<String>, hash: impl Into<String>, size: u64) -> Self {
        Self {
            entry_type: EntryType::File,
            name: name.into(),
            hash: hash.into(),
            size,
        }
    }

    pub fn directory(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            entry_type: EntryType::Directory,
            name: name.into(),
            hash: hash.into(),
            size: 0,
        }
    }

    pub fn tarball(name: impl Into<String>, hash: impl Into<String>, size: u64) -> Self {
        Self {
            entry_type: EntryType::Tarball,
            name: name.into(),
            hash: hash.into(),
            size,
        }
    }
}

/// Parsed contents of one `.dirindex`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryIndex {
    /// `path:` record, informational.
    pub path: Option<String>,
    /// Entries in file order, duplicates and invalid names removed.
    pub entries: Vec<DirectoryIndexEntry>,
}

/// Errors raised while parsing an index.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexParseError {
    #[error("index is not valid UTF-8")]
    NotUtf8,

    #[error("missing version record")]
    MissingVersion,

    #[error("unsupported index version {0}")]
    UnsupportedVersion(String),

    #[error("line {line}: malformed record '{record}'")]
    Malformed { line: usize, record: String },

    #[error("line {line}: invalid size '{size}'")]
    InvalidSize { line: usize, size: String },
}

/// Returns true if `name` is usable as a single local path segment.
pub fn is_valid_entry_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

impl DirectoryIndex {
    /// Parse index bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, IndexParseError> {
        let text = std::str::from_utf8(bytes).map_err(|_| IndexParseError::NotUtf8)?;
        Self::parse_str(text)
    }

    /// Parse index text.
    pub fn parse_str(text: &str) -> Result<Self, IndexParseError> {
        let mut index = DirectoryIndex::default();
        let mut seen_version = false;
        let mut names = HashSet::new();

        for (number, raw) in text.lines().enumerate() {
            let line = number + 1;
            let record = raw.trim_end_matches('\r');
            if record.trim().is_empty() || record.starts_with('#') {
                continue;
            }

            let malformed = || IndexParseError::Malformed {
                line,
                record: record.to_string(),
            };
            let (tag, rest) = record.split_once(':').ok_or_else(malformed)?;

            let entry_type = match tag {
                "version" => {
                    if rest.trim() != INDEX_VERSION.to_string() {
                        return Err(IndexParseError::UnsupportedVersion(rest.to_string()));
                    }
                    seen_version = true;
                    continue;
                }
                "path" => {
                    index.path = Some(rest.to_string());
                    continue;
                }
                "time" => continue,
                "f" => EntryType::File,
                "d" => EntryType::Directory,
                "t" => EntryType::Tarball,
                other => {
                    warn!(line, tag = %other, "Ignoring unknown index record");
                    continue;
                }
            };

            if !seen_version {
                return Err(IndexParseError::MissingVersion);
            }

            let fields: Vec<&str> = rest.split(':').collect();
            let (name, hash, size) = match (entry_type, fields.as_slice()) {
                (EntryType::Directory, [name]) => (*name, "", None),
                (EntryType::Directory, [name, hash]) => (*name, *hash, None),
                (EntryType::File | EntryType::Tarball, [name, hash, size]) => {
                    (*name, *hash, Some(*size))
                }
                _ => return Err(malformed()),
            };

            let size = match size {
                Some(text) => text.trim().parse().map_err(|_| IndexParseError::InvalidSize {
                    line,
                    size: text.to_string(),
                })?,
                None => 0,
            };

            if !is_valid_entry_name(name) {
                warn!(line, name = %name, "Ignoring index entry with invalid name");
                continue;
            }
            if !names.insert(name.to_string()) {
                warn!(line, name = %name, "Ignoring duplicate index entry");
                continue;
            }

            index.entries.push(DirectoryIndexEntry {
                entry_type,
                name: name.to_string(),
                hash: hash.trim().to_ascii_lowercase(),
                size,
            });
        }

        if !seen_version {
            return Err(IndexParseError::MissingVersion);
        }
        Ok(index)
    }

    /// Look up an entry by name.
    pub fn find(&self, name: &str) -> Option<&DirectoryIndexEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl fmt::Display for DirectoryIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "version:{}", INDEX_VERSION)?;
        if let Some(path) = &self.path {
            writeln!(f, "path:{}", path)?;
        }
        for entry in &self.entries {
            match entry.entry_type {
                EntryType::Directory => {
                    writeln!(f, "{}:{}:{}", entry.entry_type.tag(), entry.name, entry.hash)?
                }
                _ => writeln!(
                    f,
                    "{}:{}:{}:{}",
                    entry.entry_type.tag(),
                    entry.name,
                    entry.hash,
                    entry.size
                )?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "version:1\n\
        path:Terrain/e000n50\n\
        time:20240101T000000Z\n\
        # comment\n\
        d:e007n50:5A1B\n\
        f:3088961.stg:0c4f:1432\n\
        t:Models.tgz:77e2:90211\n";

    #[test]
    fn test_parse_sample() {
        let index = DirectoryIndex::parse_str(SAMPLE).unwrap();

        assert_eq!(index.path.as_deref(), Some("Terrain/e000n50"));
        assert_eq!(
            index.entries,
            vec![
                DirectoryIndexEntry::directory("e007n50", "5a1b"),
                DirectoryIndexEntry::file("3088961.stg", "0c4f", 1432),
                DirectoryIndexEntry::tarball("Models.tgz", "77e2", 90211),
            ]
        );
    }

    #[test]
    fn test_display_parses_back() {
        let index = DirectoryIndex::parse_str(SAMPLE).unwrap();
        let reparsed = DirectoryIndex::parse_str(&index.to_string()).unwrap();
        assert_eq!(reparsed, index);
    }

    #[test]
    fn test_duplicates_and_bad_names_are_dropped() {
        let text = "version:1\nf:a:1:1\nf:a:2:2\nf:..:3:3\nd:x/y:4\n";
        let index = DirectoryIndex::parse_str(text).unwrap();

        assert_eq!(index.entries, vec![DirectoryIndexEntry::file("a", "1", 1)]);
    }

    #[test]
    fn test_missing_version() {
        assert_eq!(
            DirectoryIndex::parse_str("f:a:1:1\n"),
            Err(IndexParseError::MissingVersion)
        );
        assert_eq!(
            DirectoryIndex::parse_str(""),
            Err(IndexParseError::MissingVersion)
        );
    }

    #[test]
    fn test_unsupported_version() {
        assert!(matches!(
            DirectoryIndex::parse_str("version:2\n"),
            Err(IndexParseError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_malformed_records() {
        assert!(matches!(
            DirectoryIndex::parse_str("version:1\nf:a:1\n"),
            Err(IndexParseError::Malformed { line: 2, .. })
        ));
        assert!(matches!(
            DirectoryIndex::parse_str("version:1\nf:a:1:big\n"),
            Err(IndexParseError::InvalidSize { line: 2, .. })
        ));
    }

    #[test]
    fn test_unknown_records_are_ignored() {
        let index = DirectoryIndex::parse_str("version:1\nz:whatever\nf:a:1:1\n").unwrap();
        assert_eq!(index.entries.len(), 1);
    }

    #[test]
    fn test_not_utf8() {
        assert_eq!(
            DirectoryIndex::parse(&[0xff, 0xfe]),
            Err(IndexParseError::NotUtf8)
        );
    }
}
