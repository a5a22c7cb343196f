//! SHA-1 digests for manifest verification.
//!
//! Directory indexes name every file and child index by the SHA-1 of its
//! content. This module provides:
//! - A running digest fed from network chunks (`Sha1Hasher`)
//! - Whole-file hashing for local verification (`hash_file`)
//! - Lowercase hexadecimal formatting shared by both

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha1::{Digest, Sha1};

/// Buffer size for reading files during hashing (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Incremental SHA-1 digest.
///
/// Feed bytes with [`update`](Self::update) as they arrive and call
/// [`finish_hex`](Self::finish_hex) once the stream ends.
#[derive(Clone, Default)]
pub struct Sha1Hasher {
    inner: Sha1,
}

impl Sha1Hasher {
    /// Create a new, empty digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add bytes to the digest.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Consume the digest and return the lowercase hex string.
    pub fn finish_hex(self) -> String {
        format!("{:x}", self.inner.finalize())
    }
}

impl std::fmt::Debug for Sha1Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sha1Hasher").finish_non_exhaustive()
    }
}

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha1Hasher::new();
    hasher.update(data);
    hasher.finish_hex()
}

/// Calculate the SHA-1 of a file's contents.
///
/// # Errors
///
/// Returns the underlying I/O error if the file cannot be opened or read.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1Hasher::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hasher.finish_hex())
}

/// Compare two hex digests, ignoring ASCII case.
pub fn hashes_match(a: &str, b: &str) -> bool {
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}
