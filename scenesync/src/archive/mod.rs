//! Streaming archive extraction.
//!
//! [`ArchiveExtractor`] accepts archive bytes through a push interface
//! ([`extract_bytes`](ArchiveExtractor::extract_bytes) /
//! [`flush`](ArchiveExtractor::flush)) so it can be fed directly from network
//! chunks or from a file read in slices. The format is sniffed from the
//! first bytes:
//!
//! ```text
//! extract_bytes ─► prebuffer ─► determine_type
//!                                   │
//!                ┌──────────────────┼───────────────┬──────────────┐
//!                ▼                  ▼               ▼              ▼
//!            TarReader     GzDecoder<TarReader> XzDecoder<..>  ZipBuffer
//!                └──────────────────┴───────────────┴──────────────┘
//!                                   ▼
//!                     EntrySink (strip / filter / safety / write)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use scenesync::archive::ArchiveExtractor;
//!
//! let mut extractor = ArchiveExtractor::new("/tmp/out");
//! extractor.set_remove_topmost_directory(true);
//! for chunk in chunks {
//!     extractor.extract_bytes(chunk)?;
//! }
//! extractor.flush()?;
//! ```

mod error;
mod sink;
mod state;
mod tar_reader;
mod zip_buffer;

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzDecoder;
use tracing::debug;
use xz2::write::XzDecoder;

pub use error::{ArchiveError, ArchiveResult};
pub use sink::{is_safe_path, ExtractedFile, PathFilterFn, PathResult};
pub use state::{determine_type, ArchiveState, ArchiveType};

use sink::EntrySink;
use tar_reader::TarReader;
use zip_buffer::ZipBuffer;

/// Read size used by [`extract_file`].
const READ_CHUNK_SIZE: usize = 64 * 1024;

enum Backend {
    /// Format not known yet; bytes are held until `determine_type` decides.
    Pending {
        prebuffer: Vec<u8>,
        sink: EntrySink,
    },
    Tar(TarReader),
    TarGz(GzDecoder<TarReader>),
    TarXz(XzDecoder<TarReader>),
    Zip(ZipBuffer),
    /// Sniffing rejected the stream.
    Rejected(EntrySink),
}

/// Incremental extractor for tar, tar.gz, tar.xz and zip streams.
pub struct ArchiveExtractor {
    backend: Backend,
    archive_type: Option<ArchiveType>,
    failed: Option<ArchiveState>,
}

impl ArchiveExtractor {
    /// Create an extractor writing below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: Backend::Pending {
                prebuffer: Vec::new(),
                sink: EntrySink::new(root.into()),
            },
            archive_type: None,
            failed: None,
        }
    }

    /// Directory entries are extracted into.
    pub fn root_path(&self) -> &Path {
        self.sink().root()
    }

    /// Strip one leading path component from every entry.
    pub fn set_remove_topmost_directory(&mut self, remove: bool) {
        self.sink_mut().set_remove_topmost_directory(remove);
    }

    /// Record a SHA-1 for every extracted file.
    pub fn set_create_dir_hash_entries(&mut self, create: bool) {
        self.sink_mut().set_create_hash_entries(create);
    }

    /// Install a per-entry filter, consulted after top-level stripping.
    pub fn set_filter<F>(&mut self, filter: F)
    where
        F: FnMut(&str) -> PathResult + Send + 'static,
    {
        self.sink_mut().set_filter(Box::new(filter));
    }

    /// Current state of the extraction state machine.
    pub fn state(&self) -> ArchiveState {
        if let Some(state) = self.failed {
            return state;
        }
        match &self.backend {
            Backend::Pending { .. } => ArchiveState::Invalid,
            Backend::Tar(reader) => reader.state(),
            Backend::TarGz(decoder) => decoder.get_ref().state(),
            Backend::TarXz(decoder) => decoder.get_ref().state(),
            Backend::Zip(buffer) => buffer.state(),
            Backend::Rejected(_) => ArchiveState::BadArchive,
        }
    }

    /// Detected container format, once enough bytes have arrived.
    pub fn archive_type(&self) -> Option<ArchiveType> {
        self.archive_type
    }

    /// Raw entry names that were not written (unsafe, filtered, or outside the wrapper).
    pub fn skipped_paths(&self) -> &[String] {
        self.sink().skipped()
    }

    /// Files written so far.
    pub fn extracted_files(&self) -> &[ExtractedFile] {
        self.sink().extracted()
    }

    /// Drain the list of files written so far.
    pub fn take_extracted_files(&mut self) -> Vec<ExtractedFile> {
        self.sink_mut().take_extracted()
    }

    /// Name of the last entry header seen.
    pub fn most_recent_path(&self) -> Option<&str> {
        self.sink().most_recent_path()
    }

    /// Feed the next slice of the archive.
    ///
    /// Chunk boundaries are arbitrary. Bytes after the end-of-archive marker
    /// are ignored. Once an error has been returned all further calls fail
    /// with [`ArchiveError::Finished`].
    pub fn extract_bytes(&mut self, bytes: &[u8]) -> ArchiveResult<()> {
        let state = self.state();
        // Compressed streams still owe their trailer after the tar end marker
        if state == ArchiveState::EndOfArchive && matches!(self.backend, Backend::Tar(_)) {
            return Ok(());
        }
        if state.is_error() {
            return Err(ArchiveError::Finished(state));
        }

        let result = self.feed(bytes);
        if let Err(ref e) = result {
            self.failed = Some(e.state());
        }
        result
    }

    /// Signal end of input and complete extraction.
    pub fn flush(&mut self) -> ArchiveResult<()> {
        if let Some(state) = self.failed {
            return Err(ArchiveError::Finished(state));
        }

        let result = self.finish_backend();
        if let Err(ref e) = result {
            self.failed = Some(e.state());
        }
        result
    }

    fn feed(&mut self, bytes: &[u8]) -> ArchiveResult<()> {
        match &mut self.backend {
            Backend::Pending { prebuffer, .. } => {
                prebuffer.extend_from_slice(bytes);
                match determine_type(prebuffer) {
                    ArchiveType::InsufficientData => Ok(()),
                    kind => self.start_backend(kind),
                }
            }
            Backend::Tar(reader) => {
                reader.push(bytes);
                latched(reader)
            }
            Backend::TarGz(decoder) => {
                write_compressed(decoder, bytes)
                    .map_err(|e| ArchiveError::BadArchive(format!("gzip stream: {}", e)))?;
                latched(decoder.get_mut())
            }
            Backend::TarXz(decoder) => {
                write_compressed(decoder, bytes)
                    .map_err(|e| ArchiveError::BadArchive(format!("xz stream: {}", e)))?;
                latched(decoder.get_mut())
            }
            Backend::Zip(buffer) => {
                buffer.push(bytes);
                Ok(())
            }
            Backend::Rejected(_) => Err(ArchiveError::Finished(ArchiveState::BadArchive)),
        }
    }

    /// Replace the pending backend with a decoder for `kind` and replay the prebuffer.
    fn start_backend(&mut self, kind: ArchiveType) -> ArchiveResult<()> {
        let placeholder = Backend::Rejected(EntrySink::new(PathBuf::new()));
        let Backend::Pending { prebuffer, sink } = std::mem::replace(&mut self.backend, placeholder)
        else {
            return Ok(());
        };

        debug!(?kind, root = %sink.root().display(), "Detected archive format");
        self.archive_type = Some(kind);
        self.backend = match kind {
            ArchiveType::TarData => Backend::Tar(TarReader::new(sink)),
            ArchiveType::GzData => Backend::TarGz(GzDecoder::new(TarReader::new(sink))),
            ArchiveType::XzData => Backend::TarXz(XzDecoder::new(TarReader::new(sink))),
            ArchiveType::ZipData => Backend::Zip(ZipBuffer::new(sink)),
            ArchiveType::Invalid | ArchiveType::InsufficientData => {
                self.backend = Backend::Rejected(sink);
                return Err(ArchiveError::BadArchive(
                    "unrecognised archive format".to_string(),
                ));
            }
        };

        self.feed(&prebuffer)
    }

    fn finish_backend(&mut self) -> ArchiveResult<()> {
        // The xz decoder hands its writer back on finish; continue as plain tar
        let placeholder = Backend::Rejected(EntrySink::new(PathBuf::new()));
        match std::mem::replace(&mut self.backend, placeholder) {
            Backend::TarXz(mut decoder) => match decoder.finish() {
                Ok(reader) => self.backend = Backend::Tar(reader),
                Err(e) => {
                    self.backend = Backend::TarXz(decoder);
                    return Err(ArchiveError::BadArchive(format!("xz stream: {}", e)));
                }
            },
            other => self.backend = other,
        }

        match &mut self.backend {
            Backend::Pending { prebuffer, .. } if prebuffer.is_empty() => {
                Err(ArchiveError::BadArchive("empty archive".to_string()))
            }
            Backend::Pending { .. } => Err(ArchiveError::BadArchive(
                "archive too short to identify".to_string(),
            )),
            Backend::Tar(reader) => reader.finish(),
            Backend::TarGz(decoder) => {
                decoder
                    .try_finish()
                    .map_err(|e| ArchiveError::BadArchive(format!("gzip stream: {}", e)))?;
                decoder.get_mut().finish()
            }
            Backend::TarXz(decoder) => decoder.get_mut().finish(),
            Backend::Zip(buffer) => buffer.finish(),
            Backend::Rejected(_) => Err(ArchiveError::Finished(ArchiveState::BadArchive)),
        }
    }

    fn sink(&self) -> &EntrySink {
        match &self.backend {
            Backend::Pending { sink, .. } | Backend::Rejected(sink) => sink,
            Backend::Tar(reader) => reader.sink(),
            Backend::TarGz(decoder) => decoder.get_ref().sink(),
            Backend::TarXz(decoder) => decoder.get_ref().sink(),
            Backend::Zip(buffer) => buffer.sink(),
        }
    }

    fn sink_mut(&mut self) -> &mut EntrySink {
        match &mut self.backend {
            Backend::Pending { sink, .. } | Backend::Rejected(sink) => sink,
            Backend::Tar(reader) => reader.sink_mut(),
            Backend::TarGz(decoder) => decoder.get_mut().sink_mut(),
            Backend::TarXz(decoder) => decoder.get_mut().sink_mut(),
            Backend::Zip(buffer) => buffer.sink_mut(),
        }
    }
}

impl std::fmt::Debug for ArchiveExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveExtractor")
            .field("root", &self.root_path())
            .field("archive_type", &self.archive_type)
            .field("state", &self.state())
            .finish()
    }
}

/// Feed a decoder until it stops accepting input. Bytes after the end of
/// the compressed stream are dropped.
fn write_compressed<W: Write>(decoder: &mut W, mut bytes: &[u8]) -> std::io::Result<()> {
    while !bytes.is_empty() {
        match decoder.write(bytes) {
            Ok(0) => break,
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn latched(reader: &mut TarReader) -> ArchiveResult<()> {
    match reader.take_error() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Summary of a completed [`extract_file`] call.
#[derive(Debug, Clone, Default)]
pub struct ExtractSummary {
    /// Files written.
    pub files: Vec<ExtractedFile>,
    /// Entries that were not written.
    pub skipped: Vec<String>,
}

/// Extract an archive file on disk into `dest`.
///
/// # Errors
///
/// Returns [`ArchiveError::ReadFailed`] if the archive cannot be read, or
/// the extractor's error for malformed content.
pub fn extract_file(
    archive: &Path,
    dest: &Path,
    remove_topmost_directory: bool,
) -> ArchiveResult<ExtractSummary> {
    let read_failed = |source| ArchiveError::ReadFailed {
        path: archive.to_path_buf(),
        source,
    };

    let mut file = File::open(archive).map_err(read_failed)?;
    let mut extractor = ArchiveExtractor::new(dest);
    extractor.set_remove_topmost_directory(remove_topmost_directory);

    let mut buffer = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(read_failed)?;
        if read == 0 {
            break;
        }
        extractor.extract_bytes(&buffer[..read])?;
    }
    extractor.flush()?;

    Ok(ExtractSummary {
        files: extractor.take_extracted_files(),
        skipped: extractor.skipped_paths().to_vec(),
    })
}
