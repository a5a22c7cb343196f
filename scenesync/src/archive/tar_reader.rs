//! Push-driven tar parser.
//!
//! Bytes may arrive in chunks of any size; a header split across two
//! chunks is reassembled in `header`, and body bytes are streamed straight
//! to the open entry. Compressed tarballs reach this parser through a
//! decompressing writer, so [`TarReader`] also implements [`Write`].

use std::io::{self, Write};

use tracing::debug;

use super::error::{ArchiveError, ArchiveResult};
use super::sink::{EntrySink, OpenEntry, Resolution};
use super::state::{header_checksum_valid, parse_numeric, ArchiveState, TAR_BLOCK_SIZE};

/// Upper bound for PAX and GNU long name records held in memory.
const MAX_ATTRIBUTE_SIZE: u64 = 1024 * 1024;

const TYPE_REGULAR: u8 = b'0';
const TYPE_REGULAR_OLD: u8 = 0;
const TYPE_CONTIGUOUS: u8 = b'7';
const TYPE_DIRECTORY: u8 = b'5';
const TYPE_PAX_FILE: u8 = b'x';
const TYPE_PAX_GLOBAL: u8 = b'g';
const TYPE_GNU_LONGNAME: u8 = b'L';

/// Incremental tar extraction state.
pub(crate) struct TarReader {
    state: ArchiveState,
    sink: EntrySink,
    header: [u8; TAR_BLOCK_SIZE],
    header_len: usize,
    /// Body bytes still expected for the current entry.
    remaining: u64,
    /// Zero bytes still expected after the current body.
    padding: u64,
    current: Option<OpenEntry>,
    attributes: Vec<u8>,
    pending_path: Option<String>,
    error: Option<ArchiveError>,
}

impl TarReader {
    pub fn new(sink: EntrySink) -> Self {
        Self {
            state: ArchiveState::Invalid,
            sink,
            header: [0u8; TAR_BLOCK_SIZE],
            header_len: 0,
            remaining: 0,
            padding: 0,
            current: None,
            attributes: Vec::new(),
            pending_path: None,
            error: None,
        }
    }

    pub fn state(&self) -> ArchiveState {
        self.state
    }

    pub fn sink(&self) -> &EntrySink {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut EntrySink {
        &mut self.sink
    }

    /// Take the error that moved the reader into a terminal error state.
    pub fn take_error(&mut self) -> Option<ArchiveError> {
        self.error.take()
    }

    /// Feed more archive bytes. Errors are latched; see [`take_error`](Self::take_error).
    pub fn push(&mut self, mut data: &[u8]) {
        while !data.is_empty() && !self.state.is_terminal() {
            let consumed = match self.state {
                ArchiveState::Invalid
                | ArchiveState::ReadingHeader
                | ArchiveState::PreEndOfArchive => self.fill_header(data),
                ArchiveState::ReadingFile
                | ArchiveState::ReadingPaxFileAttributes
                | ArchiveState::ReadingPaxGlobalAttributes
                | ArchiveState::ReadingGnuLongname => self.read_body(data),
                ArchiveState::ReadingPadding => {
                    let take = (data.len() as u64).min(self.padding) as usize;
                    self.padding -= take as u64;
                    if self.padding == 0 {
                        self.state = ArchiveState::ReadingHeader;
                    }
                    take
                }
                _ => data.len(),
            };
            data = &data[consumed..];
        }
    }

    /// Signal end of input.
    pub fn finish(&mut self) -> ArchiveResult<()> {
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        match self.state {
            ArchiveState::EndOfArchive | ArchiveState::PreEndOfArchive => {
                self.state = ArchiveState::EndOfArchive;
                Ok(())
            }
            state if state.is_error() => Err(ArchiveError::Finished(state)),
            state => {
                self.current = None;
                self.state = ArchiveState::BadArchive;
                Err(ArchiveError::Truncated(state))
            }
        }
    }

    fn fail(&mut self, error: ArchiveError) {
        self.current = None;
        self.state = error.state();
        self.error = Some(error);
    }

    fn fill_header(&mut self, data: &[u8]) -> usize {
        let take = (TAR_BLOCK_SIZE - self.header_len).min(data.len());
        self.header[self.header_len..self.header_len + take].copy_from_slice(&data[..take]);
        self.header_len += take;
        if self.state == ArchiveState::Invalid {
            self.state = ArchiveState::ReadingHeader;
        }
        if self.header_len == TAR_BLOCK_SIZE {
            self.header_len = 0;
            self.process_header();
        }
        take
    }

    fn process_header(&mut self) {
        if self.header.iter().all(|b| *b == 0) {
            self.state = if self.state == ArchiveState::PreEndOfArchive {
                ArchiveState::EndOfArchive
            } else {
                ArchiveState::PreEndOfArchive
            };
            return;
        }

        if !header_checksum_valid(&self.header) {
            self.fail(ArchiveError::BadArchive(
                "tar header checksum mismatch".to_string(),
            ));
            return;
        }

        let Some(size) = parse_numeric(&self.header[124..136]) else {
            self.fail(ArchiveError::BadArchive(
                "invalid size field in tar header".to_string(),
            ));
            return;
        };

        self.remaining = size;
        let block = TAR_BLOCK_SIZE as u64;
        self.padding = (block - size % block) % block;

        let type_flag = self.header[156];
        match type_flag {
            TYPE_PAX_FILE | TYPE_PAX_GLOBAL | TYPE_GNU_LONGNAME => {
                if size > MAX_ATTRIBUTE_SIZE {
                    self.fail(ArchiveError::BadArchive(format!(
                        "extended header of {} bytes exceeds limit",
                        size
                    )));
                    return;
                }
                self.attributes.clear();
                self.state = match type_flag {
                    TYPE_PAX_FILE => ArchiveState::ReadingPaxFileAttributes,
                    TYPE_PAX_GLOBAL => ArchiveState::ReadingPaxGlobalAttributes,
                    _ => ArchiveState::ReadingGnuLongname,
                };
            }
            _ => {
                let name = self.entry_name();
                let is_dir = type_flag == TYPE_DIRECTORY
                    || (type_flag == TYPE_REGULAR_OLD && name.ends_with('/'));
                let is_file = !is_dir
                    && matches!(
                        type_flag,
                        TYPE_REGULAR | TYPE_REGULAR_OLD | TYPE_CONTIGUOUS
                    );

                self.state = ArchiveState::ReadingFile;
                if is_dir || is_file {
                    self.start_entry(&name, is_dir);
                } else {
                    debug!(path = %name, type_flag, "Skipping unsupported tar entry type");
                }
            }
        }

        if self.remaining == 0 && !self.state.is_terminal() {
            self.finish_body();
        }
    }

    fn start_entry(&mut self, name: &str, is_dir: bool) {
        match self.sink.resolve(name, is_dir) {
            Resolution::Write(path) if is_dir => {
                if let Err(e) = self.sink.create_dir(&path) {
                    self.fail(e);
                }
            }
            Resolution::Write(path) => match self.sink.open_file(path) {
                Ok(entry) => self.current = Some(entry),
                Err(e) => self.fail(e),
            },
            Resolution::Skip => {}
            Resolution::Stop(path) => self.fail(ArchiveError::FilterStopped(path)),
        }
    }

    /// Name for a regular header, honouring PAX / GNU overrides and the ustar prefix.
    fn entry_name(&mut self) -> String {
        if let Some(path) = self.pending_path.take() {
            return path;
        }

        let name = c_string(&self.header[0..100]);
        let is_ustar = &self.header[257..262] == b"ustar";
        let prefix = if is_ustar {
            c_string(&self.header[345..500])
        } else {
            String::new()
        };

        if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    fn read_body(&mut self, data: &[u8]) -> usize {
        let take = (data.len() as u64).min(self.remaining) as usize;
        let chunk = &data[..take];

        match self.state {
            ArchiveState::ReadingFile => {
                if let Some(mut entry) = self.current.take() {
                    match self.sink.write(&mut entry, chunk) {
                        Ok(()) => self.current = Some(entry),
                        Err(e) => {
                            self.fail(e);
                            return take;
                        }
                    }
                }
            }
            _ => self.attributes.extend_from_slice(chunk),
        }

        self.remaining -= take as u64;
        if self.remaining == 0 {
            self.finish_body();
        }
        take
    }

    fn finish_body(&mut self) {
        match self.state {
            ArchiveState::ReadingFile => {
                if let Some(entry) = self.current.take() {
                    if let Err(e) = self.sink.finish_file(entry) {
                        self.fail(e);
                        return;
                    }
                }
            }
            ArchiveState::ReadingPaxFileAttributes => match parse_pax_path(&self.attributes) {
                Ok(path) => {
                    if path.is_some() {
                        self.pending_path = path;
                    }
                }
                Err(reason) => {
                    self.fail(ArchiveError::BadArchive(reason));
                    return;
                }
            },
            ArchiveState::ReadingPaxGlobalAttributes => {
                if let Err(reason) = parse_pax_path(&self.attributes) {
                    self.fail(ArchiveError::BadArchive(reason));
                    return;
                }
            }
            ArchiveState::ReadingGnuLongname => {
                self.pending_path = Some(c_string(&self.attributes));
            }
            _ => {}
        }

        self.state = if self.padding > 0 {
            ArchiveState::ReadingPadding
        } else {
            ArchiveState::ReadingHeader
        };
    }
}

impl Write for TarReader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Errors are latched in the reader; keep the decoder draining.
        self.push(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn c_string(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Parse PAX `"<len> <key>=<value>\n"` records, returning the `path` value if any.
fn parse_pax_path(records: &[u8]) -> Result<Option<String>, String> {
    let mut path = None;
    let mut rest = records;

    while !rest.is_empty() {
        if rest.iter().all(|b| *b == 0) {
            break;
        }
        let space = rest
            .iter()
            .position(|b| *b == b' ')
            .ok_or_else(|| "PAX record without length".to_string())?;
        let length: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| "invalid PAX record length".to_string())?;
        if length <= space + 1 || length > rest.len() {
            return Err("PAX record length out of range".to_string());
        }

        let record = &rest[space + 1..length];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        if let Some(eq) = record.iter().position(|b| *b == b'=') {
            if &record[..eq] == b"path" {
                path = Some(String::from_utf8_lossy(&record[eq + 1..]).into_owned());
            }
        }
        rest = &rest[length..];
    }

    Ok(path)
}
