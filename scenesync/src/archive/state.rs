//! Extraction states and archive sniffing results.

/// Progress of an extractor through its input stream.
///
/// States before [`ArchiveState::EndOfArchive`] are the normal tar parsing
/// loop; everything from [`ArchiveState::BadArchive`] on is an error and
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArchiveState {
    /// No bytes processed yet.
    Invalid,
    /// Accumulating a 512-byte header block.
    ReadingHeader,
    /// Consuming a file body (written out or discarded).
    ReadingFile,
    /// Skipping the zero padding after a body.
    ReadingPadding,
    /// Consuming a PAX global extended header.
    ReadingPaxGlobalAttributes,
    /// Consuming a PAX per-file extended header.
    ReadingPaxFileAttributes,
    /// Consuming a GNU long name record.
    ReadingGnuLongname,
    /// One zero block seen; expecting the second.
    PreEndOfArchive,
    /// Archive completely extracted.
    EndOfArchive,
    /// Headers or container structure are malformed.
    BadArchive,
    /// Entry data could not be decoded or written.
    BadData,
    /// The caller's path filter requested a stop.
    FilterStopped,
}

impl ArchiveState {
    /// Returns true for the error states.
    pub fn is_error(self) -> bool {
        self >= ArchiveState::BadArchive
    }

    /// Returns true once no further input will be consumed.
    pub fn is_terminal(self) -> bool {
        self >= ArchiveState::EndOfArchive
    }
}

/// Result of sniffing the first bytes of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveType {
    /// Not a format we can extract.
    Invalid,
    /// Not enough bytes to decide yet.
    InsufficientData,
    /// Uncompressed tar.
    TarData,
    /// Zip container.
    ZipData,
    /// gzip-compressed (assumed tar inside).
    GzData,
    /// xz-compressed (assumed tar inside).
    XzData,
}

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const ZIP_MAGIC: &[u8] = &[b'P', b'K', 0x03, 0x04];
const ZIP_EMPTY_MAGIC: &[u8] = &[b'P', b'K', 0x05, 0x06];
const USTAR_MAGIC: &[u8] = b"ustar";
const USTAR_MAGIC_OFFSET: usize = 257;

pub(crate) const TAR_BLOCK_SIZE: usize = 512;

/// Identify an archive from a prefix of its bytes.
///
/// Pure and side-effect free. [`ArchiveType::InsufficientData`] means the
/// prefix is consistent with some format but too short to commit to it.
pub fn determine_type(bytes: &[u8]) -> ArchiveType {
    if bytes.len() < GZIP_MAGIC.len() {
        return ArchiveType::InsufficientData;
    }
    if bytes.starts_with(GZIP_MAGIC) {
        return ArchiveType::GzData;
    }

    for (magic, kind) in [
        (ZIP_MAGIC, ArchiveType::ZipData),
        (ZIP_EMPTY_MAGIC, ArchiveType::ZipData),
        (XZ_MAGIC, ArchiveType::XzData),
    ] {
        if bytes.len() >= magic.len() {
            if bytes.starts_with(magic) {
                return kind;
            }
        } else if magic.starts_with(bytes) {
            return ArchiveType::InsufficientData;
        }
    }

    if bytes.len() < TAR_BLOCK_SIZE {
        return ArchiveType::InsufficientData;
    }

    let header = &bytes[..TAR_BLOCK_SIZE];
    if &header[USTAR_MAGIC_OFFSET..USTAR_MAGIC_OFFSET + USTAR_MAGIC.len()] == USTAR_MAGIC {
        return ArchiveType::TarData;
    }

    // Pre-POSIX tar has no magic; fall back to the header checksum.
    if header_checksum_valid(header) {
        return ArchiveType::TarData;
    }

    ArchiveType::Invalid
}

/// Verify the checksum field of a tar header block.
pub(crate) fn header_checksum_valid(header: &[u8]) -> bool {
    let Some(stored) = parse_octal(&header[148..156]) else {
        return false;
    };

    let mut unsigned: u64 = 0;
    let mut signed: i64 = 0;
    for (i, byte) in header.iter().enumerate() {
        let b = if (148..156).contains(&i) { b' ' } else { *byte };
        unsigned += u64::from(b);
        signed += i64::from(b as i8);
    }

    stored == unsigned || i64::try_from(stored).map(|s| s == signed).unwrap_or(false)
}

/// Parse a NUL/space terminated octal field.
pub(crate) fn parse_octal(field: &[u8]) -> Option<u64> {
    let text: Vec<u8> = field
        .iter()
        .copied()
        .skip_while(|b| *b == b' ')
        .take_while(|b| *b != 0 && *b != b' ')
        .collect();
    if text.is_empty() {
        return Some(0);
    }

    let mut value: u64 = 0;
    for digit in text {
        if !(b'0'..=b'7').contains(&digit) {
            return None;
        }
        value = value.checked_mul(8)?.checked_add(u64::from(digit - b'0'))?;
    }
    Some(value)
}

/// Parse a numeric header field, octal or GNU base-256.
pub(crate) fn parse_numeric(field: &[u8]) -> Option<u64> {
    match field.first() {
        Some(first) if first & 0x80 != 0 => {
            let mut value: u64 = u64::from(first & 0x7f);
            for byte in &field[1..] {
                value = value.checked_mul(256)?.checked_add(u64::from(*byte))?;
            }
            Some(value)
        }
        _ => parse_octal(field),
    }
}
