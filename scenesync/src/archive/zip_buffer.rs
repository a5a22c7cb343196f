//! Zip extraction.
//!
//! The zip central directory sits at the end of the file, so the stream is
//! buffered until [`ZipBuffer::finish`] and then walked with the `zip`
//! crate. Entry names go through the same [`EntrySink`] pipeline as tar.

use std::io::{Cursor, Read};

use super::error::{ArchiveError, ArchiveResult};
use super::sink::{EntrySink, Resolution};
use super::state::ArchiveState;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

pub(crate) struct ZipBuffer {
    state: ArchiveState,
    sink: EntrySink,
    data: Vec<u8>,
}

impl ZipBuffer {
    pub fn new(sink: EntrySink) -> Self {
        Self {
            state: ArchiveState::ReadingFile,
            sink,
            data: Vec::new(),
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

    pub fn push(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    pub fn finish(&mut self) -> ArchiveResult<()> {
        let result = self.extract_all();
        self.data = Vec::new();
        self.state = match &result {
            Ok(()) => ArchiveState::EndOfArchive,
            Err(e) => e.state(),
        };
        result
    }

    fn extract_all(&mut self) -> ArchiveResult<()> {
        let Self { data, sink, .. } = self;
        let mut archive = zip::ZipArchive::new(Cursor::new(data.as_slice()))
            .map_err(|e| ArchiveError::BadArchive(e.to_string()))?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];

        for index in 0..archive.len() {
            let mut file = archive
                .by_index(index)
                .map_err(|e| ArchiveError::BadArchive(e.to_string()))?;
            let name = file.name().to_string();
            let is_dir = file.is_dir();

            let path = match sink.resolve(&name, is_dir) {
                Resolution::Write(path) => path,
                Resolution::Skip => continue,
                Resolution::Stop(path) => return Err(ArchiveError::FilterStopped(path)),
            };

            if is_dir {
                sink.create_dir(&path)?;
                continue;
            }

            let mut entry = sink.open_file(path)?;
            loop {
                let read = file.read(&mut buffer).map_err(|source| ArchiveError::BadData {
                    path: sink.root().join(&name),
                    source,
                })?;
                if read == 0 {
                    break;
                }
                sink.write(&mut entry, &buffer[..read])?;
            }
            sink.finish_file(entry)?;
        }

        Ok(())
    }
}
