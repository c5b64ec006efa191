//! Fixed-size chunked file reading with progress tracking.
//!
//! Used both to stream a finished backup to a client and to copy a restore
//! file over the main database. The chunk buffer is allocated once on `open`
//! and reused for every read.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Default chunk size, 2 MiB.
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Sequential reader over a file in fixed-size chunks.
pub struct ChunkedFileReader {
    file: File,
    buffer: Vec<u8>,
    file_size: u64,
    bytes_read: u64,
}

impl ChunkedFileReader {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::with_chunk_size(path, CHUNK_SIZE)
    }

    pub fn with_chunk_size(path: impl AsRef<Path>, chunk_size: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        Ok(Self {
            file,
            buffer: vec![0; chunk_size],
            file_size,
            bytes_read: 0,
        })
    }

    /// Read the next chunk. Returns `None` at end of file. The returned
    /// slice is valid until the next call.
    pub fn next_chunk(&mut self) -> io::Result<Option<&[u8]>> {
        if self.bytes_read >= self.file_size {
            return Ok(None);
        }

        let mut filled = 0;
        while filled < self.buffer.len() {
            let n = self.file.read(&mut self.buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }

        self.bytes_read += filled as u64;
        Ok(Some(&self.buffer[..filled]))
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Percentage of the file consumed so far; -1 before the first chunk.
    pub fn progress(&self) -> i64 {
        if self.bytes_read == 0 {
            return -1;
        }
        if self.file_size == 0 {
            return 100;
        }
        (100 * self.bytes_read / self.file_size) as i64
    }
}
