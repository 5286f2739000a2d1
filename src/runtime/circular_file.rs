//! Persistent circular file
//!
//! Ancillary on-disk ring used for rolling capture logs. The format is fixed
//! for interoperability with existing tooling: a 4096-byte header holding a
//! magic number, the header size, the circular-buffer byte size, the file
//! offset to the buffer start, and the current byte offset of live data —
//! all little-endian u32, followed by the buffer region itself.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use super::errors::CircularFileError;

/// Magic number identifying the format
pub const MAGIC: u32 = 0xEB02_1026;

/// Fixed header size in bytes
pub const HEADER_SIZE: u32 = 4096;

/// Number of header fields actually encoded (the rest of the header is
/// zero padding)
const HEADER_FIELDS: usize = 5;

/// A fixed-size on-disk ring of bytes with a persistent write position
///
/// Appends wrap at the end of the buffer region and overwrite the oldest
/// data; the header's current offset is rewritten after every append so a
/// reopened file resumes exactly where it left off.
pub struct CircularFile {
    file: File,
    buffer_size: u32,
    current: u32,
}

impl CircularFile {
    /// Create a new circular file with a zeroed buffer of `buffer_size`
    /// bytes.
    pub fn create(path: impl AsRef<Path>, buffer_size: u32) -> Result<Self, CircularFileError> {
        assert!(buffer_size > 0, "buffer size must be non-zero");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(HEADER_SIZE as u64 + buffer_size as u64)?;
        let mut cf = Self {
            file,
            buffer_size,
            current: 0,
        };
        cf.write_header()?;
        debug!(
            "created circular file {:?}: {} buffer bytes",
            path.as_ref(),
            buffer_size
        );
        Ok(cf)
    }

    /// Open an existing circular file, validating the header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CircularFileError> {
        let mut file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;

        let mut raw = [0u8; 4 * HEADER_FIELDS];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut raw)?;
        let mut fields = [0u32; HEADER_FIELDS];
        for (i, field) in fields.iter_mut().enumerate() {
            *field = u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        }
        let [magic, header_size, buffer_size, buffer_offset, current] = fields;

        if magic != MAGIC {
            return Err(CircularFileError::BadMagic {
                expected: MAGIC,
                found: magic,
            });
        }
        if header_size != HEADER_SIZE || buffer_offset != HEADER_SIZE {
            return Err(CircularFileError::BadHeaderSize(header_size));
        }
        if buffer_size == 0 {
            return Err(CircularFileError::EmptyBuffer);
        }
        let expected_len = HEADER_SIZE as u64 + buffer_size as u64;
        let file_len = file.metadata()?.len();
        if file_len != expected_len {
            return Err(CircularFileError::SizeMismatch {
                header: expected_len,
                file: file_len,
            });
        }

        Ok(Self {
            file,
            buffer_size,
            current: current % buffer_size,
        })
    }

    fn write_header(&mut self) -> Result<(), CircularFileError> {
        let fields: [u32; HEADER_FIELDS] =
            [MAGIC, HEADER_SIZE, self.buffer_size, HEADER_SIZE, self.current];
        let mut header = [0u8; HEADER_SIZE as usize];
        for (i, field) in fields.iter().enumerate() {
            header[i * 4..i * 4 + 4].copy_from_slice(&field.to_le_bytes());
        }
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        Ok(())
    }

    /// Append bytes at the current position, wrapping over the oldest data.
    /// Data longer than the buffer keeps only its trailing `buffer_size`
    /// bytes, like any ring would.
    pub fn append(&mut self, data: &[u8]) -> Result<(), CircularFileError> {
        let size = self.buffer_size as usize;
        let data = if data.len() > size {
            &data[data.len() - size..]
        } else {
            data
        };
        let mut written = 0;
        while written < data.len() {
            let span = (size - self.current as usize).min(data.len() - written);
            self.file
                .seek(SeekFrom::Start(HEADER_SIZE as u64 + self.current as u64))?;
            self.file.write_all(&data[written..written + span])?;
            written += span;
            self.current = (self.current + span as u32) % self.buffer_size;
        }
        self.write_header()?;
        Ok(())
    }

    /// Snapshot the buffer in ring order: oldest byte first, newest last.
    pub fn snapshot(&mut self) -> Result<Vec<u8>, CircularFileError> {
        let size = self.buffer_size as usize;
        let mut raw = vec![0u8; size];
        self.file.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        self.file.read_exact(&mut raw)?;
        raw.rotate_left(self.current as usize);
        Ok(raw)
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Current byte offset of live data within the buffer region.
    pub fn current_offset(&self) -> u32 {
        self.current
    }

    /// Flush file contents and header to disk.
    pub fn sync(&mut self) -> Result<(), CircularFileError> {
        self.file.sync_all()?;
        Ok(())
    }
}
