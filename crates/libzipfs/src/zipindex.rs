//! The parsed central directory of the served archive.
//!
//! At mount time the archive's central directory is parsed once (through the
//! byte window) and snapshotted into a plain vector of [`Entry`] records.
//! Lookups, directory listings, and attribute queries all work against the
//! immutable snapshot, and every `open` mints an independent decompression
//! stream over the entry's raw byte range.  Nodes refer to entries by index;
//! nothing borrows from the parser.

use std::{
    fs::File,
    io::{self, Read},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use flate2::read::DeflateDecoder;
use zip::{result::ZipError, CompressionMethod, DateTime, ZipArchive};

use crate::window::Window;

/// Metadata for one central-directory entry.
///
/// `data_start` and `compressed_size` delimit the entry's raw bytes relative
/// to the start of the archive window, which is all that's needed to open
/// the entry again without consulting the parser.
#[derive(Debug, Clone)]
pub struct Entry {
    /// Entry name as stored; directory names end with `/`.
    pub name: String,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
    /// Unix mode bits, when the archive recorded them.
    pub mode: Option<u32>,
    /// Modification time (unix epoch when absent or unrepresentable).
    pub mtime: SystemTime,
    /// Offset of the entry's first content byte within the archive window.
    pub data_start: u64,
    method: CompressionMethod,
}

impl Entry {
    /// Directory entries are the ones whose stored name ends with `/`.
    pub fn is_dir(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// The central-directory snapshot plus the shared backing descriptor.
#[derive(Debug)]
pub struct ZipIndex {
    file: Arc<File>,
    base: u64,
    entries: Vec<Entry>,
}

impl ZipIndex {
    /// Parse the archive found at `[offset, offset + length)` of `file`.
    pub fn open(file: Arc<File>, offset: u64, length: u64) -> Result<Self, ZipError> {
        let window = Window::new(Arc::clone(&file), offset, length);
        let mut archive = ZipArchive::new(window)?;

        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let entry = archive.by_index(i)?;
            entries.push(Entry {
                name: entry.name().to_owned(),
                uncompressed_size: entry.size(),
                compressed_size: entry.compressed_size(),
                mode: entry.unix_mode(),
                mtime: modification_time(entry.last_modified()),
                data_start: entry.data_start(),
                method: entry.compression(),
            });
        }

        Ok(ZipIndex {
            file,
            base: offset,
            entries,
        })
    }

    /// The entries in central-directory order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Start a fresh decompression stream at the beginning of entry `index`.
    ///
    /// The stream reads the entry's raw bytes through its own positional
    /// window, so streams for different opens never interfere.
    pub fn open_entry(&self, index: usize) -> io::Result<EntryReader> {
        let entry = &self.entries[index];
        let raw = Window::new(
            Arc::clone(&self.file),
            self.base + entry.data_start,
            entry.compressed_size,
        );

        match entry.method {
            CompressionMethod::Stored => Ok(EntryReader::Stored(raw)),
            CompressionMethod::Deflated => Ok(EntryReader::Deflated(DeflateDecoder::new(raw))),
            other => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("entry '{}' uses unsupported compression method {other}", entry.name),
            )),
        }
    }
}

fn modification_time(datetime: Option<DateTime>) -> SystemTime {
    datetime
        .and_then(|dt| time::OffsetDateTime::try_from(dt).ok())
        .and_then(|odt| u64::try_from(odt.unix_timestamp()).ok())
        .map_or(UNIX_EPOCH, |secs| UNIX_EPOCH + Duration::from_secs(secs))
}

/// One open of one entry: an exclusively-owned decompression stream.
///
/// Not seekable.  Reads advance from the entry's first byte to its last;
/// the FUSE layer advertises this to the kernel.
#[derive(Debug)]
pub enum EntryReader {
    Stored(Window),
    Deflated(DeflateDecoder<Window>),
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            EntryReader::Stored(raw) => raw.read(buf),
            EntryReader::Deflated(decoder) => decoder.read(buf),
        }
    }
}
