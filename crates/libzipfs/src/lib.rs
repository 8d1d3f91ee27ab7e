//! libzipfs serves the contents of a ZIP archive as a read-only FUSE
//! filesystem.  The archive may be a plain `.zip` file, or it may be embedded
//! in a "combo" file: an executable, followed by the zipfile, followed by a
//! 256-byte footer that describes the combination and certifies each region
//! with a BLAKE2 checksum.
//!
//! The combiner builds combo files, the splitter takes them back apart, and
//! the mount session exposes the zip region (at any byte offset) through the
//! kernel without ever physically splitting the file.

#![forbid(unsafe_code)]

pub mod combiner;
pub mod digest;
pub mod footer;
pub mod fs;
pub mod mount;
pub mod mounttool;
pub mod splitter;
pub mod util;
pub mod window;
pub mod zipindex;
