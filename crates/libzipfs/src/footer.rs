//! The combo-file footer.
//!
//! A combo file is `<executable> || <zipfile> || <footer>`.  The footer is a
//! fixed 256-byte big-endian record in the last bytes of the file: magic
//! markers at both ends, the length of each region, and a BLAKE2 checksum
//! over each region, including the footer itself (hashed with its own
//! digest field zeroed).
//!
//! The layout is declared with explicit-endian zerocopy field types so that
//! encoding and decoding are exact inverses of a plain byte copy.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    mem::size_of,
    path::Path,
};

use thiserror::Error;
use zerocopy::{big_endian::I64, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::digest::{first_difference, hash_bytes, Blake2Digest, DIGEST_LEN};

/// Serialized size of the footer.  Pinned by construction below.
pub const FOOTER_LEN: usize = 256;

/// Size of each magic marker region.
pub const MAGIC_LEN: usize = 16;

/// Opening magic marker, zero-padded to [`MAGIC_LEN`] on disk.
pub const MAGIC1: &[u8] = b"\nLibZipFs00\n";

/// Closing magic marker, zero-padded to [`MAGIC_LEN`] on disk.
pub const MAGIC2: &[u8] = b"\nLibZipFsEnd\n";

/// Decoding or validating a footer failed.
#[derive(Error, Debug)]
pub enum FooterError {
    #[error("file is {size} bytes, smaller than the {FOOTER_LEN} byte footer")]
    TooShort { size: u64 },
    #[error("footer field {field} does not start with its magic string")]
    BadMagic { field: &'static str },
    #[error(
        "footer self-checksum differs at byte {index}: computed '{computed}', stored '{stored}'"
    )]
    SelfChecksumMismatch {
        index: usize,
        computed: String,
        stored: String,
    },
    #[error(
        "executable length {executable_length} + zipfile length {zipfile_length} \
         does not equal the footer start offset {footer_start}"
    )]
    LengthMismatch {
        executable_length: i64,
        zipfile_length: i64,
        footer_start: i64,
    },
    #[error("{0}")]
    Io(#[from] io::Error),
}

/// The 256-byte trailer identifying a combo file and certifying its parts.
///
/// All integers are big-endian signed 64-bit.  The magic regions hold
/// [`MAGIC1`]/[`MAGIC2`] left-justified with zero padding; `reserved1` is
/// zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct Footer {
    pub reserved1: I64,
    pub magic1: [u8; MAGIC_LEN],

    pub executable_length: I64,
    pub zipfile_length: I64,
    pub footer_length: I64,

    pub executable_digest: Blake2Digest,
    pub zipfile_digest: Blake2Digest,
    pub footer_digest: Blake2Digest,

    pub magic2: [u8; MAGIC_LEN],
}

const _: () = assert!(size_of::<Footer>() == FOOTER_LEN);

fn magic_region(magic: &[u8]) -> [u8; MAGIC_LEN] {
    let mut region = [0u8; MAGIC_LEN];
    region[..magic.len()].copy_from_slice(magic);
    region
}

impl Footer {
    /// Build the footer for a combo with the given region lengths and
    /// content digests, including its own self-checksum.
    pub fn for_parts(
        executable_length: i64,
        executable_digest: Blake2Digest,
        zipfile_length: i64,
        zipfile_digest: Blake2Digest,
    ) -> Self {
        let mut footer = Footer {
            reserved1: I64::new(0),
            magic1: magic_region(MAGIC1),
            executable_length: I64::new(executable_length),
            zipfile_length: I64::new(zipfile_length),
            footer_length: I64::new(FOOTER_LEN as i64),
            executable_digest,
            zipfile_digest,
            footer_digest: [0; DIGEST_LEN],
            magic2: magic_region(MAGIC2),
        };
        footer.footer_digest = footer.self_checksum();
        footer
    }

    /// Serialize to the on-disk byte layout.
    pub fn encode(&self) -> [u8; FOOTER_LEN] {
        let mut bytes = [0u8; FOOTER_LEN];
        bytes.copy_from_slice(self.as_bytes());
        bytes
    }

    /// Deserialize from the on-disk byte layout.  Exact inverse of
    /// [`Footer::encode`]; performs no validation.
    pub fn decode(bytes: [u8; FOOTER_LEN]) -> Self {
        // the sizes match by construction
        Self::read_from_bytes(&bytes).expect("size mismatch")
    }

    /// Compute the footer's checksum over itself.
    ///
    /// The hash covers the serialized footer with the `footer_digest` field
    /// zeroed.  Operates on a local copy: the caller's value is never
    /// touched.
    pub fn self_checksum(&self) -> Blake2Digest {
        let mut copy = *self;
        copy.footer_digest = [0; DIGEST_LEN];
        hash_bytes(&copy.encode())
    }

    /// The validations that don't require reading the combo's content
    /// regions: magic markers, self-checksum, and length arithmetic.
    ///
    /// `footer_start` is the byte offset of the footer within the combo file
    /// (i.e. file size minus [`FOOTER_LEN`]).  Checks run cheapest-first so
    /// corruption fails before anyone streams a multi-megabyte prefix.
    pub fn inexpensive_checks(&self, footer_start: i64) -> Result<(), FooterError> {
        if &self.magic1[..MAGIC1.len()] != MAGIC1 {
            return Err(FooterError::BadMagic { field: "magic1" });
        }
        if &self.magic2[..MAGIC2.len()] != MAGIC2 {
            return Err(FooterError::BadMagic { field: "magic2" });
        }

        let computed = self.self_checksum();
        if let Some(index) = first_difference(&computed, &self.footer_digest) {
            return Err(FooterError::SelfChecksumMismatch {
                index,
                computed: hex::encode(computed),
                stored: hex::encode(self.footer_digest),
            });
        }

        let executable_length = self.executable_length.get();
        let zipfile_length = self.zipfile_length.get();
        if executable_length + zipfile_length != footer_start {
            return Err(FooterError::LengthMismatch {
                executable_length,
                zipfile_length,
                footer_start,
            });
        }

        Ok(())
    }

    /// Decode a serialized footer and run the inexpensive checks against it.
    pub fn reify_and_check(
        bytes: [u8; FOOTER_LEN],
        footer_start: i64,
    ) -> Result<Self, FooterError> {
        let footer = Footer::decode(bytes);
        footer.inexpensive_checks(footer_start)?;
        Ok(footer)
    }
}

/// Read the trailing footer of the file at `path` without validating it.
///
/// Returns the footer's start offset, the decoded footer, and the open file
/// positioned after the footer so callers can keep reading the same
/// descriptor.
pub fn reify_footer(path: impl AsRef<Path>) -> Result<(i64, Footer, File), FooterError> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    if size < FOOTER_LEN as u64 {
        return Err(FooterError::TooShort { size });
    }

    let footer_start = file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))? as i64;
    let mut bytes = [0u8; FOOTER_LEN];
    file.read_exact(&mut bytes)?;

    Ok((footer_start, Footer::decode(bytes), file))
}

/// Read and validate the trailing footer of the file at `path`.
///
/// This is the combo-file detector: any error means `path` is not a (valid)
/// combo file.  On success the zip region is
/// `[footer.executable_length, footer.executable_length + footer.zipfile_length)`.
pub fn read_footer(path: impl AsRef<Path>) -> Result<(i64, Footer, File), FooterError> {
    let (footer_start, footer, file) = reify_footer(path)?;
    footer.inexpensive_checks(footer_start)?;
    Ok((footer_start, footer, file))
}
