//! BLAKE2 content digests.
//!
//! Every region of a combo file (executable, zipfile, footer) is certified
//! with an unkeyed BLAKE2b-512 digest.  These digests detect accidental or
//! naive tampering; they make no claim against an adversarial forger.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use blake2::{Blake2b512, Digest};

/// Length in bytes of a BLAKE2b-512 digest.
pub const DIGEST_LEN: usize = 64;

/// A raw 64-byte BLAKE2b-512 digest.
pub type Blake2Digest = [u8; DIGEST_LEN];

/// Hash a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> Blake2Digest {
    let mut hasher = Blake2b512::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Stream the file at `path` through BLAKE2b-512.
///
/// Returns the digest together with the number of bytes consumed, so callers
/// can record a region's length and checksum in a single pass.
pub fn hash_file(path: impl AsRef<Path>) -> io::Result<(Blake2Digest, u64)> {
    let mut file = File::open(path)?;
    hash_reader(&mut file)
}

/// Stream a reader to its end through BLAKE2b-512.
pub fn hash_reader(reader: &mut impl Read) -> io::Result<(Blake2Digest, u64)> {
    let mut hasher = Blake2b512::new();
    let length = io::copy(reader, &mut hasher)?;
    Ok((hasher.finalize().into(), length))
}

/// Compare two digests byte-by-byte, returning the first differing index.
///
/// Returns `None` when the digests are equal.  There is no need for constant
/// time here; the index is part of the diagnostic surface.
pub fn first_difference(a: &Blake2Digest, b: &Blake2Digest) -> Option<usize> {
    (0..DIGEST_LEN).find(|&i| a[i] != b[i])
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    // Standard BLAKE2b-512 test vectors.
    const EMPTY: &str = "786a02f742015903c6c6fd852552d272912f4740e15847618a86e217f71f5419\
                         d25e1031afee585313896444934eb04b903a685b1448b755d56f701afe9be2ce";
    const ABC: &str = "ba80a53f981c4d0d6a2797b69f12f6e94c212f14685ac4b74b12bb6fdbffa2d1\
                       7d87c5392aab792dc252d5de4533cc9518d38aa8dbf1925ab92386edd4009923";

    #[test]
    fn test_hash_bytes() {
        assert_eq!(hex::encode(hash_bytes(b"")), EMPTY);
        assert_eq!(hex::encode(hash_bytes(b"abc")), ABC);
    }

    #[test]
    fn test_hash_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let (digest, length) = hash_file(file.path()).unwrap();
        assert_eq!(hex::encode(digest), ABC);
        assert_eq!(length, 3);
    }

    #[test]
    fn test_hash_file_missing() {
        assert!(hash_file("/no/such/file").is_err());
    }

    #[test]
    fn test_first_difference() {
        let a = hash_bytes(b"abc");
        let mut b = a;
        assert_eq!(first_difference(&a, &b), None);

        b[17] ^= 0x40;
        assert_eq!(first_difference(&a, &b), Some(17));

        b[0] ^= 1;
        assert_eq!(first_difference(&a, &b), Some(0));
    }
}
