use std::io::{ErrorKind, Read, Result};

/// Strip trailing slashes from a mountpoint path.
///
/// The kernel mount interface rejects mountpoints with a trailing slash, so
/// every path headed there goes through this first.  A lone "/" is left
/// alone.  Idempotent.
pub fn trim_trailing_slashes(mountpoint: &str) -> &str {
    let bytes = mountpoint.as_bytes();
    let mut end = bytes.len();
    while end > 1 && bytes[end - 1] == b'/' {
        end -= 1;
    }
    &mountpoint[..end]
}

/// Read from `reader` until `buf` is full or the stream ends, retrying on
/// EINTR.  Returns the number of bytes read.
///
/// Unlike `Read::read_exact`, end-of-stream is not an error: the short count
/// is returned and the caller decides whether it was legal.  The FUSE read
/// handler relies on this to fill page-cache pages completely except at end
/// of file.
pub fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let buflen = buf.len();
    let mut todo: &mut [u8] = buf;

    while !todo.is_empty() {
        match reader.read(todo) {
            Ok(0) => break,
            Ok(n) => todo = &mut todo[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(buflen - todo.len())
}
