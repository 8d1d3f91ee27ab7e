//! A seekable read-only view over a byte range of a shared backing file.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    sync::Arc,
};

use rustix::io::pread;

/// A `Read + Seek` view over `[offset, offset + len)` of a backing file.
///
/// This is what lets a zip archive embedded after an executable prefix be
/// parsed in place: the zip reader sees a stream that starts at the embedded
/// archive's first byte and ends at its last, even though the backing file
/// is longer on both sides.
///
/// All reads are positional (`pread`), so any number of windows and clones
/// can read the same descriptor concurrently without racing on a shared
/// file offset.  Each window carries its own cursor.
#[derive(Debug, Clone)]
pub struct Window {
    file: Arc<File>,
    offset: u64,
    len: u64,
    pos: u64,
}

impl Window {
    /// View `[offset, offset + len)` of `file`.
    pub fn new(file: Arc<File>, offset: u64, len: u64) -> Self {
        Window {
            file,
            offset,
            len,
            pos: 0,
        }
    }

    /// Length of the window in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Read for Window {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }

        let avail = (self.len - self.pos).min(buf.len() as u64) as usize;
        let n = pread(&*self.file, &mut buf[..avail], self.offset + self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for Window {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i128,
            SeekFrom::End(delta) => self.len as i128 + delta as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
        };

        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the window",
            ));
        }

        // seeking past the end is legal; reads there return EOF
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    fn backing(content: &[u8]) -> Arc<File> {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(content).unwrap();
        Arc::new(file)
    }

    #[test]
    fn test_window_bounds() {
        let file = backing(b"0123456789");
        let mut window = Window::new(file, 2, 5);

        let mut content = Vec::new();
        window.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"23456");

        // at the end of the window, even though the file goes on
        assert_eq!(window.read(&mut [0u8; 4]).unwrap(), 0);
    }

    #[test]
    fn test_window_whole_file() {
        let file = backing(b"abc");
        let mut window = Window::new(file, 0, 3);

        let mut content = Vec::new();
        window.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"abc");
    }

    #[test]
    fn test_seek_from_end() {
        let file = backing(b"0123456789");
        let mut window = Window::new(file, 2, 5);

        assert_eq!(window.seek(SeekFrom::End(-2)).unwrap(), 3);
        let mut buf = [0u8; 2];
        window.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"56");

        assert!(window.seek(SeekFrom::Current(-100)).is_err());

        // past-the-end seeks succeed and read EOF
        assert_eq!(window.seek(SeekFrom::End(10)).unwrap(), 15);
        assert_eq!(window.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_clones_have_independent_cursors() {
        let file = backing(b"0123456789");
        let mut a = Window::new(file, 0, 10);
        let mut b = a.clone();

        let mut buf = [0u8; 3];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"012");

        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"012");

        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"345");
    }
}
