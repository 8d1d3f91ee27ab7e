//! The FUSE node model: kernel requests against the archive snapshot.
//!
//! The root directory is synthetic.  Every other node is a central-directory
//! entry, addressed by index: entry `i` answers to inode `i + 2`.  Entry
//! names ending in `/` are directories, everything else is a regular file.

use std::{
    collections::HashMap,
    ffi::OsStr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fuser::{
    consts::FOPEN_NONSEEKABLE, FileAttr, FileType, Filesystem, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyOpen, Request,
};
use rustix::{io::Errno, process::getgid, process::getuid};

use crate::{
    util::read_full,
    zipindex::{Entry, EntryReader, ZipIndex},
};

/// The archive is immutable while mounted, so cached attributes never expire.
const TTL: Duration = Duration::from_secs(1_000_000);

/// Inode of the synthetic root directory (FUSE convention).
pub const ROOT_INO: u64 = 1;

fn ino_for(index: usize) -> u64 {
    index as u64 + 2
}

fn index_for(ino: u64) -> Option<usize> {
    ino.checked_sub(2).map(|i| i as usize)
}

/// Resolve `prefix + name` against the entries, in central-directory order.
///
/// An entry equal to the path is a file hit; an entry equal to the path plus
/// a trailing `/` is a directory hit.  The first matching entry wins.
fn lookup_entry(entries: &[Entry], prefix: &str, name: &str) -> Option<usize> {
    let path = format!("{prefix}{name}");
    entries.iter().position(|entry| {
        entry.name == path
            || (entry.name.ends_with('/') && entry.name[..entry.name.len() - 1] == path)
    })
}

/// The direct children of the directory whose entry-name prefix is `prefix`
/// (empty for the root), in central-directory order.
///
/// For each entry under the prefix, the remaining suffix is the candidate
/// name: the empty suffix is the directory itself, and a suffix with an
/// interior `/` lives in a deeper subdirectory; both are skipped.  A single
/// trailing `/` marks a directory and is stripped from the emitted name.
fn children<'a>(entries: &'a [Entry], prefix: &str) -> Vec<(usize, &'a str, FileType)> {
    entries
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| {
            let name = entry.name.strip_prefix(prefix)?;
            if name.is_empty() {
                return None;
            }
            if name.as_bytes()[..name.len() - 1].contains(&b'/') {
                return None;
            }
            Some(match name.strip_suffix('/') {
                Some(dir_name) => (index, dir_name, FileType::Directory),
                None => (index, name, FileType::RegularFile),
            })
        })
        .collect()
}

/// Read-only FUSE filesystem over a [`ZipIndex`].
pub struct ZipFs {
    index: ZipIndex,
    handles: HashMap<u64, EntryReader>,
    next_fh: u64,
}

impl ZipFs {
    pub fn new(index: ZipIndex) -> Self {
        ZipFs {
            index,
            handles: HashMap::new(),
            next_fh: 1,
        }
    }

    /// The entry-name prefix of a directory inode: empty for the root, the
    /// entry's own name (which ends in `/`) otherwise.  `None` when the
    /// inode is not a directory.
    fn prefix_of(&self, ino: u64) -> Option<&str> {
        if ino == ROOT_INO {
            return Some("");
        }
        let entry = self.index.entries().get(index_for(ino)?)?;
        entry.is_dir().then_some(entry.name.as_str())
    }

    /// Inode of the parent of directory `ino`, for the `..` dirent.
    fn parent_ino(&self, ino: u64) -> u64 {
        let Some(prefix) = self.prefix_of(ino).filter(|p| !p.is_empty()) else {
            return ROOT_INO;
        };

        // "dirA/dirB/" -> "dirA/"
        let parent_name = match prefix[..prefix.len() - 1].rfind('/') {
            Some(slash) => &prefix[..=slash],
            None => return ROOT_INO,
        };
        self.index
            .entries()
            .iter()
            .position(|entry| entry.name == parent_name)
            .map_or(ROOT_INO, ino_for)
    }

    fn root_fileattr(&self) -> FileAttr {
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 1,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 2,
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn entry_fileattr(&self, index: usize) -> FileAttr {
        let entry = &self.index.entries()[index];
        let (kind, default_mode, nlink) = match entry.is_dir() {
            true => (FileType::Directory, 0o755, 2),
            false => (FileType::RegularFile, 0o644, 1),
        };
        let mtime = entry.mtime;

        FileAttr {
            ino: ino_for(index),
            size: entry.uncompressed_size,
            blocks: entry.uncompressed_size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: (entry.mode.unwrap_or(default_mode) & 0o7777) as u16,
            nlink,
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    fn fileattr(&self, ino: u64) -> Option<FileAttr> {
        if ino == ROOT_INO {
            return Some(self.root_fileattr());
        }
        let index = index_for(ino)?;
        (index < self.index.entries().len()).then(|| self.entry_fileattr(index))
    }
}

impl Filesystem for ZipFs {
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        reply.statfs(0, 0, 0, 0, 0, 4096, 255, 4096);
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        log::trace!("lookup({parent}, {name:?})");
        let Some(prefix) = self.prefix_of(parent) else {
            log::error!("lookup({parent}, {name:?}) parent is not a directory");
            return reply.error(Errno::BADF.raw_os_error());
        };
        let Some(name) = name.to_str() else {
            // entry names are UTF-8; nothing else can match
            return reply.error(Errno::NOENT.raw_os_error());
        };

        match lookup_entry(self.index.entries(), prefix, name) {
            Some(index) => reply.entry(&TTL, &self.entry_fileattr(index), 0),
            None => reply.error(Errno::NOENT.raw_os_error()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.fileattr(ino) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => {
                log::error!("getattr({ino}) inode does not exist");
                reply.error(Errno::BADF.raw_os_error())
            }
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        mut offset: i64,
        mut reply: ReplyDirectory,
    ) {
        log::trace!("readdir({ino}, {offset})");
        let Some(prefix) = self.prefix_of(ino) else {
            log::error!("readdir({ino}) inode is not a directory");
            return reply.error(Errno::BADF.raw_os_error());
        };

        if offset == 0 {
            offset += 1;
            if reply.add(ino, offset, FileType::Directory, ".") {
                return reply.ok();
            }
        }

        if offset == 1 {
            offset += 1;
            if reply.add(self.parent_ino(ino), offset, FileType::Directory, "..") {
                return reply.ok();
            }
        }

        for (index, name, kind) in children(self.index.entries(), prefix)
            .into_iter()
            .skip(offset as usize - 2)
        {
            offset += 1;
            if reply.add(ino_for(index), offset, kind, name) {
                break;
            }
        }

        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: fuser::ReplyEmpty,
    ) {
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        log::trace!("open({ino})");
        let Some(index) = index_for(ino).filter(|&i| i < self.index.entries().len()) else {
            log::error!("open({ino}) inode does not exist");
            return reply.error(Errno::BADF.raw_os_error());
        };
        if self.index.entries()[index].is_dir() {
            return reply.error(Errno::ISDIR.raw_os_error());
        }

        match self.index.open_entry(index) {
            Ok(stream) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                self.handles.insert(fh, stream);
                // individual entries inside a zip file are not seekable
                reply.opened(fh, FOPEN_NONSEEKABLE);
            }
            Err(err) => {
                log::error!("open({ino}) could not open the entry stream: {err}");
                reply.error(Errno::IO.raw_os_error());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        // The kernel was told this handle is not seekable, so reads arrive
        // in ascending contiguous order and the offset argument is not
        // consulted.  A read that arrives out of order would get the wrong
        // bytes; that is the kernel's contract to keep, not ours to repair.
        //
        // The one obligation on this side: fill the buffer completely unless
        // the stream has ended.  Reads into the page cache are page-aligned,
        // and a short count mid-file would leave the rest of the page cached
        // as zeros.
        let Some(stream) = self.handles.get_mut(&fh) else {
            log::error!("read({fh}, {size}) handle does not exist");
            return reply.error(Errno::BADF.raw_os_error());
        };

        let mut buf = vec![0u8; size as usize];
        match read_full(stream, &mut buf) {
            Ok(n) => reply.data(&buf[..n]),
            Err(err) => {
                log::error!("read({fh}, {size}) failed: {err}");
                reply.error(Errno::IO.raw_os_error());
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: fuser::ReplyEmpty,
    ) {
        // releasing an already-released handle is fine
        self.handles.remove(&fh);
        reply.ok();
    }
}

#[cfg(test)]
mod test {
    use std::{
        fs::File,
        io::{Cursor, Read, Write},
        sync::Arc,
    };

    use similar_asserts::assert_eq;
    use zip::{write::SimpleFileOptions, ZipWriter};

    use super::*;
    use crate::test::{sample_zip, tempdir, write_fixture, HELLO_CONTENT};

    fn index_for_bytes(bytes: &[u8]) -> ZipIndex {
        let dir = tempdir();
        let path = write_fixture(dir.path(), "archive", bytes);
        let file = Arc::new(File::open(path).unwrap());
        ZipIndex::open(file, 0, bytes.len() as u64).unwrap()
    }

    /// root.txt, dirA/, dirA/dirB/, dirA/dirB/hello, dirA/top
    fn wide_zip() -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();

        writer.start_file("root.txt", options).unwrap();
        writer.write_all(b"at the top\n").unwrap();
        writer.add_directory("dirA", options).unwrap();
        writer.add_directory("dirA/dirB", options).unwrap();
        writer.start_file("dirA/dirB/hello", options).unwrap();
        writer.write_all(HELLO_CONTENT).unwrap();
        writer.start_file("dirA/top", options).unwrap();
        writer.write_all(b"nested file\n").unwrap();

        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_lookup_entry() {
        let index = index_for_bytes(&wide_zip());
        let entries = index.entries();

        assert_eq!(lookup_entry(entries, "", "root.txt"), Some(0));
        assert_eq!(lookup_entry(entries, "", "dirA"), Some(1));
        assert_eq!(lookup_entry(entries, "dirA/", "dirB"), Some(2));
        assert_eq!(lookup_entry(entries, "dirA/dirB/", "hello"), Some(3));
        assert_eq!(lookup_entry(entries, "dirA/", "top"), Some(4));

        assert_eq!(lookup_entry(entries, "", "missing"), None);
        // names resolve only against their own directory
        assert_eq!(lookup_entry(entries, "", "hello"), None);
        assert_eq!(lookup_entry(entries, "dirA/", "hello"), None);
    }

    #[test]
    fn test_children() {
        let index = index_for_bytes(&wide_zip());
        let entries = index.entries();

        let root: Vec<_> = children(entries, "")
            .into_iter()
            .map(|(_, name, kind)| (name, kind))
            .collect();
        assert_eq!(
            root,
            [
                ("root.txt", FileType::RegularFile),
                ("dirA", FileType::Directory),
            ]
        );

        let dir_a: Vec<_> = children(entries, "dirA/")
            .into_iter()
            .map(|(_, name, kind)| (name, kind))
            .collect();
        assert_eq!(
            dir_a,
            [
                ("dirB", FileType::Directory),
                ("top", FileType::RegularFile),
            ]
        );

        let dir_b: Vec<_> = children(entries, "dirA/dirB/")
            .into_iter()
            .map(|(_, name, kind)| (name, kind))
            .collect();
        assert_eq!(dir_b, [("hello", FileType::RegularFile)]);
    }

    #[test]
    fn test_attrs() {
        let fs = ZipFs::new(index_for_bytes(&sample_zip()));

        let root = fs.fileattr(ROOT_INO).unwrap();
        assert_eq!(root.kind, FileType::Directory);
        assert_eq!(root.perm, 0o755);

        // sample_zip: dirA/ = 0, dirA/dirB/ = 1, hello = 2
        let dir = fs.fileattr(ino_for(0)).unwrap();
        assert_eq!(dir.kind, FileType::Directory);
        assert_eq!(dir.perm, 0o755);

        let hello = fs.fileattr(ino_for(2)).unwrap();
        assert_eq!(hello.kind, FileType::RegularFile);
        assert_eq!(hello.size, HELLO_CONTENT.len() as u64);
        assert_eq!(hello.perm, 0o644);
        assert!(hello.mtime > UNIX_EPOCH);
        assert_eq!(hello.ctime, hello.mtime);
        assert_eq!(hello.crtime, hello.mtime);

        assert!(fs.fileattr(ino_for(99)).is_none());
    }

    #[test]
    fn test_parent_ino() {
        let fs = ZipFs::new(index_for_bytes(&sample_zip()));

        assert_eq!(fs.parent_ino(ROOT_INO), ROOT_INO);
        assert_eq!(fs.parent_ino(ino_for(0)), ROOT_INO); // dirA/ -> root
        assert_eq!(fs.parent_ino(ino_for(1)), ino_for(0)); // dirA/dirB/ -> dirA/
    }

    #[test]
    fn test_entry_streams_via_index() {
        let fs = ZipFs::new(index_for_bytes(&sample_zip()));

        let mut stream = fs.index.open_entry(2).unwrap();
        let mut content = Vec::new();
        stream.read_to_end(&mut content).unwrap();
        assert_eq!(content, HELLO_CONTENT);
    }
}
