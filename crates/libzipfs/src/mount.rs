//! The mount session: acquire the kernel mount, serve requests, shut down.
//!
//! A session owns everything attached to one mount, released in reverse
//! order at shutdown: the backing descriptor and parsed central directory
//! live inside the filesystem value, which lives inside the kernel session,
//! which is consumed by the service thread.  Three edge-triggered signals
//! (channels whose closure is the event) sequence the lifecycle: `ready`
//! closes once the mount is visible in the host's mount table, `stop
//! request` asks for shutdown, and `done` closes when the service loop has
//! exited.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use fuser::{MountOption, Session};
use rustix::io::Errno;
use tempfile::TempDir;
use thiserror::Error;

use crate::{
    footer::{read_footer, FooterError},
    fs::ZipFs,
    mounttool::{self, ProbeError},
    util::trim_trailing_slashes,
    zipindex::ZipIndex,
};

/// Starting or stopping a mount session failed.
#[derive(Error, Debug)]
pub enum MountError {
    #[error("no zip data: derived window length {length} for '{path}' is not positive")]
    NoData { path: PathBuf, length: i64 },
    #[error("could not parse the zip archive in '{path}': {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error(transparent)]
    Footer(#[from] FooterError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("mount error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

struct Inner {
    started: bool,
    stopped: bool,
    ready_tx: Option<Sender<()>>,
    stop_tx: Option<Sender<()>>,
    done_tx: Option<Sender<()>>,
    serve_handle: Option<JoinHandle<io::Result<()>>>,
    /// Owned when the mount directory was created by [`mount_combo_zip`];
    /// removed when the session is dropped.
    _tmp_mountpoint: Option<TempDir>,
}

/// One read-only FUSE mount of a zip region of a backing file.
///
/// Constructed inert; [`start`](FuseZipFs::start) opens, mounts, and begins
/// serving; [`stop`](FuseZipFs::stop) unmounts and releases everything.
pub struct FuseZipFs {
    zipfile_path: PathBuf,
    mountpoint: PathBuf,
    offset: i64,
    length: i64,
    footer_len: i64,

    inner: Mutex<Inner>,
    ready_rx: Receiver<()>,
    stop_rx: Receiver<()>,
    done_rx: Receiver<()>,
}

impl FuseZipFs {
    /// Set up an inert session serving the window `[offset, offset+length)`
    /// of `zipfile_path` at `mountpoint`.
    ///
    /// Pass `length <= 0` to have [`start`](FuseZipFs::start) derive the
    /// window from the file size: everything between `offset` and the final
    /// `footer_len` bytes.  For a plain zip file use offset 0, length 0,
    /// footer 0.  Trailing slashes on the mountpoint are stripped; the
    /// kernel interface rejects them.
    pub fn new(
        zipfile_path: impl Into<PathBuf>,
        mountpoint: impl AsRef<Path>,
        offset: i64,
        length: i64,
        footer_len: i64,
    ) -> Arc<Self> {
        let mountpoint = mountpoint.as_ref();
        let mountpoint = match mountpoint.to_str() {
            Some(s) => PathBuf::from(trim_trailing_slashes(s)),
            None => mountpoint.to_owned(),
        };

        let (ready_tx, ready_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();
        let (done_tx, done_rx) = unbounded();

        Arc::new(FuseZipFs {
            zipfile_path: zipfile_path.into(),
            mountpoint,
            offset,
            length,
            footer_len,
            inner: Mutex::new(Inner {
                started: false,
                stopped: false,
                ready_tx: Some(ready_tx),
                stop_tx: Some(stop_tx),
                done_tx: Some(done_tx),
                serve_handle: None,
                _tmp_mountpoint: None,
            }),
            ready_rx,
            stop_rx,
            done_rx,
        })
    }

    pub fn zipfile_path(&self) -> &Path {
        &self.zipfile_path
    }

    /// The (trimmed) mount directory.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Closes once the mount is visible to the host filesystem.
    pub fn ready(&self) -> Receiver<()> {
        self.ready_rx.clone()
    }

    /// Closes once the service loop has exited, whether through
    /// [`stop`](FuseZipFs::stop) or because someone force-unmounted the
    /// filesystem from outside.
    pub fn done(&self) -> Receiver<()> {
        self.done_rx.clone()
    }

    /// Ask the supervisor to shut the session down.  Returns immediately.
    pub fn request_stop(&self) {
        self.inner.lock().unwrap().stop_tx.take();
    }

    /// Open the backing file, mount, and start serving.
    ///
    /// Returns once the mount is visible in the host's mount table.  On
    /// `ProbeError::MountNotVisible` the service loop is already running;
    /// callers that treat it as fatal should still call
    /// [`stop`](FuseZipFs::stop).
    pub fn start(self: &Arc<Self>) -> Result<(), MountError> {
        let io_ctx = |path: &Path| {
            let path = path.to_owned();
            move |source: io::Error| MountError::Io { path, source }
        };

        let backing = File::open(&self.zipfile_path).map_err(io_ctx(&self.zipfile_path))?;

        let mut length = self.length;
        if length <= 0 {
            let size = backing.metadata().map_err(io_ctx(&self.zipfile_path))?.len() as i64;
            length = size - self.offset - self.footer_len;
            if length <= 0 {
                return Err(MountError::NoData {
                    path: self.zipfile_path.clone(),
                    length,
                });
            }
        }

        let index = ZipIndex::open(Arc::new(backing), self.offset as u64, length as u64)
            .map_err(|source| MountError::Zip {
                path: self.zipfile_path.clone(),
                source,
            })?;

        let options = [MountOption::RO, MountOption::FSName("libzipfs".to_string())];
        let mut session = Session::new(ZipFs::new(index), &self.mountpoint, &options)
            .map_err(io_ctx(&self.mountpoint))?;

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.started {
                return Err(MountError::Io {
                    path: self.mountpoint.clone(),
                    source: io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "mount session was already started",
                    ),
                });
            }
            inner.started = true;

            let done_tx = inner.done_tx.take();
            let handle = thread::Builder::new()
                .name("libzipfs-serve".into())
                .spawn(move || {
                    let result = session.run();
                    drop(done_tx);
                    result
                })
                .map_err(io_ctx(&self.mountpoint))?;
            inner.serve_handle = Some(handle);
        }

        let supervisor = Arc::clone(self);
        let stop_rx = self.stop_rx.clone();
        let done_rx = self.done_rx.clone();
        thread::Builder::new()
            .name("libzipfs-supervisor".into())
            .spawn(move || {
                select! {
                    recv(stop_rx) -> _ => (),
                    recv(done_rx) -> _ => (),
                }
                // whichever way the session is coming down, finish the job
                if let Err(err) = supervisor.stop() {
                    log::error!(
                        "cleanup of mount at '{}' failed: {err}",
                        supervisor.mountpoint.display()
                    );
                }
            })
            .map_err(io_ctx(&self.mountpoint))?;

        mounttool::wait_until_mounted(&self.mountpoint)?;
        self.inner.lock().unwrap().ready_tx.take();
        Ok(())
    }

    /// Unmount and release the session.  Idempotent.
    ///
    /// Waits for the service loop to exit before returning.  The loop's
    /// parting error is reported, except for the descriptor errors that
    /// severing the kernel connection always produces.
    pub fn stop(&self) -> Result<(), MountError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            return Ok(());
        }

        if !inner.started {
            // nothing was acquired
            inner.stopped = true;
            return Ok(());
        }

        mounttool::unmount(&self.mountpoint)?;
        inner.stopped = true;

        let _ = self.done_rx.recv();
        let Some(handle) = inner.serve_handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) if is_disconnect(&err) => {
                log::debug!("service loop ended with the expected disconnect: {err}");
                Ok(())
            }
            Ok(Err(source)) => Err(MountError::Io {
                path: self.mountpoint.clone(),
                source,
            }),
            Err(_) => Err(MountError::Io {
                path: self.mountpoint.clone(),
                source: io::Error::other("service thread panicked"),
            }),
        }
    }
}

/// Errors the request loop reports when the kernel connection goes away
/// under it.  Expected on every unmount path, including force-unmounts from
/// outside.
fn is_disconnect(err: &io::Error) -> bool {
    [Errno::BADF, Errno::NODEV, Errno::NOTCONN]
        .iter()
        .any(|errno| err.raw_os_error() == Some(errno.raw_os_error()))
}

/// Mount the zip region of the running executable itself.
///
/// For self-extracting binaries: the current executable is expected to be a
/// combo file.  Its footer is read and validated, a unique temporary mount
/// directory is created (owned by the session, removed when the session is
/// dropped), and the archive is mounted there.  Returns the started session
/// and the mount path.
pub fn mount_combo_zip() -> Result<(Arc<FuseZipFs>, PathBuf), MountError> {
    let exe = std::env::current_exe().map_err(|source| MountError::Io {
        path: PathBuf::from("<current exe>"),
        source,
    })?;
    let (_footer_start, footer, file) = read_footer(&exe)?;
    drop(file);

    let dir = tempfile::Builder::new()
        .prefix("libzipfs")
        .tempdir()
        .map_err(|source| MountError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
    let mountpoint = dir.path().to_path_buf();

    let session = FuseZipFs::new(
        &exe,
        &mountpoint,
        footer.executable_length.get(),
        footer.zipfile_length.get(),
        footer.footer_length.get(),
    );
    session.inner.lock().unwrap()._tmp_mountpoint = Some(dir);
    session.start()?;

    Ok((session, mountpoint))
}
