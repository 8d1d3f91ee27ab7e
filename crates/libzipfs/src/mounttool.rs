//! Discovery of the host's mount and umount utilities, and the probes that
//! scrape their output.
//!
//! Readiness and unmount detection work by running the mount-listing tool
//! and checking whether the mountpoint appears in its output.  A native
//! mount-status API would be preferable where available; this probe is the
//! portable fallback and currently the only implementation.

use std::{
    ffi::{OsStr, OsString},
    io,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    process::Command,
    thread,
    time::Duration,
};

use once_cell::sync::Lazy;
use thiserror::Error;

/// Attempts when polling the mount table for a mountpoint to (dis)appear.
pub const PROBE_TRIES: u32 = 40;

/// Sleep between mount-table polls.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(3);

const UNMOUNT_TRIES: u32 = 2;
const UNMOUNT_INTERVAL: Duration = Duration::from_millis(20);

const MOUNT_CANDIDATES: &[&str] = &[
    "/sbin/mount",
    "/bin/mount",
    "/usr/sbin/mount",
    "/usr/bin/mount",
];

// fusermount first: unprivileged unmount needs it on hosts where plain
// umount is root-only
const UMOUNT_CANDIDATES: &[&str] = &[
    "/bin/fusermount",
    "/sbin/fusermount",
    "/sbin/umount",
    "/bin/umount",
    "/usr/sbin/umount",
    "/usr/bin/umount",
];

/// A required mount utility could not be located.
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("no mount utility found (tried /sbin/mount, /bin/mount, /usr/sbin/mount, /usr/bin/mount)")]
    MountMissing,
    #[error("no umount utility found (tried fusermount and umount in the usual locations)")]
    UmountMissing,
}

/// A mount-table probe or unmount invocation failed.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(
        "could not locate mount point '{mountpoint}' in {tool} output, \
         even after {tries} tries with {interval:?} sleep between"
    )]
    MountNotVisible {
        mountpoint: PathBuf,
        tool: PathBuf,
        tries: u32,
        interval: Duration,
    },
    #[error(
        "mount point '{mountpoint}' was still present in {tool} output, \
         even after {tries} waits with {interval:?} sleep between each"
    )]
    UnmountNotVisible {
        mountpoint: PathBuf,
        tool: PathBuf,
        tries: u32,
        interval: Duration,
    },
    #[error("could not query for mount points with {tool}: {source}")]
    Io {
        tool: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The discovered mount-listing and unmount utilities.
#[derive(Debug, Clone)]
pub struct MountTools {
    pub mount: PathBuf,
    pub umount: PathBuf,
}

static TOOLS: Lazy<Result<MountTools, ToolError>> = Lazy::new(MountTools::discover);

/// The process-wide tool paths, discovered once at first use.
pub fn tools() -> Result<&'static MountTools, ToolError> {
    TOOLS.as_ref().map_err(Clone::clone)
}

impl MountTools {
    fn discover() -> Result<Self, ToolError> {
        Ok(MountTools {
            mount: first_existing(MOUNT_CANDIDATES).ok_or(ToolError::MountMissing)?,
            umount: first_existing(UMOUNT_CANDIDATES).ok_or(ToolError::UmountMissing)?,
        })
    }

    /// Argument vector for unmounting `mountpoint`.  fusermount wants `-u`.
    fn umount_args(&self, mountpoint: &Path) -> Vec<OsString> {
        let mut args = Vec::with_capacity(2);
        if self.umount.file_name() == Some(OsStr::new("fusermount")) {
            args.push("-u".into());
        }
        args.push(mountpoint.into());
        args
    }

    fn mount_table_contains(&self, mountpoint: &Path) -> Result<bool, ProbeError> {
        let output = Command::new(&self.mount)
            .output()
            .map_err(|source| ProbeError::Io {
                tool: self.mount.clone(),
                source,
            })?;

        let needle = mountpoint.as_os_str().as_bytes();
        Ok(!needle.is_empty() && output.stdout.windows(needle.len()).any(|w| w == needle))
    }
}

fn first_existing(candidates: &[&str]) -> Option<PathBuf> {
    candidates
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

/// Poll until `mountpoint` shows up in the mount table.
pub fn wait_until_mounted(mountpoint: &Path) -> Result<(), ProbeError> {
    let tools = tools()?;
    for attempt in 1..=PROBE_TRIES {
        if tools.mount_table_contains(mountpoint)? {
            log::trace!("found mount point '{}' on try {attempt}", mountpoint.display());
            return Ok(());
        }
        thread::sleep(PROBE_INTERVAL);
    }
    Err(ProbeError::MountNotVisible {
        mountpoint: mountpoint.to_owned(),
        tool: tools.mount.clone(),
        tries: PROBE_TRIES,
        interval: PROBE_INTERVAL,
    })
}

/// Poll until `mountpoint` no longer shows up in the mount table.
pub fn wait_until_unmounted(mountpoint: &Path) -> Result<(), ProbeError> {
    let tools = tools()?;
    for attempt in 1..=PROBE_TRIES {
        if !tools.mount_table_contains(mountpoint)? {
            log::trace!(
                "mount point '{}' was gone from mount output on try {attempt}",
                mountpoint.display()
            );
            return Ok(());
        }
        thread::sleep(PROBE_INTERVAL);
    }
    Err(ProbeError::UnmountNotVisible {
        mountpoint: mountpoint.to_owned(),
        tool: tools.mount.clone(),
        tries: PROBE_TRIES,
        interval: PROBE_INTERVAL,
    })
}

/// Unmount `mountpoint` with the discovered tool and wait until the mount
/// table agrees it is gone.
///
/// The tool is given two attempts, 20 ms apart; a failed first attempt is
/// common when the kernel is still flushing the connection, and the probe
/// afterwards is the real arbiter.
pub fn unmount(mountpoint: &Path) -> Result<(), ProbeError> {
    let tools = tools()?;
    let args = tools.umount_args(mountpoint);

    for attempt in 1..=UNMOUNT_TRIES {
        match Command::new(&tools.umount).args(&args).output() {
            Ok(output) if output.status.success() => break,
            Ok(output) => log::debug!(
                "unmount attempt {attempt} with {} exited {}: {}",
                tools.umount.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end(),
            ),
            Err(err) => log::debug!(
                "unmount attempt {attempt} could not run {}: {err}",
                tools.umount.display(),
            ),
        }
        if attempt < UNMOUNT_TRIES {
            thread::sleep(UNMOUNT_INTERVAL);
        }
    }

    wait_until_unmounted(mountpoint)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_umount_args_plain() {
        let tools = MountTools {
            mount: "/sbin/mount".into(),
            umount: "/sbin/umount".into(),
        };
        assert_eq!(
            tools.umount_args(Path::new("/mnt/zip")),
            [OsString::from("/mnt/zip")]
        );
    }

    #[test]
    fn test_umount_args_fusermount() {
        let tools = MountTools {
            mount: "/sbin/mount".into(),
            umount: "/bin/fusermount".into(),
        };
        assert_eq!(
            tools.umount_args(Path::new("/mnt/zip")),
            [OsString::from("-u"), OsString::from("/mnt/zip")]
        );
    }

    #[test]
    fn test_first_existing() {
        let dir = crate::test::tempdir();
        let present = crate::test::write_fixture(dir.path(), "mount", b"");
        let missing = dir.path().join("nope");

        let candidates = [missing.to_str().unwrap(), present.to_str().unwrap()];
        assert_eq!(first_existing(&candidates), Some(present));
        assert_eq!(first_existing(&[missing.to_str().unwrap()]), None);
    }
}
