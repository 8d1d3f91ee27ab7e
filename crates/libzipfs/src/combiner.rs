//! Combining an executable and a zipfile into a combo file.
//!
//! The combiner appends a zipfile to an executable and further appends the
//! 256-byte footer describing the combination.  The mount side looks for
//! this footer to determine where the internal zip filesystem starts.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use rustix::fs::Mode;
use thiserror::Error;

use crate::{digest::hash_file, footer::Footer};

/// Paths for a combine or split operation.
#[derive(Debug, Clone, Default)]
pub struct CombinerConfig {
    /// The executable file: input when combining, output when splitting.
    pub executable_path: PathBuf,
    /// The zipfile to embed: input when combining, output when splitting.
    pub zipfile_path: PathBuf,
    /// The combined file: output when combining, input when splitting.
    pub output_path: PathBuf,
    /// Split the combined file back apart instead of combining.
    pub split: bool,
}

/// A path precondition did not hold for the requested mode.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{flag} path '{path}' not found")]
    Missing { flag: &'static str, path: PathBuf },
    #[error("--output path '{path}' not found for splitting")]
    ComboMissing { path: PathBuf },
    #[error("{flag} path '{path}' found but should not exist yet")]
    SplitTargetExists { flag: &'static str, path: PathBuf },
    #[error("--output path '{path}' already exists but should not")]
    OutputExists { path: PathBuf },
}

/// Combining failed.
#[derive(Error, Debug)]
pub enum CombineError {
    #[error("{region} region is {actual} bytes but the footer records {expected}")]
    LengthChanged {
        region: &'static str,
        expected: i64,
        actual: i64,
    },
    #[error("combiner error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CombinerConfig {
    /// Check that the inputs exist and the output doesn't (or the reverse,
    /// when splitting).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let parts = [
            ("--exe", &self.executable_path),
            ("--zip", &self.zipfile_path),
        ];

        if self.split {
            for (flag, path) in parts {
                if path.exists() {
                    return Err(ConfigError::SplitTargetExists {
                        flag,
                        path: path.clone(),
                    });
                }
            }
            if !self.output_path.exists() {
                return Err(ConfigError::ComboMissing {
                    path: self.output_path.clone(),
                });
            }
        } else {
            for (flag, path) in parts {
                if !path.exists() {
                    return Err(ConfigError::Missing {
                        flag,
                        path: path.clone(),
                    });
                }
            }
            if self.output_path.exists() {
                return Err(ConfigError::OutputExists {
                    path: self.output_path.clone(),
                });
            }
        }

        Ok(())
    }
}

fn io_ctx(path: &Path) -> impl FnOnce(io::Error) -> CombineError + '_ {
    move |source| CombineError::Io {
        path: path.to_owned(),
        source,
    }
}

/// Build `cfg.output_path` as `executable || zipfile || footer`.
///
/// Hashing both inputs up front lets the footer ship with the output in one
/// streaming pass; the copy counts are then checked against the recorded
/// lengths so truncation, racing writers, or filesystem bugs fail loudly
/// instead of producing a silently-corrupt combo.  The output is marked
/// executable (0755).
///
/// Returns the footer that was written.
pub fn combine(cfg: &CombinerConfig) -> Result<Footer, CombineError> {
    let exe_size = cfg
        .executable_path
        .metadata()
        .map_err(io_ctx(&cfg.executable_path))?
        .len() as i64;
    let zip_size = cfg
        .zipfile_path
        .metadata()
        .map_err(io_ctx(&cfg.zipfile_path))?
        .len() as i64;

    let (exe_digest, exe_len) =
        hash_file(&cfg.executable_path).map_err(io_ctx(&cfg.executable_path))?;
    let (zip_digest, zip_len) = hash_file(&cfg.zipfile_path).map_err(io_ctx(&cfg.zipfile_path))?;

    let footer = Footer::for_parts(exe_len as i64, exe_digest, zip_len as i64, zip_digest);
    log::debug!(
        "combining '{}' ({exe_len} bytes) and '{}' ({zip_len} bytes) into '{}'",
        cfg.executable_path.display(),
        cfg.zipfile_path.display(),
        cfg.output_path.display(),
    );

    // sanity check the stat sizes against what we just hashed
    if exe_size != footer.executable_length.get() {
        return Err(CombineError::LengthChanged {
            region: "executable",
            expected: footer.executable_length.get(),
            actual: exe_size,
        });
    }
    if zip_size != footer.zipfile_length.get() {
        return Err(CombineError::LengthChanged {
            region: "zipfile",
            expected: footer.zipfile_length.get(),
            actual: zip_size,
        });
    }

    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&cfg.output_path)
        .map_err(io_ctx(&cfg.output_path))?;

    let mut copy_region = |path: &Path, region, expected: i64| -> Result<(), CombineError> {
        let mut input = File::open(path).map_err(io_ctx(path))?;
        let copied = io::copy(&mut input, &mut output).map_err(io_ctx(&cfg.output_path))? as i64;
        match copied == expected {
            true => Ok(()),
            false => Err(CombineError::LengthChanged {
                region,
                expected,
                actual: copied,
            }),
        }
    };

    copy_region(
        &cfg.executable_path,
        "executable",
        footer.executable_length.get(),
    )?;
    copy_region(&cfg.zipfile_path, "zipfile", footer.zipfile_length.get())?;

    output
        .write_all(&footer.encode())
        .map_err(io_ctx(&cfg.output_path))?;
    drop(output);

    rustix::fs::chmod(&cfg.output_path, Mode::from_raw_mode(0o755))
        .map_err(|errno| io_ctx(&cfg.output_path)(errno.into()))?;

    Ok(footer)
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::PermissionsExt;

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        footer::FOOTER_LEN,
        test::{write_fixture, CombinedFixture},
    };

    #[test]
    fn test_combine_layout() {
        let fixture = CombinedFixture::create();
        let footer = &fixture.footer;

        assert_eq!(footer.executable_length.get() as usize, fixture.exe.len());
        assert_eq!(footer.zipfile_length.get() as usize, fixture.zip.len());
        assert_eq!(footer.footer_length.get() as usize, FOOTER_LEN);
        assert_eq!(footer.self_checksum(), footer.footer_digest);

        let combined = std::fs::read(&fixture.cfg.output_path).unwrap();
        assert_eq!(
            combined.len(),
            fixture.exe.len() + fixture.zip.len() + FOOTER_LEN
        );
        assert_eq!(&combined[..fixture.exe.len()], &fixture.exe[..]);
        assert_eq!(
            &combined[fixture.exe.len()..fixture.exe.len() + fixture.zip.len()],
            &fixture.zip[..]
        );
        assert_eq!(
            &combined[fixture.exe.len() + fixture.zip.len()..],
            &footer.encode()[..]
        );
    }

    #[test]
    fn test_combine_marks_output_executable() {
        let fixture = CombinedFixture::create();
        let mode = std::fs::metadata(&fixture.cfg.output_path)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o7777, 0o755);
    }

    #[test]
    fn test_combine_refuses_existing_output() {
        let fixture = CombinedFixture::create();
        // the output now exists; a second combine must not clobber it
        assert!(matches!(
            combine(&fixture.cfg),
            Err(CombineError::Io { .. })
        ));
    }

    #[test]
    fn test_validate_combine_mode() {
        let dir = crate::test::tempdir();
        let exe = write_fixture(dir.path(), "exe", b"binary");
        let zip = write_fixture(dir.path(), "hi.zip", b"ziplike");

        let mut cfg = CombinerConfig {
            executable_path: exe,
            zipfile_path: zip,
            output_path: dir.path().join("combo"),
            split: false,
        };
        cfg.validate().unwrap();

        // a pre-existing output is rejected
        write_fixture(dir.path(), "combo", b"");
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::OutputExists { .. }));
        assert!(err.to_string().ends_with("already exists but should not"));

        // a missing input is rejected
        cfg.output_path = dir.path().join("combo2");
        cfg.executable_path = dir.path().join("nope");
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Missing { flag: "--exe", .. }));
        assert!(err.to_string().ends_with("not found"));
    }

    #[test]
    fn test_validate_split_mode() {
        let dir = crate::test::tempdir();

        let cfg = CombinerConfig {
            executable_path: dir.path().join("exe.out"),
            zipfile_path: dir.path().join("zip.out"),
            output_path: dir.path().join("combo"),
            split: true,
        };

        // the combo to split must exist
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ComboMissing { .. }));
        assert!(err.to_string().ends_with("not found for splitting"));

        write_fixture(dir.path(), "combo", b"whatever");
        cfg.validate().unwrap();

        // outputs of the split must not exist yet
        write_fixture(dir.path(), "exe.out", b"");
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::SplitTargetExists { flag: "--exe", .. }
        ));
        assert!(err.to_string().ends_with("found but should not exist yet"));
    }
}
