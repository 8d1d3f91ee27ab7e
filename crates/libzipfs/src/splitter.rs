//! Splitting a combo file back into its executable and zipfile.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::{
    combiner::CombinerConfig,
    digest::{first_difference, hash_file},
    footer::{reify_footer, Footer, FooterError},
};

/// Splitting failed.
#[derive(Error, Debug)]
pub enum SplitError {
    #[error("'{path}' is not a valid combo file: {source}")]
    Footer {
        path: PathBuf,
        #[source]
        source: FooterError,
    },
    #[error("{region} region of '{path}' ended after {copied} of {expected} bytes")]
    Truncated {
        region: &'static str,
        path: PathBuf,
        expected: i64,
        copied: i64,
    },
    #[error(
        "{region} content split out to '{path}' does not match the footer's \
         blake2 checksum (first difference at byte {index})"
    )]
    ChecksumMismatch {
        region: &'static str,
        path: PathBuf,
        index: usize,
    },
    #[error("splitter error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_ctx(path: &Path) -> impl FnOnce(io::Error) -> SplitError + '_ {
    move |source| SplitError::Io {
        path: path.to_owned(),
        source,
    }
}

/// Split `cfg.output_path` into `cfg.executable_path` and `cfg.zipfile_path`.
///
/// The trailing footer is reified and put through the inexpensive checks
/// (magic markers, self-checksum, length arithmetic) before either content
/// region is streamed back out, so corrupt combos fail without reading a
/// large executable prefix.  Both outputs are then re-hashed and compared
/// against the footer's content digests.
///
/// Returns the recovered footer.
pub fn split(cfg: &CombinerConfig) -> Result<Footer, SplitError> {
    let combo_path = &cfg.output_path;
    let (footer_start, footer, mut combo) = reify_footer(combo_path).map_err(|source| {
        SplitError::Footer {
            path: combo_path.to_owned(),
            source,
        }
    })?;

    if let Err(source) = footer.inexpensive_checks(footer_start) {
        log::debug!("reified footer from '{}' failed validation: {footer:?}", combo_path.display());
        return Err(SplitError::Footer {
            path: combo_path.to_owned(),
            source,
        });
    }

    combo
        .seek(SeekFrom::Start(0))
        .map_err(io_ctx(combo_path))?;
    copy_region(
        &mut combo,
        combo_path,
        &cfg.executable_path,
        "executable",
        footer.executable_length.get(),
    )?;
    copy_region(
        &mut combo,
        combo_path,
        &cfg.zipfile_path,
        "zipfile",
        footer.zipfile_length.get(),
    )?;

    for (path, region, expected) in [
        (&cfg.executable_path, "executable", &footer.executable_digest),
        (&cfg.zipfile_path, "zipfile", &footer.zipfile_digest),
    ] {
        let (actual, _) = hash_file(path).map_err(io_ctx(path))?;
        if let Some(index) = first_difference(&actual, expected) {
            return Err(SplitError::ChecksumMismatch {
                region,
                path: path.to_owned(),
                index,
            });
        }
    }

    Ok(footer)
}

/// Stream exactly `expected` bytes from the combo's current position into a
/// freshly-created file at `path`.
fn copy_region(
    combo: &mut File,
    combo_path: &Path,
    path: &Path,
    region: &'static str,
    expected: i64,
) -> Result<(), SplitError> {
    let mut output = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(io_ctx(path))?;

    let copied = io::copy(&mut combo.by_ref().take(expected as u64), &mut output)
        .map_err(io_ctx(combo_path))? as i64;
    match copied == expected {
        true => Ok(()),
        false => Err(SplitError::Truncated {
            region,
            path: combo_path.to_owned(),
            expected,
            copied,
        }),
    }
}
