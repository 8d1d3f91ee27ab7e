//! Combine an executable and a zipfile into a single combo file, or split a
//! combo file back into its parts.
//!
//! The combo layout is `<executable> || <zipfile> || <256-byte footer>`; the
//! footer records the length and BLAKE2 checksum of every region so that
//! mounting and splitting can verify what they read.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use libzipfs::{
    combiner::{combine, CombinerConfig},
    splitter::split,
};

#[derive(Debug, Parser)]
#[clap(name = "libzipfs-combiner", version)]
struct Args {
    /// Path to the executable file
    #[clap(long)]
    exe: PathBuf,

    /// Path to the zipfile to embed
    #[clap(long)]
    zip: PathBuf,

    /// Path to the combined output file to be written (or split if --split
    /// is given)
    #[clap(short, long)]
    output: PathBuf,

    /// Split the output file back apart instead of combining
    #[clap(long)]
    split: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let cfg = CombinerConfig {
        executable_path: args.exe,
        zipfile_path: args.zip,
        output_path: args.output,
        split: args.split,
    };
    cfg.validate()?;

    if cfg.split {
        let footer = split(&cfg)?;
        println!(
            "split '{}' into '{}' ({} bytes) and '{}' ({} bytes); content checksums verified",
            cfg.output_path.display(),
            cfg.executable_path.display(),
            footer.executable_length.get(),
            cfg.zipfile_path.display(),
            footer.zipfile_length.get(),
        );
    } else {
        let footer = combine(&cfg)?;
        println!(
            "combined '{}' ({} bytes) and '{}' ({} bytes) into '{}'",
            cfg.executable_path.display(),
            footer.executable_length.get(),
            cfg.zipfile_path.display(),
            footer.zipfile_length.get(),
            cfg.output_path.display(),
        );
    }

    Ok(())
}
