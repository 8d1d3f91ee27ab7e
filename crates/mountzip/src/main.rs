//! Mount a regular Zip file or a libzipfs combo (exe+Zip+footer) file's Zip
//! content at the requested mount point.  Combo files are detected
//! automatically by their trailing footer.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, select};
use signal_hook::{consts::SIGINT, iterator::Signals};

use libzipfs::{footer::read_footer, mount::FuseZipFs};

#[derive(Debug, Parser)]
#[clap(name = "mountzip", version)]
struct Args {
    /// Path to the Zip file (or combo exe+Zip+footer file) to mount
    #[clap(long)]
    zip: PathBuf,

    /// Directory to fuse-mount the Zip file on
    #[clap(long)]
    mnt: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if !args.zip.is_file() {
        bail!("--zip path '{}' not found", args.zip.display());
    }
    if !args.mnt.is_dir() {
        bail!("--mnt mount path '{}' not found", args.mnt.display());
    }

    // A combo file carries its zip region's location in its footer; anything
    // that fails footer validation mounts as a plain zip from byte 0.
    let (offset, length, footer_len) = match read_footer(&args.zip) {
        Ok((_, footer, _file)) => (
            footer.executable_length.get(),
            footer.zipfile_length.get(),
            footer.footer_length.get(),
        ),
        Err(err) => {
            log::debug!(
                "'{}' is not a combo file ({err}); mounting as a plain zip",
                args.zip.display()
            );
            (0, 0, 0)
        }
    };

    let session = FuseZipFs::new(&args.zip, &args.mnt, offset, length, footer_len);
    session
        .start()
        .context("could not start serving fuse requests")?;

    println!(
        "Zip file '{}' mounted at directory '{}'. [press ctrl-c to exit and unmount]",
        args.zip.display(),
        session.mountpoint().display(),
    );

    let mut signals = Signals::new([SIGINT])?;
    let (sigint_tx, sigint_rx) = bounded::<()>(1);
    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            let _ = sigint_tx.send(());
        }
    });

    let done = session.done();
    select! {
        recv(sigint_rx) -> _ => (),
        // closes if someone force-unmounts the filesystem from under us
        recv(done) -> _ => (),
    }

    session.stop().context("error while shutting down")?;
    Ok(())
}
