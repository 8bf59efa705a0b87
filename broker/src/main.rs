//! Debug front end for the device broker. Start it with enough privilege to
//! open the requested devices; the foreground process drops to the real
//! uid/gid right after the fork, exactly like the display server does.

use std::os::fd::AsRawFd;
use std::path::PathBuf;

use anyhow::Context as _;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "veldt-broker", about = "privilege-separated device broker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Ask the broker for a device descriptor and report what came back.
    Open {
        /// Device node to open, e.g. /dev/dri/card0 or /dev/input/event3.
        path: PathBuf,
        /// Open read-write instead of read-only.
        #[arg(long)]
        rw: bool,
        /// Add O_NONBLOCK, the way the input stack opens evdev nodes.
        #[arg(long)]
        nonblock: bool,
    },
    /// Start VT session relay and print switch events until interrupted.
    Watch,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut handle = veldt_broker::spawn().context("failed to start the device broker")?;

    match cli.command {
        Command::Open { path, rw, nonblock } => {
            let mut flags = libc::O_CLOEXEC | if rw { libc::O_RDWR } else { libc::O_RDONLY };
            if nonblock {
                flags |= libc::O_NONBLOCK;
            }
            let fd = handle
                .open(&path, flags)
                .with_context(|| format!("broker refused {}", path.display()))?;
            println!("{} -> fd {}", path.display(), fd.as_raw_fd());
        }
        Command::Watch => {
            handle
                .tty_init(
                    || println!("session activated"),
                    || println!("session deactivated"),
                )
                .context("vt session setup")?;
            loop {
                let event = handle.dispatch_relay().context("relay dispatch")?;
                tracing::debug!(?event, "relay event");
            }
        }
    }

    handle.deinit();
    Ok(())
}
