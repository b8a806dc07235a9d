//! Helper-process entry point: connects back to the host process that
//! spawned it and runs the WGC capture loop until the host disconnects.
//! Grounded on
//! `examples/original_source/src/platform/windows/wgc/wgc_capture_process.cpp`'s
//! `main` for the overall shape (handshake, then capture until disconnect).

use clap::Parser;

/// Windows Graphics Capture helper process for the out-of-process capture
/// subsystem. Not meant to be launched by hand; the host process spawns it
/// with `--parent-pid` set to its own process id.
#[derive(Parser, Debug)]
#[command(name = "wgc_helper")]
struct Args {
    /// Process id of the host that spawned this helper and owns the
    /// well-known handshake pipe.
    #[arg(long)]
    parent_pid: u32,
}

fn main() -> anyhow::Result<()> {
    sunshine_wgc::logging::init_logging();
    let args = Args::parse();

    log::info!("wgc_helper starting for parent pid {}", args.parent_pid);
    match sunshine_wgc::helper::run(args.parent_pid) {
        Ok(()) => {
            log::info!("wgc_helper exiting normally");
            Ok(())
        }
        Err(e) => {
            log::error!("wgc_helper exiting with error: {e:#}");
            Err(e)
        }
    }
}
