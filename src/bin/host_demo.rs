//! Small host-side demo driving `BackendSelector`/`SharedSurfaceSession`
//! end-to-end, for manual smoke-testing and CI: spawns the helper, captures
//! for a fixed duration, and reports how many frames it saw per backend.

use std::time::{Duration, Instant};

use clap::Parser;
use sunshine_wgc::{d3d11, BackendSelector, CapturePolicy, CaptureResult, DxgiPlaceholderBackend, WgcBackend};

#[derive(Parser, Debug)]
#[command(name = "host_demo")]
struct Args {
    /// GDI device name of the monitor to capture, e.g. `\\.\DISPLAY1`. Empty
    /// selects the primary monitor.
    #[arg(long, default_value = "")]
    display: String,

    /// Capture in HDR (RGBA16F) instead of SDR (BGRA8).
    #[arg(long)]
    hdr: bool,

    /// How long to capture before exiting.
    #[arg(long, default_value_t = 10)]
    duration_secs: u64,

    /// Path to the wgc_helper binary. Defaults to the sibling of this
    /// executable.
    #[arg(long)]
    helper_path: Option<String>,
}

fn default_helper_path() -> anyhow::Result<String> {
    let exe = std::env::current_exe()?;
    let dir = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("current exe has no parent directory"))?;
    let helper = dir.join(if cfg!(windows) { "wgc_helper.exe" } else { "wgc_helper" });
    Ok(helper.to_string_lossy().into_owned())
}

fn main() -> anyhow::Result<()> {
    sunshine_wgc::logging::init_logging();
    let args = Args::parse();

    let helper_path = match args.helper_path {
        Some(p) => p,
        None => default_helper_path()?,
    };

    let policy = if args.hdr { CapturePolicy::Hdr } else { CapturePolicy::Sdr };
    let d3d_ctx = d3d11::create_d3d11_device()?;

    let wgc = WgcBackend::new(d3d_ctx.device.clone(), helper_path, args.display, policy, 1);
    let dxgi = DxgiPlaceholderBackend::new();
    let mut selector = BackendSelector::new(wgc, dxgi);

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let mut frames = 0u64;
    let mut errors = 0u64;

    while Instant::now() < deadline {
        let snapshot = selector.acquire();
        match snapshot.result {
            CaptureResult::Ok => frames += 1,
            CaptureResult::Timeout => {}
            CaptureResult::Reinit => log::warn!("session requested reinit"),
            CaptureResult::Error => errors += 1,
            CaptureResult::Interrupted => break,
            CaptureResult::SwapCapture => log::warn!("active backend is now {}", selector.active_backend_name()),
        }
        selector.release();
    }

    log::info!("host_demo finished: {frames} frames captured, {errors} errors");
    Ok(())
}
