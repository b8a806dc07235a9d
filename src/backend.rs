//! C6 host half: the `CaptureBackend` abstraction the encoder drives, and the
//! `BackendSelector` that switches between the WGC out-of-process path and a
//! DXGI Desktop Duplication fallback on secure-desktop transitions. No corpus
//! file implements DXGI duplication itself (out of scope, spec.md §1
//! non-goal: "the DXGI capture path itself is an external collaborator, not
//! reimplemented here") — `DxgiPlaceholderBackend` is the seam a real
//! implementation plugs into; the selector's hysteresis is what this crate
//! owns.

use std::cell::Cell;
use std::time::{Duration, Instant};

use log::{info, warn};
use windows::Win32::Graphics::Direct3D11::{ID3D11Device, ID3D11Texture2D};

use crate::capture::CapturePolicy;
use crate::error::CaptureResult;
use crate::misc::is_secure_desktop_active;
use crate::session::SharedSurfaceSession;

const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);
/// Minimum time a backend must run before the selector will swap again, so a
/// single flaky frame can't bounce WGC/DXGI back and forth every acquire.
const SWAP_HYSTERESIS: Duration = Duration::from_secs(2);
/// How often `DxgiPlaceholderBackend::wants_swap` re-checks the secure
/// desktop state; the check walks a process snapshot, so it's not done on
/// every `acquire`.
const SECURE_DESKTOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A single frame handed to the encoder: the GPU texture plus the result code
/// describing how it was obtained.
pub struct CaptureSnapshot {
    pub result: CaptureResult,
    pub texture: Option<ID3D11Texture2D>,
}

/// Abstraction over "a thing that can hand the encoder frames". Exactly one
/// backend holds the display lock at a time (spec §3); switching backends
/// never happens mid-frame, only between `acquire`/`release` pairs.
pub trait CaptureBackend {
    fn acquire(&mut self, timeout: Duration) -> CaptureSnapshot;
    fn release(&mut self);
    /// True once this backend has signalled it can no longer safely capture
    /// (e.g. WGC on a secure desktop) and the selector should swap away.
    fn wants_swap(&self) -> bool;
    fn name(&self) -> &'static str;
}

/// Wraps the out-of-process WGC session behind the `CaptureBackend` seam.
pub struct WgcBackend {
    session: SharedSurfaceSession,
}

impl WgcBackend {
    pub fn new(device: ID3D11Device, helper_path: String, display_name: String, policy: CapturePolicy, log_level: i32) -> Self {
        Self {
            session: SharedSurfaceSession::new(device, helper_path, display_name, policy, log_level),
        }
    }
}

impl CaptureBackend for WgcBackend {
    fn acquire(&mut self, timeout: Duration) -> CaptureSnapshot {
        let (result, texture) = self.session.acquire(timeout);
        CaptureSnapshot { result, texture }
    }

    fn release(&mut self) {
        self.session.release();
    }

    fn wants_swap(&self) -> bool {
        self.session.should_swap_to_dxgi()
    }

    fn name(&self) -> &'static str {
        "wgc"
    }
}

/// Stand-in for a DXGI Desktop Duplication backend: the selector swaps to
/// this whenever WGC reports a secure-desktop transition, but actual
/// duplication-API frame production is outside this crate's scope (spec.md
/// non-goal). `acquire` always returns `CaptureResult::SwapCapture` on its
/// first call to signal "this placeholder cannot itself deliver frames", so
/// a real implementation is the only thing standing between this and a live
/// fallback path.
pub struct DxgiPlaceholderBackend {
    announced: bool,
    last_secure_desktop_check: Cell<Instant>,
    secure_desktop_gone: Cell<bool>,
}

impl DxgiPlaceholderBackend {
    pub fn new() -> Self {
        Self {
            announced: false,
            last_secure_desktop_check: Cell::new(Instant::now() - SECURE_DESKTOP_POLL_INTERVAL),
            secure_desktop_gone: Cell::new(false),
        }
    }
}

impl Default for DxgiPlaceholderBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for DxgiPlaceholderBackend {
    fn acquire(&mut self, _timeout: Duration) -> CaptureSnapshot {
        if !self.announced {
            warn!("DXGI fallback backend selected but not implemented by this crate");
            self.announced = true;
        }
        CaptureSnapshot {
            result: CaptureResult::SwapCapture,
            texture: None,
        }
    }

    fn release(&mut self) {}

    fn wants_swap(&self) -> bool {
        if self.last_secure_desktop_check.get().elapsed() >= SECURE_DESKTOP_POLL_INTERVAL {
            self.last_secure_desktop_check.set(Instant::now());
            self.secure_desktop_gone.set(!is_secure_desktop_active());
        }
        self.secure_desktop_gone.get()
    }

    fn name(&self) -> &'static str {
        "dxgi-placeholder"
    }
}

/// Drives a single active `CaptureBackend`, swapping to the other backend
/// only between acquire/release pairs and only after `SWAP_HYSTERESIS` has
/// elapsed since the last swap, per spec §3's "at most one backend holds the
/// display lock; switches are driven by explicit signals, never mid-frame".
pub struct BackendSelector {
    wgc: WgcBackend,
    dxgi: DxgiPlaceholderBackend,
    active_is_wgc: bool,
    last_swap: Instant,
    #[cfg(test)]
    force_swap_requested: bool,
}

impl BackendSelector {
    pub fn new(wgc: WgcBackend, dxgi: DxgiPlaceholderBackend) -> Self {
        Self {
            wgc,
            dxgi,
            active_is_wgc: true,
            last_swap: Instant::now(),
            #[cfg(test)]
            force_swap_requested: false,
        }
    }

    fn active_name(&self) -> &'static str {
        if self.active_is_wgc {
            self.wgc.name()
        } else {
            self.dxgi.name()
        }
    }

    fn maybe_swap(&mut self) {
        #[cfg(test)]
        let forced = std::mem::take(&mut self.force_swap_requested);
        #[cfg(not(test))]
        let forced = false;

        let wants_swap = if self.active_is_wgc {
            self.wgc.wants_swap()
        } else {
            self.dxgi.wants_swap()
        };

        if (wants_swap || forced) && self.last_swap.elapsed() >= SWAP_HYSTERESIS {
            self.active_is_wgc = !self.active_is_wgc;
            self.last_swap = Instant::now();
            info!("capture backend swapped to {}", self.active_name());
        }
    }

    /// Debug-only hook for exercising the swap path without waiting on a real
    /// secure-desktop transition. Never reachable from production code.
    #[cfg(test)]
    pub fn force_swap(&mut self) {
        self.force_swap_requested = true;
    }

    /// Acquires a frame from whichever backend is currently active, checking
    /// for a pending swap first (between-frame, never mid-acquire).
    pub fn acquire(&mut self) -> CaptureSnapshot {
        self.maybe_swap();

        if self.active_is_wgc {
            self.wgc.acquire(ACQUIRE_TIMEOUT)
        } else {
            self.dxgi.acquire(ACQUIRE_TIMEOUT)
        }
    }

    pub fn release(&mut self) {
        if self.active_is_wgc {
            self.wgc.release();
        } else {
            self.dxgi.release();
        }
    }

    pub fn active_backend_name(&self) -> &'static str {
        self.active_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dxgi_placeholder_reports_swap_capture_and_never_panics() {
        let mut backend = DxgiPlaceholderBackend::new();
        let snapshot = backend.acquire(Duration::from_millis(10));
        assert_eq!(snapshot.result, CaptureResult::SwapCapture);
        assert!(snapshot.texture.is_none());
        backend.release();
    }
}
