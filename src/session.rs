//! C5: shared-surface session, the heart of the system. Owns the host-side
//! view of the shared texture, drives the keyed-mutex handshake, and gives
//! the encoder a blocking acquire/release interface. Grounded on
//! `examples/original_source/src/platform/windows/ipc/ipc_session.{h,cpp}`
//! (`ipc_session_t::lazy_init`/`acquire`/`release`/`setup_shared_texture`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info, warn};
use windows::core::{Interface, PCWSTR};
use windows::Win32::Foundation::HRESULT;
use windows::Win32::Graphics::Direct3D11::{ID3D11Device, ID3D11Texture2D};
use windows::Win32::Graphics::Dxgi::IDXGIKeyedMutex;
use windows::Win32::Media::Multimedia::AvSetMmThreadCharacteristicsW;
use windows::Win32::System::Threading::{
    GetCurrentThread, SetThreadPriority, THREAD_PRIORITY_HIGHEST,
};

use crate::capture::CapturePolicy;
use crate::d3d11;
use crate::error::{CaptureResult, SessionError};
use crate::handshake::host_handshake;
use crate::misc::{current_process_id, qpc_micros, qpc_now};
use crate::process::HelperProcess;
use crate::wire::{AdapterLuid, HelperConfig, SharedHandleData, MSG_HEARTBEAT};

const HANDLE_WAIT_TIMEOUT: Duration = Duration::from_secs(3);
const HANDLE_POLL_INTERVAL: Duration = Duration::from_millis(5);
const MUTEX_ACQUIRE_TIMEOUT_MS: u32 = 200;
const FRAME_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(1);
const HEARTBEAT_SEND_TIMEOUT: Duration = Duration::from_millis(500);
const TIMING_LOG_INTERVAL: u32 = 150;

// DXGI keyed-mutex AcquireSync returns these as raw HRESULT values, not
// HRESULT_FROM_WIN32-wrapped win32 codes. Both are non-negative, so the
// `windows` crate's `Result`-wrapped `AcquireSync` treats them as `Ok(())`
// indistinguishably from `S_OK`; `acquire_sync_raw` below sidesteps that by
// returning the unwrapped code.
const DXGI_WAIT_ABANDONED: i32 = 0x0000_0080;
const DXGI_WAIT_TIMEOUT_HR: i32 = 0x0000_0102;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcquireOutcome {
    Ok,
    Abandoned,
    TimedOut,
    Failed,
}

/// Classifies a raw `AcquireSync` `HRESULT`. Pulled out of `acquire` so the
/// abandoned/timed-out/failed paths can be tested without a real keyed
/// mutex.
fn classify_acquire_sync(hr: HRESULT) -> AcquireOutcome {
    match hr.0 {
        DXGI_WAIT_ABANDONED => AcquireOutcome::Abandoned,
        DXGI_WAIT_TIMEOUT_HR => AcquireOutcome::TimedOut,
        code if code >= 0 => AcquireOutcome::Ok,
        _ => AcquireOutcome::Failed,
    }
}

thread_local! {
    static MMCSS_INITIALIZED: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

struct HandshakeState {
    frame_ready: Arc<AtomicBool>,
    should_swap_to_dxgi: Arc<AtomicBool>,
    force_reinit: Arc<AtomicBool>,
}

/// Host-side shared-surface session. One instance per capture lifetime; call
/// [`SharedSurfaceSession::acquire`]/[`release`](Self::release) in strict
/// alternation from a single encoder thread.
pub struct SharedSurfaceSession {
    device: ID3D11Device,
    helper_path: String,
    display_name: String,
    policy: CapturePolicy,
    log_level: i32,

    helper: Option<HelperProcess>,
    pipe: Option<crate::async_loop::AsyncNamedPipe>,
    shared_texture: Option<ID3D11Texture2D>,
    keyed_mutex: Option<IDXGIKeyedMutex>,

    state: Option<HandshakeState>,
    initialized: bool,
    width: u32,
    height: u32,
    timeout_count: u32,
    acquire_count: u32,
}

impl SharedSurfaceSession {
    /// `device` is the host's own D3D11 device (already created, e.g. shared
    /// with the encoder); its adapter LUID is sent to the helper so it
    /// creates its device on the same physical GPU.
    pub fn new(device: ID3D11Device, helper_path: String, display_name: String, policy: CapturePolicy, log_level: i32) -> Self {
        Self {
            device,
            helper_path,
            display_name,
            policy,
            log_level,
            helper: None,
            pipe: None,
            shared_texture: None,
            keyed_mutex: None,
            state: None,
            initialized: false,
            width: 0,
            height: 0,
            timeout_count: 0,
            acquire_count: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn should_swap_to_dxgi(&self) -> bool {
        self.state
            .as_ref()
            .map(|s| s.should_swap_to_dxgi.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn should_reinit(&self) -> bool {
        self.state
            .as_ref()
            .map(|s| s.force_reinit.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Lazily spawns the helper, runs the handshake, transmits `HelperConfig`,
    /// and waits for `SharedHandleData`. Failure here is routine when the
    /// host has no interactive session (service mode) and is logged at
    /// `debug`, not `error` (spec §4.5).
    pub fn initialize_if_needed(&mut self) -> Result<(), SessionError> {
        if self.initialized {
            return Ok(());
        }

        match self.try_initialize() {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("shared-surface session init failed (expected in non-interactive sessions): {e}");
                self.cleanup();
                Err(e)
            }
        }
    }

    fn try_initialize(&mut self) -> Result<(), SessionError> {
        let dxgi_device: windows::Win32::Graphics::Dxgi::IDXGIDevice = self
            .device
            .cast()
            .map_err(|e| SessionError::Fatal(anyhow::anyhow!(e)))?;
        let host_luid = d3d11::adapter_luid(&dxgi_device).map_err(SessionError::Fatal)?;

        let parent_pid = current_process_id();
        let mut helper = HelperProcess::start(&self.helper_path, &parent_pid.to_string())
            .map_err(|_| SessionError::HandshakeFailed)?;

        let data_pipe = match host_handshake(parent_pid) {
            Ok(p) => p,
            Err(e) => {
                helper.terminate();
                return Err(e);
            }
        };

        let config = HelperConfig::new(
            self.policy.is_hdr(),
            self.log_level,
            &self.display_name,
            AdapterLuid::from(host_luid),
        );

        let frame_ready = Arc::new(AtomicBool::new(false));
        let should_swap_to_dxgi = Arc::new(AtomicBool::new(false));
        let force_reinit = Arc::new(AtomicBool::new(false));
        let shared_handle: Arc<Mutex<Option<SharedHandleData>>> = Arc::new(Mutex::new(None));

        let mut pipe = crate::async_loop::AsyncNamedPipe::new(data_pipe);
        if !pipe.send(config.as_bytes()) {
            helper.terminate();
            return Err(SessionError::HandshakeFailed);
        }

        {
            let frame_ready = Arc::clone(&frame_ready);
            let should_swap_to_dxgi = Arc::clone(&should_swap_to_dxgi);
            let shared_handle = Arc::clone(&shared_handle);

            pipe.start(
                Box::new(move |bytes| {
                    dispatch_message(bytes, &frame_ready, &should_swap_to_dxgi, &shared_handle);
                }),
                Box::new(|err| error!("shared-surface session pipe error: {err}")),
                Some({
                    let force_reinit = Arc::clone(&force_reinit);
                    Box::new(move || {
                        warn!("shared-surface session pipe broke, forcing reinit");
                        force_reinit.store(true, Ordering::Release);
                    })
                }),
            );
        }

        info!("waiting for shared handle data from helper process");
        let deadline = std::time::Instant::now() + HANDLE_WAIT_TIMEOUT;
        let handle_data = loop {
            if let Some(data) = shared_handle.lock().unwrap().take() {
                break Some(data);
            }
            if std::time::Instant::now() >= deadline {
                break None;
            }
            std::thread::sleep(HANDLE_POLL_INTERVAL);
        };

        let handle_data = match handle_data {
            Some(d) => d,
            None => {
                pipe.stop();
                helper.terminate();
                return Err(SessionError::HandshakeFailed);
            }
        };

        let (texture, keyed_mutex) = d3d11::open_shared_keyed_mutex_texture(&self.device, handle_data.handle())
            .map_err(SessionError::Fatal)?;

        // Inverse-mutex seed: the helper only ever acquires key 0 / releases
        // key 1. Without this unconditional seed release of key 2, the
        // helper's very first AcquireSync(0) would have nothing to acquire
        // against and the session would deadlock.
        unsafe {
            keyed_mutex
                .ReleaseSync(2)
                .context("seed ReleaseSync(2) failed")
                .map_err(SessionError::Fatal)?;
        }

        self.helper = Some(helper);
        self.pipe = Some(pipe);
        self.shared_texture = Some(texture);
        self.keyed_mutex = Some(keyed_mutex);
        self.width = handle_data.width;
        self.height = handle_data.height;
        self.state = Some(HandshakeState {
            frame_ready,
            should_swap_to_dxgi,
            force_reinit,
        });
        self.initialized = true;

        info!(
            "shared-surface session initialized: {}x{}",
            self.width, self.height
        );
        Ok(())
    }

    /// Blocking acquire. Returns `Ok` with the shared texture on success,
    /// `Timeout` if no frame arrived (or the mutex timed out), `Reinit` if
    /// the helper abandoned the mutex, `Error` on any other failure.
    pub fn acquire(&mut self, timeout: Duration) -> (CaptureResult, Option<ID3D11Texture2D>) {
        initialize_mmcss_for_thread();

        if self.initialize_if_needed().is_err() {
            return (CaptureResult::Error, None);
        }

        let (texture, keyed_mutex, state) = match (&self.shared_texture, &self.keyed_mutex, &self.state) {
            (Some(t), Some(m), Some(s)) => (t, m, s),
            _ => return (CaptureResult::Error, None),
        };

        let t0 = qpc_now();
        if !wait_for_frame(&state.frame_ready, timeout) {
            return (CaptureResult::Timeout, None);
        }
        let t1 = qpc_now();

        let hr = d3d11::acquire_sync_raw(keyed_mutex, 1, MUTEX_ACQUIRE_TIMEOUT_MS);
        let t2 = qpc_now();

        match classify_acquire_sync(hr) {
            AcquireOutcome::Ok => {
                self.timeout_count = 0;
                self.acquire_count = self.acquire_count.wrapping_add(1);
                if self.acquire_count % TIMING_LOG_INTERVAL == 0 {
                    info!(
                        "acquire timing - wait: {:.1}us, mutex: {:.1}us, total: {:.1}us",
                        qpc_micros(t1 - t0),
                        qpc_micros(t2 - t1),
                        qpc_micros(t2 - t0)
                    );
                }
                (CaptureResult::Ok, Some(texture.clone()))
            }
            AcquireOutcome::Abandoned => {
                error!("helper process abandoned the keyed mutex, forcing reinit");
                state.should_swap_to_dxgi.store(false, Ordering::Release);
                state.force_reinit.store(true, Ordering::Release);
                (CaptureResult::Reinit, None)
            }
            AcquireOutcome::TimedOut => {
                self.timeout_count += 1;
                (CaptureResult::Timeout, None)
            }
            AcquireOutcome::Failed => {
                error!("AcquireSync failed: {}", windows::core::Error::from(hr));
                (CaptureResult::Error, None)
            }
        }
    }

    /// Releases the keyed mutex with the host's key (2) and sends a
    /// heartbeat so the helper knows the session is still alive.
    pub fn release(&mut self) {
        if let Some(keyed_mutex) = &self.keyed_mutex {
            unsafe {
                if let Err(e) = keyed_mutex.ReleaseSync(2) {
                    warn!("ReleaseSync(2) failed: {e}");
                }
            }
        }

        if let Some(pipe) = &self.pipe {
            if pipe.is_connected() {
                let _ = pipe.send(&[MSG_HEARTBEAT]);
            }
        }
    }

    /// Tears down the helper process, pipe, and D3D11 resources. Called on
    /// init failure and on explicit reinit.
    pub fn cleanup(&mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            pipe.stop();
        }
        if let Some(mut helper) = self.helper.take() {
            helper.terminate();
        }
        self.shared_texture = None;
        self.keyed_mutex = None;
        self.state = None;
        self.width = 0;
        self.height = 0;
        self.initialized = false;
    }
}

impl Drop for SharedSurfaceSession {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn dispatch_message(
    bytes: &[u8],
    frame_ready: &AtomicBool,
    should_swap_to_dxgi: &AtomicBool,
    shared_handle: &Mutex<Option<SharedHandleData>>,
) {
    use crate::wire::{MSG_FRAME_READY, MSG_SECURE_DESKTOP};

    if bytes.len() == std::mem::size_of::<SharedHandleData>() {
        if let Some(data) = SharedHandleData::from_bytes(bytes) {
            info!(
                "received shared handle data: {}x{}",
                data.width, data.height
            );
            *shared_handle.lock().unwrap() = Some(data);
        }
        return;
    }

    if bytes.len() == 1 {
        match bytes[0] {
            MSG_FRAME_READY => frame_ready.store(true, Ordering::Release),
            MSG_SECURE_DESKTOP => {
                info!("WGC can no longer capture the screen due to secure desktop, swapping to DXGI");
                should_swap_to_dxgi.store(true, Ordering::Release);
            }
            _ => {}
        }
    }
}

fn wait_for_frame(frame_ready: &AtomicBool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    loop {
        if frame_ready.swap(false, Ordering::AcqRel) {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(FRAME_WAIT_POLL_INTERVAL);
    }
}

/// Raises the encoder thread's priority and registers it with MMCSS once, so
/// the acquire/release loop gets real-time-like scheduling (spec §4.5).
fn initialize_mmcss_for_thread() {
    MMCSS_INITIALIZED.with(|initialized| {
        if initialized.get() {
            return;
        }
        unsafe {
            let _ = SetThreadPriority(GetCurrentThread(), THREAD_PRIORITY_HIGHEST);
            let mut task_index = 0u32;
            let task_name: Vec<u16> = "Games\0".encode_utf16().collect();
            let _ = AvSetMmThreadCharacteristicsW(PCWSTR(task_name.as_ptr()), &mut task_index);
        }
        initialized.set(true);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{MSG_FRAME_READY, MSG_SECURE_DESKTOP};
    use windows::Win32::Foundation::HANDLE;

    #[test]
    fn classify_acquire_sync_recognizes_abandoned_mutex() {
        assert_eq!(
            classify_acquire_sync(HRESULT(DXGI_WAIT_ABANDONED)),
            AcquireOutcome::Abandoned
        );
    }

    #[test]
    fn classify_acquire_sync_recognizes_timeout() {
        assert_eq!(
            classify_acquire_sync(HRESULT(DXGI_WAIT_TIMEOUT_HR)),
            AcquireOutcome::TimedOut
        );
    }

    #[test]
    fn classify_acquire_sync_recognizes_success() {
        assert_eq!(classify_acquire_sync(HRESULT(0)), AcquireOutcome::Ok);
    }

    #[test]
    fn classify_acquire_sync_recognizes_genuine_failure() {
        // E_FAIL, a negative HRESULT distinct from the two positive wait codes.
        assert_eq!(
            classify_acquire_sync(HRESULT(0x8000_4005u32 as i32)),
            AcquireOutcome::Failed
        );
    }

    #[test]
    fn dispatch_message_sets_frame_ready_on_frame_ready_byte() {
        let frame_ready = AtomicBool::new(false);
        let should_swap = AtomicBool::new(false);
        let shared_handle = Mutex::new(None);

        dispatch_message(&[MSG_FRAME_READY], &frame_ready, &should_swap, &shared_handle);

        assert!(frame_ready.load(Ordering::Acquire));
        assert!(!should_swap.load(Ordering::Acquire));
    }

    #[test]
    fn dispatch_message_sets_swap_flag_on_secure_desktop_byte() {
        let frame_ready = AtomicBool::new(false);
        let should_swap = AtomicBool::new(false);
        let shared_handle = Mutex::new(None);

        dispatch_message(&[MSG_SECURE_DESKTOP], &frame_ready, &should_swap, &shared_handle);

        assert!(should_swap.load(Ordering::Acquire));
        assert!(!frame_ready.load(Ordering::Acquire));
    }

    #[test]
    fn dispatch_message_stores_shared_handle_data() {
        let frame_ready = AtomicBool::new(false);
        let should_swap = AtomicBool::new(false);
        let shared_handle = Mutex::new(None);
        let data = SharedHandleData::new(HANDLE(0x1234 as *mut std::ffi::c_void), 1920, 1080);

        dispatch_message(data.as_bytes(), &frame_ready, &should_swap, &shared_handle);

        let stored = shared_handle.lock().unwrap();
        assert_eq!(stored.as_ref().unwrap().width, 1920);
        assert_eq!(stored.as_ref().unwrap().height, 1080);
    }

    #[test]
    fn dispatch_message_ignores_unknown_single_byte() {
        let frame_ready = AtomicBool::new(false);
        let should_swap = AtomicBool::new(false);
        let shared_handle = Mutex::new(None);

        dispatch_message(&[0xFF], &frame_ready, &should_swap, &shared_handle);

        assert!(!frame_ready.load(Ordering::Acquire));
        assert!(!should_swap.load(Ordering::Acquire));
    }

    #[test]
    fn wait_for_frame_returns_true_and_clears_flag_when_already_set() {
        let frame_ready = AtomicBool::new(true);
        assert!(wait_for_frame(&frame_ready, Duration::from_millis(50)));
        assert!(!frame_ready.load(Ordering::Acquire));
    }

    #[test]
    fn wait_for_frame_times_out_when_never_set() {
        let frame_ready = AtomicBool::new(false);
        let start = std::time::Instant::now();
        assert!(!wait_for_frame(&frame_ready, Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
