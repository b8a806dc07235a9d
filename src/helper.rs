//! C6 helper half: the WGC capture loop run inside the spawned helper
//! process. Grounded on
//! `examples/original_source/src/platform/windows/wgc/wgc_capture_process.cpp`
//! (`main`'s handshake-then-capture sequence, the
//! `AcquireSync(0)`/`CopyResource`/`ReleaseSync(1)` frame publish, the
//! `DesktopSwitchHookProc`/`IsSecureDesktop` detection, and the
//! `PeekMessageW` pump keeping the event hook alive). The hook context that
//! file keeps as process-globals (`g_communication_pipe`,
//! `g_secure_desktop_detected`) is `thread_local` here instead, confined to
//! the single thread that installs the hook and pumps messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use windows::Win32::Foundation::HWND;
use windows::Win32::UI::Accessibility::{SetWinEventHook, UnhookWinEvent, HWINEVENTHOOK};
use windows::Win32::UI::WindowsAndMessaging::{
    DispatchMessageW, PeekMessageW, TranslateMessage, EVENT_SYSTEM_DESKTOPSWITCH, MSG, PM_REMOVE,
    WINEVENT_OUTOFCONTEXT, WINEVENT_SKIPOWNPROCESS,
};

use crate::async_loop::AsyncNamedPipe;
use crate::capture::{self, enable_dpi_awareness, CapturePolicy};
use crate::d3d11;
use crate::handshake::helper_handshake;
use crate::wire::{HelperConfig, SharedHandleData, MSG_FRAME_READY, MSG_HEARTBEAT, MSG_SECURE_DESKTOP};

const CONFIG_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(100);
const FRAME_WAIT_TIMEOUT_MS: u32 = 1000;
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_PUMP_SLEEP: Duration = Duration::from_millis(10);

thread_local! {
    static HOOK_CONTEXT: std::cell::RefCell<Option<HookContext>> = std::cell::RefCell::new(None);
}

struct HookContext {
    pipe: Arc<AsyncNamedPipe>,
    secure_desktop_detected: Arc<AtomicBool>,
}

/// Runs the helper process's full lifetime: handshake, config receipt,
/// shared-texture publish, capture loop, until the host disconnects or the
/// heartbeat watchdog trips. Called from `src/bin/wgc_helper.rs`'s `main`.
pub fn run(parent_pid: u32) -> Result<()> {
    info!("wgc helper starting, connecting to parent pid {parent_pid}");

    let data_pipe = helper_handshake(parent_pid).map_err(|e| anyhow::anyhow!("handshake failed: {e}"))?;
    let mut pipe = AsyncNamedPipe::new(data_pipe);

    let config_slot: Arc<Mutex<Option<HelperConfig>>> = Arc::new(Mutex::new(None));
    let last_heartbeat = Arc::new(Mutex::new(Instant::now()));

    {
        let config_slot = Arc::clone(&config_slot);
        let last_heartbeat = Arc::clone(&last_heartbeat);
        pipe.start(
            Box::new(move |bytes| {
                if bytes.len() == std::mem::size_of::<HelperConfig>() && config_slot.lock().unwrap().is_none() {
                    if let Some(cfg) = HelperConfig::from_bytes(bytes) {
                        info!(
                            "received config: hdr={} display='{}'",
                            cfg.is_hdr(),
                            cfg.display_name()
                        );
                        *config_slot.lock().unwrap() = Some(cfg);
                    }
                } else if bytes.len() == 1 && bytes[0] == MSG_HEARTBEAT {
                    *last_heartbeat.lock().unwrap() = Instant::now();
                }
            }),
            Box::new(|err| warn!("wgc helper pipe error: {err}")),
            Some(Box::new(|| warn!("wgc helper pipe broke"))),
        );
    }

    info!("waiting for config from host");
    let deadline = Instant::now() + CONFIG_WAIT_TIMEOUT;
    let config = loop {
        if let Some(cfg) = config_slot.lock().unwrap().clone() {
            break cfg;
        }
        if Instant::now() >= deadline {
            bail!("timed out waiting for HelperConfig from host");
        }
        std::thread::sleep(CONFIG_POLL_INTERVAL);
    };

    enable_dpi_awareness();

    let adapter_luid: windows::Win32::Foundation::LUID = config.adapter_luid.into();
    let d3d_ctx = d3d11::create_d3d11_device_on_adapter(adapter_luid)
        .context("failed to create D3D11 device on the host's adapter")?;

    let display_name = config.display_name();
    let monitor = capture::find_monitor_by_name(&display_name).context("failed to resolve target monitor")?;

    let policy = if config.is_hdr() { CapturePolicy::Hdr } else { CapturePolicy::Sdr };
    let mut wgc = capture::init_capture(&d3d_ctx, monitor.handle, policy).context("failed to init WGC capture")?;
    let (width, height) = wgc.pool_size();

    let (shared_texture, shared_handle, keyed_mutex) =
        d3d11::create_shared_keyed_mutex_texture(&d3d_ctx.device, width, height, policy.is_hdr())
            .context("failed to create shared keyed-mutex texture")?;

    let handle_data = SharedHandleData::new(shared_handle, width, height);
    info!("waiting for pipe connection before sending shared handle data");
    while !pipe.is_connected() {
        std::thread::sleep(Duration::from_millis(50));
    }
    if !pipe.send(handle_data.as_bytes()) {
        bail!("failed to send shared handle data to host");
    }

    wgc.start().context("failed to start WGC capture session")?;

    let pipe = Arc::new(pipe);
    let secure_desktop_detected = Arc::new(AtomicBool::new(false));
    let hook = install_desktop_switch_hook(Arc::clone(&pipe), Arc::clone(&secure_desktop_detected));

    info!("entering capture loop, {width}x{height}");
    let result = run_capture_loop(&mut wgc, &d3d_ctx.context, &shared_texture, &keyed_mutex, &pipe, &last_heartbeat);

    if let Some(hook) = hook {
        unsafe {
            let _ = UnhookWinEvent(hook);
        }
    }
    HOOK_CONTEXT.with(|ctx| *ctx.borrow_mut() = None);

    result
}

fn run_capture_loop(
    wgc: &mut capture::WGCCapture,
    context: &windows::Win32::Graphics::Direct3D11::ID3D11DeviceContext,
    shared_texture: &windows::Win32::Graphics::Direct3D11::ID3D11Texture2D,
    keyed_mutex: &windows::Win32::Graphics::Dxgi::IDXGIKeyedMutex,
    pipe: &AsyncNamedPipe,
    last_heartbeat: &Mutex<Instant>,
) -> Result<()> {
    use windows::Win32::Graphics::Direct3D11::ID3D11Resource;
    use windows::core::Interface;

    while pipe.is_connected() {
        pump_messages();

        if last_heartbeat.lock().unwrap().elapsed() > HEARTBEAT_TIMEOUT {
            warn!("no heartbeat from host for {HEARTBEAT_TIMEOUT:?}, self-terminating");
            bail!("heartbeat timeout");
        }

        if wgc.wait_for_frame(FRAME_WAIT_TIMEOUT_MS).is_err() {
            continue;
        }

        let frame = match wgc.try_get_next_frame() {
            Ok(f) => f,
            Err(e) => {
                warn!("TryGetNextFrame failed: {e}");
                continue;
            }
        };

        if let Err(e) = wgc.check_resize(&frame) {
            warn!("frame pool resize check failed: {e}");
        }

        let frame_texture = match capture::WGCCapture::frame_to_texture(&frame) {
            Ok(t) => t,
            Err(e) => {
                warn!("frame_to_texture failed: {e}");
                continue;
            }
        };

        // `AcquireSync` reports `WAIT_ABANDONED` as a non-negative HRESULT, which
        // the generated safe wrapper would fold into `Ok(())` alongside `S_OK`;
        // go through the raw vtable call and check `FAILED(hr)` directly, the
        // same test the original helper process uses at this call site.
        let hr = d3d11::acquire_sync_raw(keyed_mutex, 0, windows::Win32::System::Threading::INFINITE);
        if hr.0 >= 0 {
            let shared_resource: ID3D11Resource = match shared_texture.cast() {
                Ok(r) => r,
                Err(e) => {
                    error!("failed to cast shared texture to ID3D11Resource: {e}");
                    continue;
                }
            };
            let src: ID3D11Resource = match frame_texture.cast() {
                Ok(r) => r,
                Err(e) => {
                    error!("failed to cast frame texture to ID3D11Resource: {e}");
                    let _ = unsafe { keyed_mutex.ReleaseSync(1) };
                    continue;
                }
            };
            unsafe {
                context.CopyResource(&shared_resource, &src);
                if let Err(e) = keyed_mutex.ReleaseSync(1) {
                    error!("ReleaseSync(1) failed: {e}");
                }
            }
            if !pipe.send(&[MSG_FRAME_READY]) {
                warn!("failed to send frame-ready notification");
            }
        } else {
            error!("AcquireSync(0) failed: {}", windows::core::Error::from(hr));
        }
    }

    Ok(())
}

fn install_desktop_switch_hook(
    pipe: Arc<AsyncNamedPipe>,
    secure_desktop_detected: Arc<AtomicBool>,
) -> Option<HWINEVENTHOOK> {
    HOOK_CONTEXT.with(|ctx| {
        *ctx.borrow_mut() = Some(HookContext {
            pipe,
            secure_desktop_detected,
        });
    });

    let hook = unsafe {
        SetWinEventHook(
            EVENT_SYSTEM_DESKTOPSWITCH,
            EVENT_SYSTEM_DESKTOPSWITCH,
            None,
            Some(desktop_switch_hook_proc),
            0,
            0,
            WINEVENT_OUTOFCONTEXT | WINEVENT_SKIPOWNPROCESS,
        )
    };

    if hook.is_invalid() {
        warn!("SetWinEventHook failed, secure-desktop fallback will not trigger");
        None
    } else {
        info!("desktop switch hook installed");
        Some(hook)
    }
}

unsafe extern "system" fn desktop_switch_hook_proc(
    _hook: HWINEVENTHOOK,
    event: u32,
    _hwnd: HWND,
    _id_object: i32,
    _id_child: i32,
    _event_thread: u32,
    _event_time: u32,
) {
    if event != EVENT_SYSTEM_DESKTOPSWITCH {
        return;
    }

    std::thread::sleep(Duration::from_millis(100));
    let secure = crate::misc::is_secure_desktop_active();

    HOOK_CONTEXT.with(|ctx| {
        let ctx = ctx.borrow();
        let Some(ctx) = ctx.as_ref() else { return };

        if secure && !ctx.secure_desktop_detected.swap(true, Ordering::SeqCst) {
            info!("secure desktop detected, notifying host");
            if ctx.pipe.is_connected() {
                let _ = ctx.pipe.send(&[MSG_SECURE_DESKTOP]);
            }
        } else if !secure {
            ctx.secure_desktop_detected.store(false, Ordering::SeqCst);
        }
    });
}

fn pump_messages() {
    let mut msg = MSG::default();
    unsafe {
        while PeekMessageW(&mut msg, None, 0, 0, PM_REMOVE).as_bool() {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }
    std::thread::sleep(MESSAGE_PUMP_SLEEP);
}
