//! Windows Graphics Capture session for the helper process. Grounded on this
//! crate's own WGC session code (`GraphicsCaptureItem`/`Direct3D11CaptureFramePool`
//! /`GraphicsCaptureSession`, the `FrameArrived` → kernel-event → `WaitForSingleObject`
//! zero-latency wait idiom), narrowed per spec §4.6 to monitor-only capture
//! with the pixel format fixed by the session's `CapturePolicy` (no per-monitor
//! HDR auto-detection: the host decides dynamic range and sends it in
//! `HelperConfig`).

use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use windows::core::Interface;
use windows::Foundation::TypedEventHandler;
use windows::Graphics::Capture::{
    Direct3D11CaptureFrame, Direct3D11CaptureFramePool, GraphicsCaptureItem, GraphicsCaptureSession,
};
use windows::Graphics::DirectX::Direct3D11::{IDirect3DDevice, IDirect3DSurface};
use windows::Graphics::DirectX::DirectXPixelFormat;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::Graphics::Gdi::HMONITOR;
use windows::Win32::System::Threading::{CreateEventW, SetEvent, WaitForSingleObject};
use windows::Win32::System::WinRT::Direct3D11::IDirect3DDxgiInterfaceAccess;
use windows::Win32::System::WinRT::Graphics::Capture::IGraphicsCaptureItemInterop;

use super::policy::CapturePolicy;
use crate::d3d11::D3D11Context;

/// A running WGC capture session against a single monitor.
pub struct WGCCapture {
    _item: GraphicsCaptureItem,
    frame_pool: Direct3D11CaptureFramePool,
    session: GraphicsCaptureSession,
    frame_arrived_token: i64,
    frame_event: HANDLE,
    shutting_down: Arc<AtomicBool>,
    pool_width: u32,
    pool_height: u32,
    direct3d_device: IDirect3DDevice,
    pixel_format: DirectXPixelFormat,
}

impl WGCCapture {
    pub fn start(&self) -> Result<()> {
        self.session.StartCapture()?;
        Ok(())
    }

    /// The current physical frame size, per spec §4.6 "at the physical size
    /// reported by the capture item (not the logical monitor size)".
    pub fn pool_size(&self) -> (u32, u32) {
        (self.pool_width, self.pool_height)
    }

    /// Recreates the frame pool if the captured content's size no longer
    /// matches it (e.g. a display-mode change). Call once per frame before
    /// extracting the texture.
    pub fn check_resize(&mut self, frame: &Direct3D11CaptureFrame) -> Result<()> {
        let content_size = frame.ContentSize()?;
        let new_w = content_size.Width as u32;
        let new_h = content_size.Height as u32;

        if new_w != self.pool_width || new_h != self.pool_height {
            self.frame_pool
                .Recreate(&self.direct3d_device, self.pixel_format, 2, content_size)?;
            self.pool_width = new_w;
            self.pool_height = new_h;
        }
        Ok(())
    }

    pub fn try_get_next_frame(&self) -> Result<Direct3D11CaptureFrame> {
        Ok(self.frame_pool.TryGetNextFrame()?)
    }

    /// Blocks on the `FrameArrived` kernel event up to `timeout_ms`. Call
    /// `try_get_next_frame()` after this returns to fetch the frame.
    pub fn wait_for_frame(&self, timeout_ms: u32) -> Result<()> {
        let result = unsafe { WaitForSingleObject(self.frame_event, timeout_ms) };
        if result.0 != 0 {
            bail!(
                "WaitForSingleObject returned 0x{:X} (timeout: {}ms)",
                result.0,
                timeout_ms
            );
        }
        Ok(())
    }

    /// Extracts the underlying `ID3D11Texture2D` from a captured frame. The
    /// frame must outlive the texture's use (e.g. the `CopyResource` call).
    pub fn frame_to_texture(frame: &Direct3D11CaptureFrame) -> Result<ID3D11Texture2D> {
        let surface: IDirect3DSurface = frame.Surface()?;
        let access: IDirect3DDxgiInterfaceAccess = surface.cast()?;
        let texture: ID3D11Texture2D = unsafe {
            access
                .GetInterface()
                .context("failed to get ID3D11Texture2D interface from WGC surface")?
        };
        Ok(texture)
    }
}

impl Drop for WGCCapture {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Relaxed);
        let _ = self.frame_pool.RemoveFrameArrived(self.frame_arrived_token);
        if !self.frame_event.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.frame_event);
            }
        }
    }
}

fn create_capture_item_for_monitor(hmonitor: HMONITOR) -> Result<GraphicsCaptureItem> {
    unsafe {
        let interop: IGraphicsCaptureItemInterop =
            windows::core::factory::<GraphicsCaptureItem, IGraphicsCaptureItemInterop>()
                .context("failed to get IGraphicsCaptureItemInterop factory")?;
        interop
            .CreateForMonitor(hmonitor)
            .context("failed to create GraphicsCaptureItem for monitor")
    }
}

/// Initializes a WGC session against `monitor`. `policy` fixes the frame
/// pool's pixel format directly (`Sdr` → BGRA8, `Hdr` → RGBA16F); there is no
/// per-monitor HDR auto-detection in this out-of-process path.
pub fn init_capture(d3d_ctx: &D3D11Context, monitor: HMONITOR, policy: CapturePolicy) -> Result<WGCCapture> {
    let item = create_capture_item_for_monitor(monitor)?;
    let size = item.Size()?;

    let pixel_format = if policy.is_hdr() {
        DirectXPixelFormat::R16G16B16A16Float
    } else {
        DirectXPixelFormat::B8G8R8A8UIntNormalized
    };

    let frame_pool = Direct3D11CaptureFramePool::CreateFreeThreaded(
        &d3d_ctx.direct3d_device,
        pixel_format,
        2,
        size,
    )?;

    let frame_event =
        unsafe { CreateEventW(None, false, false, None).context("failed to create frame event")? };

    let shutting_down = Arc::new(AtomicBool::new(false));
    let shutting_down_cb = Arc::clone(&shutting_down);
    let event_ptr = frame_event.0 as usize;
    let frame_arrived_token = frame_pool.FrameArrived(&TypedEventHandler::<
        Direct3D11CaptureFramePool,
        windows::core::IInspectable,
    >::new(move |_, _| {
        if !shutting_down_cb.load(Ordering::Relaxed) {
            unsafe {
                if SetEvent(HANDLE(event_ptr as *mut _)).is_err() {
                    log::warn!("SetEvent failed in FrameArrived callback");
                }
            }
        }
        Ok(())
    }))?;

    let session = frame_pool.CreateCaptureSession(&item)?;
    session.SetIsBorderRequired(false)?;

    Ok(WGCCapture {
        _item: item,
        frame_pool,
        session,
        frame_arrived_token,
        frame_event,
        shutting_down,
        pool_width: size.Width as u32,
        pool_height: size.Height as u32,
        direct3d_device: d3d_ctx.direct3d_device.clone(),
        pixel_format,
    })
}
