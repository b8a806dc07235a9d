//! D3D11 device creation and the shared-keyed-mutex texture both halves of
//! the session use. Grounded on the device-creation shape already present in
//! this crate, extended per spec §4.5/§4.6 with adapter-LUID pinning (so the
//! host opens the same physical adapter the helper rendered on) and the
//! `SHARED_KEYED_MUTEX` texture the two processes hand a frame through.

use anyhow::{bail, Context, Result};
use log::info;
use windows::core::Interface;
use windows::Graphics::DirectX::Direct3D11::IDirect3DDevice;
use windows::Win32::Foundation::{HANDLE, HMODULE, HRESULT, LUID};
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::System::WinRT::Direct3D11::CreateDirect3D11DeviceFromDXGIDevice;

/// A D3D11 device, its immediate context, and the WinRT interop wrapper WGC's
/// capture APIs require.
pub struct D3D11Context {
    pub device: ID3D11Device,
    pub context: ID3D11DeviceContext,
    pub dxgi_device: IDXGIDevice,
    pub direct3d_device: IDirect3DDevice,
}

/// Creates a D3D11 device on the system's default hardware adapter.
pub fn create_d3d11_device() -> Result<D3D11Context> {
    create_device(None)
}

/// Creates a D3D11 device pinned to the adapter identified by `luid`. Used by
/// the host to open the shared texture on the exact physical GPU the helper
/// rendered it on — a mismatch here is a fatal, unrecoverable session error
/// (spec §7, `SessionError::Fatal`).
pub fn create_d3d11_device_on_adapter(luid: LUID) -> Result<D3D11Context> {
    let factory: IDXGIFactory1 = unsafe { CreateDXGIFactory1() }.context("CreateDXGIFactory1 failed")?;

    let mut index = 0u32;
    loop {
        let adapter = unsafe { factory.EnumAdapters(index) };
        let adapter = match adapter {
            Ok(a) => a,
            Err(_) => bail!("no adapter with LUID {{{}, {}}} found", luid.LowPart, luid.HighPart),
        };

        let desc = unsafe { adapter.GetDesc() }.context("IDXGIAdapter::GetDesc failed")?;
        if desc.AdapterLuid.LowPart == luid.LowPart && desc.AdapterLuid.HighPart == luid.HighPart {
            return create_device(Some(adapter));
        }

        index += 1;
    }
}

/// Returns the LUID of the adapter a device was created on, used by the
/// helper to report which physical GPU it captured on.
pub fn adapter_luid(dxgi_device: &IDXGIDevice) -> Result<LUID> {
    unsafe {
        let adapter = dxgi_device.GetAdapter().context("IDXGIDevice::GetAdapter failed")?;
        let desc = adapter.GetDesc().context("IDXGIAdapter::GetDesc failed")?;
        Ok(desc.AdapterLuid)
    }
}

fn create_device(adapter: Option<IDXGIAdapter>) -> Result<D3D11Context> {
    let driver_type = if adapter.is_some() {
        D3D_DRIVER_TYPE_UNKNOWN
    } else {
        D3D_DRIVER_TYPE_HARDWARE
    };

    let (device, context) = unsafe {
        let mut device = None;
        let mut context = None;

        D3D11CreateDevice(
            adapter.as_ref(),
            driver_type,
            HMODULE::default(),
            D3D11_CREATE_DEVICE_BGRA_SUPPORT,
            Some(&[D3D_FEATURE_LEVEL_11_0]),
            D3D11_SDK_VERSION,
            Some(&mut device),
            None,
            Some(&mut context),
        )
        .context("D3D11CreateDevice failed")?;

        (device.unwrap(), context.unwrap())
    };

    let dxgi_device: IDXGIDevice = device.cast().context("ID3D11Device -> IDXGIDevice cast failed")?;

    let direct3d_device: IDirect3DDevice = unsafe {
        CreateDirect3D11DeviceFromDXGIDevice(&dxgi_device)
            .context("CreateDirect3D11DeviceFromDXGIDevice failed")?
            .cast()
            .context("IInspectable -> IDirect3DDevice cast failed")?
    };

    log_device_info(&dxgi_device);

    Ok(D3D11Context {
        device,
        context,
        dxgi_device,
        direct3d_device,
    })
}

fn log_device_info(dxgi_device: &IDXGIDevice) {
    let result: Result<()> = (|| unsafe {
        let adapter = dxgi_device.GetAdapter()?;
        let desc = adapter.GetDesc()?;
        let name = String::from_utf16_lossy(&desc.Description);
        info!(
            "d3d11 device created on {} ({} MB dedicated VRAM)",
            name.trim_end_matches('\0'),
            desc.DedicatedVideoMemory / 1024 / 1024
        );
        Ok(())
    })();
    if let Err(e) = result {
        log::warn!("failed to query adapter description: {e}");
    }
}

/// Creates the `SHARED_KEYED_MUTEX` texture the helper publishes and the host
/// opens. `hdr` selects `R16G16B16A16_FLOAT` over `B8G8R8A8_UNORM` (spec
/// §3 "Shared texture"): mipless, single array slice, default usage, no
/// bind flags.
pub fn create_shared_keyed_mutex_texture(
    device: &ID3D11Device,
    width: u32,
    height: u32,
    hdr: bool,
) -> Result<(ID3D11Texture2D, HANDLE, IDXGIKeyedMutex)> {
    let format = if hdr {
        DXGI_FORMAT_R16G16B16A16_FLOAT
    } else {
        DXGI_FORMAT_B8G8R8A8_UNORM
    };

    let desc = D3D11_TEXTURE2D_DESC {
        Width: width,
        Height: height,
        MipLevels: 1,
        ArraySize: 1,
        Format: format,
        SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
        Usage: D3D11_USAGE_DEFAULT,
        BindFlags: 0,
        CPUAccessFlags: 0,
        MiscFlags: D3D11_RESOURCE_MISC_SHARED_KEYEDMUTEX.0 as u32,
    };

    let texture = unsafe {
        let mut texture = None;
        device
            .CreateTexture2D(&desc, None, Some(&mut texture))
            .context("CreateTexture2D (shared keyed-mutex) failed")?;
        texture.unwrap()
    };

    let resource: IDXGIResource1 = texture
        .cast()
        .context("ID3D11Texture2D -> IDXGIResource1 cast failed")?;
    let handle = unsafe {
        resource
            .CreateSharedHandle(
                None,
                (DXGI_SHARED_RESOURCE_READ.0 | DXGI_SHARED_RESOURCE_WRITE.0) as u32,
                None,
            )
            .context("IDXGIResource1::CreateSharedHandle failed")?
    };

    let keyed_mutex: IDXGIKeyedMutex = texture
        .cast()
        .context("ID3D11Texture2D -> IDXGIKeyedMutex cast failed")?;

    Ok((texture, handle, keyed_mutex))
}

/// Opens a shared texture handle published by the helper into this device's
/// address space (host side). The device must have been created on the same
/// physical adapter LUID the helper used, or `OpenSharedResource` fails.
pub fn open_shared_keyed_mutex_texture(
    device: &ID3D11Device,
    handle: HANDLE,
) -> Result<(ID3D11Texture2D, IDXGIKeyedMutex)> {
    let texture: ID3D11Texture2D =
        unsafe { device.OpenSharedResource(handle) }.context("ID3D11Device::OpenSharedResource failed")?;
    let keyed_mutex: IDXGIKeyedMutex = texture
        .cast()
        .context("ID3D11Texture2D -> IDXGIKeyedMutex cast failed")?;
    Ok((texture, keyed_mutex))
}

/// Calls `IDXGIKeyedMutex::AcquireSync` through its raw vtable slot and
/// returns the unmodified `HRESULT`, instead of going through the generated
/// safe wrapper. `AcquireSync` reports `WAIT_ABANDONED` (0x80) and
/// `WAIT_TIMEOUT` (0x102) as ordinary non-negative codes, and
/// `windows`-crate codegen treats any non-negative `HRESULT` as success,
/// collapsing all three outcomes into `Ok(())`. The caller needs to tell
/// them apart, so this goes around that collapsing.
pub fn acquire_sync_raw(mutex: &IDXGIKeyedMutex, key: u64, timeout_ms: u32) -> HRESULT {
    unsafe {
        let vtable = Interface::vtable(mutex);
        (vtable.AcquireSync)(Interface::as_raw(mutex), key, timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_creation() {
        let _ctx = create_d3d11_device().expect("device creation should succeed");
    }

    #[test]
    fn test_dxgi_adapter() {
        let ctx = create_d3d11_device().unwrap();
        unsafe {
            let adapter = ctx.dxgi_device.GetAdapter();
            assert!(adapter.is_ok());
            let desc = adapter.unwrap().GetDesc();
            assert!(desc.is_ok());
        }
    }

    #[test]
    fn create_device_on_own_adapter_luid_round_trips() {
        let ctx = create_d3d11_device().unwrap();
        let luid = adapter_luid(&ctx.dxgi_device).unwrap();
        let pinned = create_d3d11_device_on_adapter(luid).expect("should find the same adapter");
        let pinned_luid = adapter_luid(&pinned.dxgi_device).unwrap();
        assert_eq!(luid.LowPart, pinned_luid.LowPart);
        assert_eq!(luid.HighPart, pinned_luid.HighPart);
    }

    #[test]
    fn shared_sdr_texture_round_trips_through_open_shared_resource() {
        let ctx = create_d3d11_device().unwrap();
        let (_texture, handle, _mutex) =
            create_shared_keyed_mutex_texture(&ctx.device, 1920, 1080, false).unwrap();
        let (opened, _opened_mutex) =
            open_shared_keyed_mutex_texture(&ctx.device, handle).expect("open should succeed");
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { opened.GetDesc(&mut desc) };
        assert_eq!(desc.Width, 1920);
        assert_eq!(desc.Height, 1080);
        assert_eq!(desc.Format, DXGI_FORMAT_B8G8R8A8_UNORM);
    }

    #[test]
    fn shared_hdr_texture_uses_float16_format() {
        let ctx = create_d3d11_device().unwrap();
        let (texture, _handle, _mutex) =
            create_shared_keyed_mutex_texture(&ctx.device, 1920, 1080, true).unwrap();
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { texture.GetDesc(&mut desc) };
        assert_eq!(desc.Format, DXGI_FORMAT_R16G16B16A16_FLOAT);
    }
}
