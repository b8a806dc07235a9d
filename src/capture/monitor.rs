//! DPI awareness and monitor enumeration/lookup for the helper process.
//! Grounded on this crate's own `enumerate_monitors`/`enum_monitor_proc`
//! `EnumDisplayMonitors` idiom (previously test-only, now promoted to
//! production code), generalised per spec §4.6 to resolve a monitor by GDI
//! device name with a primary-monitor fallback. Window-handle resolution is
//! dropped: this subsystem only ever captures monitors.

use anyhow::{bail, Context, Result};
use windows::core::BOOL;
use windows::Win32::Foundation::{LPARAM, RECT};
use windows::Win32::Graphics::Gdi::{
    EnumDisplayMonitors, GetMonitorInfoW, HDC, HMONITOR, MONITORINFO, MONITORINFOEXW,
};
use windows::Win32::UI::HiDpi::{
    SetProcessDpiAwarenessContext, DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2,
};

const MONITORINFOF_PRIMARY: u32 = 1;

/// A single enumerated monitor: its handle, GDI device name (e.g.
/// `\\.\DISPLAY1`), primary flag, and logical resolution.
#[derive(Debug, Clone)]
pub struct MonitorInfo {
    pub handle: HMONITOR,
    pub name: String,
    pub is_primary: bool,
    pub width: i32,
    pub height: i32,
}

/// Raises the process to per-monitor-v2 DPI awareness so capture operates on
/// physical pixels rather than a scaled logical resolution. Without this the
/// capture is visibly "zoomed" on HiDPI displays (spec §4.6). Idempotent:
/// repeated calls silently no-op if already set.
pub fn enable_dpi_awareness() {
    unsafe {
        let _ = SetProcessDpiAwarenessContext(DPI_AWARENESS_CONTEXT_PER_MONITOR_AWARE_V2);
    }
}

/// Enumerates all attached monitors in system order.
pub fn enumerate_monitors() -> Result<Vec<MonitorInfo>> {
    unsafe {
        let mut monitors = Vec::new();
        let ok = EnumDisplayMonitors(
            Some(HDC::default()),
            None,
            Some(enum_monitor_proc),
            LPARAM(&mut monitors as *mut _ as isize),
        );
        if !ok.as_bool() {
            bail!("EnumDisplayMonitors failed");
        }
        Ok(monitors)
    }
}

/// Resolves a monitor by GDI device name. On no exact match, falls back to
/// the primary monitor (spec §4.6: "by GDI device name; falls back to the
/// primary monitor on mismatch").
pub fn find_monitor_by_name(device_name: &str) -> Result<MonitorInfo> {
    let monitors = enumerate_monitors()?;
    if monitors.is_empty() {
        bail!("no monitors detected");
    }

    if let Some(found) = monitors.iter().find(|m| m.name == device_name) {
        return Ok(found.clone());
    }

    monitors
        .into_iter()
        .find(|m| m.is_primary)
        .context("no primary monitor found among enumerated monitors")
}

unsafe extern "system" fn enum_monitor_proc(
    hmonitor: HMONITOR,
    _: HDC,
    _: *mut RECT,
    lparam: LPARAM,
) -> BOOL {
    // SAFETY: lparam points to a Vec<MonitorInfo> on the caller's stack in
    // enumerate_monitors(); the callback runs synchronously on the same
    // thread for the duration of that call.
    let monitors = &mut *(lparam.0 as *mut Vec<MonitorInfo>);

    let mut info = MONITORINFOEXW {
        monitorInfo: MONITORINFO {
            cbSize: std::mem::size_of::<MONITORINFOEXW>() as u32,
            ..Default::default()
        },
        ..Default::default()
    };

    if GetMonitorInfoW(hmonitor, &mut info.monitorInfo as *mut _ as *mut _).as_bool() {
        let name = String::from_utf16_lossy(&info.szDevice)
            .trim_end_matches('\0')
            .to_string();
        let is_primary = (info.monitorInfo.dwFlags & MONITORINFOF_PRIMARY) != 0;
        let width = info.monitorInfo.rcMonitor.right - info.monitorInfo.rcMonitor.left;
        let height = info.monitorInfo.rcMonitor.bottom - info.monitorInfo.rcMonitor.top;

        monitors.push(MonitorInfo {
            handle: hmonitor,
            name,
            is_primary,
            width,
            height,
        });
    }

    BOOL(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_monitors_finds_exactly_one_primary() {
        enable_dpi_awareness();
        let monitors = enumerate_monitors().expect("enumeration should succeed");
        assert!(!monitors.is_empty());
        assert_eq!(monitors.iter().filter(|m| m.is_primary).count(), 1);
        for m in &monitors {
            assert!(m.width > 0);
            assert!(m.height > 0);
        }
    }

    #[test]
    fn find_monitor_by_unknown_name_falls_back_to_primary() {
        let resolved = find_monitor_by_name("\\\\.\\NONEXISTENT_DEVICE").unwrap();
        assert!(resolved.is_primary);
    }

    #[test]
    fn find_monitor_by_exact_name_matches() {
        let monitors = enumerate_monitors().unwrap();
        let first = &monitors[0];
        let resolved = find_monitor_by_name(&first.name).unwrap();
        assert_eq!(resolved.name, first.name);
    }
}
