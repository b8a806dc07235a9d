//! Small OS helpers shared by several components: session/token queries,
//! process enumeration, GUID generation, QPC timing. Grounded on
//! `examples/original_source/src/platform/windows/ipc/misc_utils.{h,cpp}`.

use anyhow::{bail, Context, Result};
use windows::core::{Owned, GUID, PWSTR};
use windows::Win32::Foundation::{HANDLE, LUID};
use windows::Win32::Security::Authorization::ConvertStringSidToSidW;
use windows::Win32::Security::{
    CheckTokenMembership, GetTokenInformation, TokenElevationType, TokenElevationTypeLimited,
    TokenLinkedToken, TOKEN_ELEVATION_TYPE,
};
use windows::Win32::System::Com::{CoCreateGuid, StringFromGUID2};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows::Win32::System::Performance::{QueryPerformanceCounter, QueryPerformanceFrequency};
use windows::Win32::System::RemoteDesktop::{WTSGetActiveConsoleSessionId, WTSQueryUserToken};
use windows::Win32::System::StationsAndDesktops::{GetThreadDesktop, GetUserObjectInformationW, UOI_NAME};
use windows::Win32::System::Threading::GetCurrentThreadId;

/// Returns true if the current process token is the well-known LocalSystem SID.
pub fn is_running_as_system() -> Result<bool> {
    unsafe {
        let sid = sid_from_string("S-1-5-18")?;
        let mut is_member = windows::Win32::Foundation::BOOL(0);
        CheckTokenMembership(None, *sid, &mut is_member)?;
        Ok(is_member.as_bool())
    }
}

unsafe fn sid_from_string(sid_str: &str) -> Result<Owned<windows::Win32::Foundation::PSID>> {
    let wide: Vec<u16> = sid_str.encode_utf16().chain(std::iter::once(0)).collect();
    let mut psid = windows::Win32::Foundation::PSID::default();
    ConvertStringSidToSidW(windows::core::PCWSTR(wide.as_ptr()), &mut psid)
        .context("ConvertStringSidToSidW failed")?;
    // SAFETY: ConvertStringSidToSidW allocates via LocalAlloc; Owned's deleter for
    // PSID in the `windows` crate calls LocalFree.
    Ok(Owned::new(psid))
}

/// Retrieves the primary token of the user logged into the active console
/// session, following `TokenLinkedToken` to the elevated token when the
/// console user's default token is UAC-limited and `elevated` is requested.
pub fn retrieve_users_token(elevated: bool) -> Result<Owned<HANDLE>> {
    unsafe {
        let session_id = WTSGetActiveConsoleSessionId();
        if session_id == 0xFFFFFFFF {
            bail!("no active console session (no interactive user logged in)");
        }

        let mut token = HANDLE::default();
        WTSQueryUserToken(session_id, &mut token).context("WTSQueryUserToken failed")?;
        let mut token = Owned::new(token);

        if elevated {
            let mut elevation_type = TOKEN_ELEVATION_TYPE::default();
            let mut returned = 0u32;
            let ok = GetTokenInformation(
                *token,
                TokenElevationType,
                Some(&mut elevation_type as *mut _ as *mut _),
                std::mem::size_of::<TOKEN_ELEVATION_TYPE>() as u32,
                &mut returned,
            );
            if ok.is_ok() && elevation_type == TokenElevationTypeLimited {
                let mut linked = HANDLE::default();
                let mut linked_returned = 0u32;
                let got_linked = GetTokenInformation(
                    *token,
                    TokenLinkedToken,
                    Some(&mut linked as *mut _ as *mut _),
                    std::mem::size_of::<HANDLE>() as u32,
                    &mut linked_returned,
                );
                if got_linked.is_ok() && !linked.is_invalid() {
                    token = Owned::new(linked);
                }
            }
        }

        Ok(token)
    }
}

/// Checks whether a process with the given image name (e.g. `"consent.exe"`)
/// is currently running, used to detect the UAC secure desktop.
pub fn is_process_running(process_name: &str) -> Result<bool> {
    unsafe {
        let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0)
            .context("CreateToolhelp32Snapshot failed")?;
        let snapshot = Owned::new(snapshot);

        let mut entry = PROCESSENTRY32W {
            dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
            ..Default::default()
        };

        if Process32FirstW(*snapshot, &mut entry).is_err() {
            return Ok(false);
        }

        loop {
            let name = String::from_utf16_lossy(&entry.szExeFile);
            let name = name.trim_end_matches('\0');
            if name.eq_ignore_ascii_case(process_name) {
                return Ok(true);
            }
            if Process32NextW(*snapshot, &mut entry).is_err() {
                return Ok(false);
            }
        }
    }
}

/// Detects the UAC secure desktop: either `consent.exe` is running, or the
/// calling thread's desktop is named "Winlogon"/"Default" (SAD). Shared by
/// the helper's own desktop-switch hook and the host's DXGI-side poll for
/// when it's safe to swap back to WGC.
pub fn is_secure_desktop_active() -> bool {
    if is_process_running("consent.exe").unwrap_or(false) {
        return true;
    }

    unsafe {
        let desktop = GetThreadDesktop(GetCurrentThreadId());
        let mut name = [0u16; 256];
        let mut needed = 0u32;
        if GetUserObjectInformationW(
            HANDLE(desktop.0),
            UOI_NAME,
            Some(name.as_mut_ptr() as *mut _),
            std::mem::size_of_val(&name) as u32,
            Some(&mut needed),
        )
        .is_ok()
        {
            let desktop_name = String::from_utf16_lossy(&name)
                .trim_end_matches('\0')
                .to_ascii_lowercase();
            return desktop_name == "winlogon" || desktop_name == "sad";
        }
    }

    false
}

/// Generates a GUID string suitable for use as a pipe name component, via
/// `CoCreateGuid` + `StringFromGUID2` (matches the original implementation;
/// avoids pulling in the `uuid` crate for a single call site).
pub fn generate_guid() -> Result<String> {
    unsafe {
        let guid: GUID = CoCreateGuid().context("CoCreateGuid failed")?;
        let mut buf = [0u16; 64];
        let len = StringFromGUID2(&guid, &mut buf);
        if len == 0 {
            bail!("StringFromGUID2 failed");
        }
        Ok(String::from_utf16_lossy(&buf[..(len as usize - 1)]))
    }
}

/// Current process id, used to suffix the well-known handshake pipe name.
pub fn current_process_id() -> u32 {
    std::process::id()
}

/// Reads the 64-bit adapter LUID into the `{low, high}` pair the wire
/// protocol carries.
pub fn luid_parts(luid: LUID) -> (u32, i32) {
    (luid.LowPart, luid.HighPart)
}

/// Query-performance-counter timestamp, used for frame timing diagnostics
/// (spec §4.5: "every 150 acquires emit a line with wait/mutex/total μs").
pub fn qpc_now() -> i64 {
    unsafe {
        let mut counter = 0i64;
        let _ = QueryPerformanceCounter(&mut counter);
        counter
    }
}

/// Converts a QPC delta to microseconds using the process-wide QPC frequency.
pub fn qpc_micros(delta: i64) -> f64 {
    unsafe {
        let mut freq = 0i64;
        let _ = QueryPerformanceFrequency(&mut freq);
        if freq == 0 {
            return 0.0;
        }
        (delta as f64) * 1_000_000.0 / (freq as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_guid_produces_braced_uuid() {
        let guid = generate_guid().expect("CoCreateGuid should succeed");
        assert!(guid.starts_with('{') && guid.ends_with('}'));
        assert_eq!(guid.len(), 38);
    }

    #[test]
    fn qpc_micros_is_monotonic_for_positive_deltas() {
        assert!(qpc_micros(0) >= 0.0);
    }
}
