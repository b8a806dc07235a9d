//! Security descriptor for named pipes created while running as SYSTEM: grants
//! `GENERIC_ALL` to LocalSystem and to the interactive console user's SID, so
//! a helper process running as that user can open the pipe. Grounded on
//! `examples/original_source/src/platform/windows/ipc/pipes.cpp`
//! (`NamedPipeFactory::create_security_descriptor`/`extract_user_sid_from_token`).

use anyhow::{bail, Context, Result};
use windows::core::Owned;
use windows::Win32::Foundation::{HANDLE, HLOCAL};
use windows::Win32::Security::Authorization::{
    SetEntriesInAclW, EXPLICIT_ACCESS_W, SET_ACCESS, TRUSTEE_IS_SID, TRUSTEE_IS_USER,
    TRUSTEE_W,
};
use windows::Win32::Security::{
    GetTokenInformation, InitializeSecurityDescriptor, SetSecurityDescriptorDacl, TokenUser,
    ACL, NO_INHERITANCE, PSID, SECURITY_ATTRIBUTES, SECURITY_DESCRIPTOR,
    SECURITY_DESCRIPTOR_REVISION, TOKEN_USER,
};
use windows::Win32::System::Memory::LocalFree;
use windows::Win32::System::SystemServices::GENERIC_ALL;

use crate::misc::retrieve_users_token;

/// Owns the descriptor and ACL memory referenced by a [`SECURITY_ATTRIBUTES`]
/// for the lifetime of a `CreateNamedPipeW` call.
pub struct PipeSecurity {
    descriptor: Box<SECURITY_DESCRIPTOR>,
    acl_ptr: *mut ACL,
}

impl PipeSecurity {
    pub fn attributes(&self) -> SECURITY_ATTRIBUTES {
        SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: self.descriptor.as_ref() as *const _ as *mut _,
            bInheritHandle: false.into(),
        }
    }
}

/// Builds a security descriptor granting `GENERIC_ALL` to the well-known
/// LocalSystem SID and to the SID of the user logged into the active console
/// session. Called only when the current process is running as SYSTEM.
pub fn build_system_pipe_security() -> Result<PipeSecurity> {
    unsafe {
        let system_sid = system_sid()?;
        let console_token = retrieve_users_token(false).context("no interactive console user")?;
        let user_sid_buf = token_user_sid_bytes(*console_token)?;
        let user_sid = token_user_sid_ptr(&user_sid_buf);

        let mut entries = [
            explicit_access_entry(*system_sid),
            explicit_access_entry(user_sid),
        ];

        let mut acl_ptr: *mut ACL = std::ptr::null_mut();
        let status = SetEntriesInAclW(Some(&mut entries), None, &mut acl_ptr);
        if status.0 != 0 {
            bail!("SetEntriesInAclW failed with status {}", status.0);
        }

        let mut descriptor = Box::new(SECURITY_DESCRIPTOR::default());
        InitializeSecurityDescriptor(
            descriptor.as_mut() as *mut _ as *mut _,
            SECURITY_DESCRIPTOR_REVISION,
        )
        .context("InitializeSecurityDescriptor failed")?;
        SetSecurityDescriptorDacl(
            descriptor.as_mut() as *mut _ as *mut _,
            true,
            Some(acl_ptr),
            false,
        )
        .context("SetSecurityDescriptorDacl failed")?;

        Ok(PipeSecurity {
            descriptor,
            acl_ptr,
        })
    }
}

impl Drop for PipeSecurity {
    fn drop(&mut self) {
        // SAFETY: `acl_ptr` was allocated by `SetEntriesInAclW`, which documents
        // the returned ACL as LocalAlloc memory the caller must LocalFree.
        unsafe {
            let _ = LocalFree(Some(HLOCAL(self.acl_ptr as *mut _)));
        }
    }
}

unsafe fn system_sid() -> Result<Owned<PSID>> {
    use windows::Win32::Security::Authorization::ConvertStringSidToSidW;
    let wide: Vec<u16> = "S-1-5-18".encode_utf16().chain(std::iter::once(0)).collect();
    let mut psid = PSID::default();
    ConvertStringSidToSidW(windows::core::PCWSTR(wide.as_ptr()), &mut psid)
        .context("ConvertStringSidToSidW(LocalSystem) failed")?;
    Ok(Owned::new(psid))
}

unsafe fn token_user_sid_bytes(token: HANDLE) -> Result<Vec<u8>> {
    let mut needed = 0u32;
    // First call establishes the required buffer size; expected to fail with
    // ERROR_INSUFFICIENT_BUFFER.
    let _ = GetTokenInformation(token, TokenUser, None, 0, &mut needed);
    if needed == 0 {
        bail!("GetTokenInformation(TokenUser) returned zero size");
    }
    let mut buf = vec![0u8; needed as usize];
    GetTokenInformation(
        token,
        TokenUser,
        Some(buf.as_mut_ptr() as *mut _),
        needed,
        &mut needed,
    )
    .context("GetTokenInformation(TokenUser) failed")?;
    Ok(buf)
}

fn token_user_sid_ptr(buf: &[u8]) -> PSID {
    // SAFETY: `buf` was sized and filled by GetTokenInformation(TokenUser, ...)
    // and outlives this pointer's use within `build_system_pipe_security`.
    let token_user = unsafe { &*(buf.as_ptr() as *const TOKEN_USER) };
    token_user.User.Sid
}

fn explicit_access_entry(sid: PSID) -> EXPLICIT_ACCESS_W {
    EXPLICIT_ACCESS_W {
        grfAccessPermissions: GENERIC_ALL,
        grfAccessMode: SET_ACCESS,
        grfInheritance: NO_INHERITANCE,
        Trustee: TRUSTEE_W {
            pMultipleTrustee: std::ptr::null_mut(),
            MultipleTrusteeOperation: Default::default(),
            TrusteeForm: TRUSTEE_IS_SID,
            TrusteeType: TRUSTEE_IS_USER,
            ptstrName: windows::core::PWSTR(sid.0 as *mut u16),
        },
    }
}

unsafe impl Send for PipeSecurity {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_system_pipe_security_requires_interactive_session() {
        // On a CI runner or service session without a logged-in console user
        // this is expected to fail; the caller (pipe::create_server) falls
        // back to default security in that case.
        let _ = build_system_pipe_security();
    }
}
