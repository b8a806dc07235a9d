//! C4: helper process lifecycle. Grounded on
//! `examples/original_source/src/platform/windows/ipc/process_handler.{h,cpp}`
//! (`ProcessHandler::start`/`wait`/`terminate`) for the RAII shape, and on
//! the same directory's use of a job object configured with
//! `JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE` so the helper cannot outlive the host
//! even if the host crashes without an orderly shutdown.

use anyhow::{bail, Context, Result};
use log::{debug, warn};
use windows::core::{Owned, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_BASIC_LIMIT_INFORMATION,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows::Win32::System::Threading::{
    CreateProcessAsUserW, CreateProcessW, GetExitCodeProcess, TerminateProcess,
    WaitForSingleObject, CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, INFINITE,
    PROCESS_INFORMATION, STARTUPINFOW,
};

use crate::misc::{is_running_as_system, retrieve_users_token};

/// A job object configured so every process assigned to it (and their
/// descendants) is killed the moment the job handle is closed, guaranteeing
/// the helper process cannot survive an unclean host exit.
pub fn create_kill_on_close_job() -> Result<Owned<HANDLE>> {
    unsafe {
        let job = CreateJobObjectW(None, None).context("CreateJobObjectW failed")?;
        let job = Owned::new(job);

        let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION {
            BasicLimitInformation: JOBOBJECT_BASIC_LIMIT_INFORMATION {
                LimitFlags: JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
                ..Default::default()
            },
            ..Default::default()
        };

        SetInformationJobObject(
            *job,
            JobObjectExtendedLimitInformation,
            &mut info as *mut _ as *mut _,
            std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
        )
        .context("SetInformationJobObject failed")?;

        Ok(job)
    }
}

/// RAII wrapper around a launched helper process: start, wait, terminate,
/// with the process (and thread) handles released on drop and the process
/// guaranteed dead via the job object once the session that owns this
/// `HelperProcess` is torn down.
pub struct HelperProcess {
    process: Option<Owned<HANDLE>>,
    thread: Option<Owned<HANDLE>>,
    job: Owned<HANDLE>,
}

impl HelperProcess {
    /// Launches `application_path` with `arguments`. When the current
    /// process is running as SYSTEM, launches into the interactive console
    /// user's session via an impersonated token (spec §4.4) so the helper
    /// can create a WGC capture session against the user's desktop;
    /// otherwise launches directly.
    pub fn start(application_path: &str, arguments: &str) -> Result<Self> {
        let job = create_kill_on_close_job()?;

        let mut command_line = application_path.to_string();
        if !arguments.is_empty() {
            command_line.push(' ');
            command_line.push_str(arguments);
        }
        let mut command_line_wide = to_wide(&command_line);

        let creation_flags = CREATE_UNICODE_ENVIRONMENT.0 | CREATE_NO_WINDOW.0;

        let mut startup_info = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut process_information = PROCESS_INFORMATION::default();

        let launched = if is_running_as_system().unwrap_or(false) {
            let user_token = retrieve_users_token(true).context("no interactive user to launch helper into")?;
            unsafe {
                CreateProcessAsUserW(
                    Some(*user_token),
                    None,
                    Some(PWSTR(command_line_wide.as_mut_ptr())),
                    None,
                    None,
                    false,
                    windows::Win32::System::Threading::PROCESS_CREATION_FLAGS(creation_flags),
                    None,
                    None,
                    &startup_info,
                    &mut process_information,
                )
            }
        } else {
            unsafe {
                CreateProcessW(
                    None,
                    Some(PWSTR(command_line_wide.as_mut_ptr())),
                    None,
                    None,
                    false,
                    windows::Win32::System::Threading::PROCESS_CREATION_FLAGS(creation_flags),
                    None,
                    None,
                    &startup_info,
                    &mut process_information,
                )
            }
        };

        launched.context("failed to launch helper process")?;

        let process = unsafe { Owned::new(process_information.hProcess) };
        let thread = unsafe { Owned::new(process_information.hThread) };

        unsafe {
            AssignProcessToJobObject(*job, *process).context("AssignProcessToJobObject failed")?;
        }

        debug!("launched helper process, pid {}", process_information.dwProcessId);

        Ok(Self {
            process: Some(process),
            thread: Some(thread),
            job,
        })
    }

    /// Blocks until the helper process exits, returning its exit code.
    pub fn wait(&mut self) -> Result<u32> {
        let process = match &self.process {
            Some(p) => *p,
            None => bail!("process is not running"),
        };
        unsafe {
            let wait_result = WaitForSingleObject(*process, INFINITE);
            if wait_result != windows::Win32::Foundation::WAIT_OBJECT_0 {
                bail!("WaitForSingleObject on helper process failed");
            }
            let mut exit_code = 0u32;
            GetExitCodeProcess(*process, &mut exit_code).context("GetExitCodeProcess failed")?;
            self.process = None;
            Ok(exit_code)
        }
    }

    /// Best-effort immediate termination; used on reinit/shutdown paths.
    pub fn terminate(&mut self) {
        if let Some(process) = &self.process {
            unsafe {
                if let Err(e) = TerminateProcess(*process, 1) {
                    warn!("TerminateProcess on helper failed: {e}");
                }
            }
            self.process = None;
        }
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_kill_on_close_job_succeeds() {
        let job = create_kill_on_close_job();
        assert!(job.is_ok());
    }

    #[test]
    fn start_and_wait_on_a_trivial_process() {
        // cmd.exe /C exit 7 is present on every Windows host and exits
        // immediately with a known code, useful for exercising the whole
        // start/wait path without a real helper binary.
        let mut helper = HelperProcess::start("C:\\Windows\\System32\\cmd.exe", "/C exit 7")
            .expect("start should succeed");
        let exit_code = helper.wait().expect("wait should succeed");
        assert_eq!(exit_code, 7);
    }
}
