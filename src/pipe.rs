//! C1: overlapped-I/O named-pipe transport. Grounded on
//! `examples/other_examples/4eeb350a_Devolutions-IronRDP__...windows-pipe.rs.rs`
//! for the `windows` crate overlapped-I/O idiom (`Owned<HANDLE>`, pinned
//! `OVERLAPPED` + event, `ERROR_PIPE_CONNECTED`/`ERROR_IO_PENDING` matching),
//! and on `examples/original_source/src/platform/windows/ipc/pipes.cpp` for
//! the cancel-then-block-drain discipline and the client retry budget.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use windows::core::Owned;
use windows::Win32::Foundation::{
    ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND, ERROR_IO_PENDING, ERROR_PIPE_BUSY,
    ERROR_PIPE_CONNECTED, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, ReadFile, WriteFile, FILE_FLAG_FIRST_PIPE_INSTANCE,
    FILE_FLAG_OVERLAPPED, FILE_GENERIC_READ, FILE_GENERIC_WRITE, OPEN_EXISTING,
    PIPE_ACCESS_DUPLEX,
};
use windows::Win32::System::Pipes::{
    ConnectNamedPipe, CreateNamedPipeW, DisconnectNamedPipe, WaitNamedPipeW, PIPE_READMODE_MESSAGE,
    PIPE_TYPE_MESSAGE, PIPE_WAIT,
};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject};
use windows::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

use crate::error::{PipeError, PipeOutcome};
use crate::security::{build_system_pipe_security, PipeSecurity};

const PIPE_BUFFER_SIZE: u32 = 64 * 1024;
const CLIENT_CONNECT_BUDGET: Duration = Duration::from_secs(2);
const CLIENT_BUSY_WAIT_MS: u32 = 250;
const CLIENT_RETRY_SLEEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// A single pipe endpoint: one native handle, exclusively owned, with a
/// connected flag and per-call overlapped I/O.
pub struct PipeEndpoint {
    handle: Owned<HANDLE>,
    role: Role,
    connected: AtomicBool,
    // Kept alive for the lifetime of the server handle; dropped (and its ACL
    // freed) only after the pipe itself is closed.
    _security: Option<PipeSecurity>,
}

unsafe impl Send for PipeEndpoint {}
// Every method takes `&self` and drives its own private `OVERLAPPED`/event
// pair per call, so concurrent callers never share mutable kernel state;
// `AsyncNamedPipe` relies on this to hand out `Arc<PipeEndpoint>` to its
// worker thread while the owning thread still calls `send`.
unsafe impl Sync for PipeEndpoint {}

impl PipeEndpoint {
    /// Creates a duplex, overlapped, single-instance named-pipe server.
    /// Grants `GENERIC_ALL` to LocalSystem and the console user when running
    /// as SYSTEM (spec §4.1); otherwise default security applies.
    pub fn create_server(name: &str) -> Result<Self, PipeError> {
        let wide = to_wide(name);

        let security = if crate::misc::is_running_as_system().unwrap_or(false) {
            build_system_pipe_security().ok()
        } else {
            None
        };
        let sa = security.as_ref().map(|s| s.attributes());

        let handle = unsafe {
            CreateNamedPipeW(
                windows::core::PCWSTR(wide.as_ptr()),
                PIPE_ACCESS_DUPLEX | FILE_FLAG_OVERLAPPED | FILE_FLAG_FIRST_PIPE_INSTANCE,
                PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE | PIPE_WAIT,
                1,
                PIPE_BUFFER_SIZE,
                PIPE_BUFFER_SIZE,
                0,
                sa.as_ref().map(|a| a as *const _),
            )
        };

        if handle.is_invalid() {
            return Err(PipeError::CreateFailed(windows::core::Error::from_win32()));
        }

        Ok(Self {
            // SAFETY: handle is a freshly created, valid, exclusively-owned pipe handle.
            handle: unsafe { Owned::new(handle) },
            role: Role::Server,
            connected: AtomicBool::new(false),
            _security: security,
        })
    }

    /// Opens an existing named pipe for read/write with overlapped I/O,
    /// retrying per spec §4.1: ~50ms backoff on `FileNotFound`, up to 250ms
    /// wait on `PipeBusy`, giving up after a 2s overall budget.
    pub fn create_client(name: &str) -> Result<Self, PipeError> {
        let wide = to_wide(name);
        let deadline = Instant::now() + CLIENT_CONNECT_BUDGET;

        loop {
            let handle = unsafe {
                CreateFileW(
                    windows::core::PCWSTR(wide.as_ptr()),
                    (FILE_GENERIC_READ | FILE_GENERIC_WRITE).0,
                    windows::Win32::Storage::FileSystem::FILE_SHARE_MODE(0),
                    None,
                    OPEN_EXISTING,
                    FILE_FLAG_OVERLAPPED,
                    None,
                )
            };

            match handle {
                Ok(handle) if !handle.is_invalid() => {
                    return Ok(Self {
                        // SAFETY: handle is freshly opened and valid.
                        handle: unsafe { Owned::new(handle) },
                        role: Role::Client,
                        connected: AtomicBool::new(true),
                        _security: None,
                    });
                }
                _ => {
                    let err = windows::core::Error::from_win32();
                    if err.code() == ERROR_PIPE_BUSY.to_hresult() {
                        unsafe {
                            let _ = WaitNamedPipeW(
                                windows::core::PCWSTR(wide.as_ptr()),
                                CLIENT_BUSY_WAIT_MS,
                            );
                        }
                    } else if err.code() == ERROR_FILE_NOT_FOUND.to_hresult() {
                        std::thread::sleep(CLIENT_RETRY_SLEEP);
                    } else {
                        return Err(PipeError::Io(err));
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(PipeError::Timeout);
            }
        }
    }

    fn raw(&self) -> HANDLE {
        *self.handle
    }

    /// Server-only: waits for a client to connect, up to `timeout`. On
    /// timeout, cancels and drains before returning.
    pub fn wait_for_client_connection(&mut self, timeout: Duration) -> bool {
        debug_assert_eq!(self.role, Role::Server);

        let event = match create_event() {
            Ok(e) => e,
            Err(_) => return false,
        };
        let mut overlapped = Box::pin(OVERLAPPED {
            hEvent: *event,
            ..Default::default()
        });

        let result = unsafe { ConnectNamedPipe(self.raw(), Some(overlapped_ptr(&mut overlapped))) };
        match result {
            Ok(()) => {
                self.connected.store(true, Ordering::Release);
                return true;
            }
            Err(e) if e.code() == ERROR_PIPE_CONNECTED.to_hresult() => {
                self.connected.store(true, Ordering::Release);
                return true;
            }
            Err(e) if e.code() == ERROR_IO_PENDING.to_hresult() => {}
            Err(_) => return false,
        }

        match self.wait_overlapped(&event, &mut overlapped, timeout) {
            Ok(_) => {
                self.connected.store(true, Ordering::Release);
                true
            }
            Err(_) => false,
        }
    }

    /// Attempts a full write within `timeout`. Returns `true` only if every
    /// byte was written. A zero-length write is a no-op returning `true`
    /// (spec §8 boundary behaviour).
    pub fn send(&self, bytes: &[u8], timeout: Duration) -> bool {
        if bytes.is_empty() {
            return true;
        }

        let event = match create_event() {
            Ok(e) => e,
            Err(_) => return false,
        };
        let mut overlapped = Box::pin(OVERLAPPED {
            hEvent: *event,
            ..Default::default()
        });

        let result = unsafe {
            WriteFile(
                self.raw(),
                Some(bytes),
                None,
                Some(overlapped_ptr(&mut overlapped)),
            )
        };
        if let Err(e) = result {
            if e.code() != ERROR_IO_PENDING.to_hresult() {
                return false;
            }
        }

        match self.wait_overlapped(&event, &mut overlapped, timeout) {
            Ok(written) => written as usize == bytes.len(),
            Err(_) => false,
        }
    }

    /// Reads up to `buffer.len()` bytes within `timeout`. A zero-length
    /// buffer returns `(Success, 0)` immediately (spec §8 boundary
    /// behaviour).
    pub fn receive(&self, buffer: &mut [u8], timeout: Duration) -> (PipeOutcome, usize) {
        if buffer.is_empty() {
            return (PipeOutcome::Success, 0);
        }

        let event = match create_event() {
            Ok(e) => e,
            Err(_) => return (PipeOutcome::Error, 0),
        };
        let mut overlapped = Box::pin(OVERLAPPED {
            hEvent: *event,
            ..Default::default()
        });

        let result = unsafe {
            ReadFile(
                self.raw(),
                Some(buffer),
                None,
                Some(overlapped_ptr(&mut overlapped)),
            )
        };
        if let Err(e) = result {
            if e.code() == ERROR_BROKEN_PIPE.to_hresult() {
                return (PipeOutcome::BrokenPipe, 0);
            }
            if e.code() != ERROR_IO_PENDING.to_hresult() {
                return (PipeOutcome::Error, 0);
            }
        }

        match self.wait_overlapped(&event, &mut overlapped, timeout) {
            Ok(read) => (PipeOutcome::Success, read as usize),
            Err(PipeError::Timeout) => (PipeOutcome::Timeout, 0),
            Err(PipeError::BrokenPipe) => (PipeOutcome::BrokenPipe, 0),
            Err(_) => (PipeOutcome::Error, 0),
        }
    }

    /// Cancels any outstanding I/O, flushes (server role only), disconnects
    /// or closes. Idempotent: safe to call repeatedly, from any thread,
    /// after the handle is already disconnected. Takes `&self` (backed by an
    /// `AtomicBool` connected flag) so `AsyncNamedPipe::stop` can call this
    /// through its shared `Arc<PipeEndpoint>` to unblock the worker thread's
    /// in-flight `receive`.
    pub fn disconnect(&self) {
        unsafe {
            let _ = CancelIoEx(self.raw(), None);
            if self.role == Role::Server {
                let _ = FlushFileBuffers(self.raw());
                let _ = DisconnectNamedPipe(self.raw());
            }
        }
        self.connected.store(false, Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Waits on `event` up to `timeout`; on timeout, cancels the pending I/O
    /// and blocks on `GetOverlappedResult(..., TRUE)` to drain it so the
    /// kernel no longer references the `OVERLAPPED` structure before this
    /// function returns (spec §4.1 invariant).
    fn wait_overlapped(
        &self,
        event: &Owned<HANDLE>,
        overlapped: &mut Pin<Box<OVERLAPPED>>,
        timeout: Duration,
    ) -> Result<u32, PipeError> {
        let wait = unsafe { WaitForSingleObject(**event, timeout.as_millis() as u32) };

        let mut transferred = 0u32;
        if wait == WAIT_OBJECT_0 {
            unsafe {
                GetOverlappedResult(self.raw(), overlapped_ptr(overlapped), &mut transferred, false)
                    .map_err(|e| {
                        if e.code() == ERROR_BROKEN_PIPE.to_hresult() {
                            PipeError::BrokenPipe
                        } else {
                            PipeError::Io(e)
                        }
                    })?;
            }
            Ok(transferred)
        } else if wait == WAIT_TIMEOUT {
            unsafe {
                let _ = CancelIoEx(self.raw(), Some(overlapped_ptr(overlapped)));
                // Must block here even though we already timed out: this is
                // the drain that guarantees the kernel is no longer
                // referencing `overlapped` once this call returns.
                let _ = GetOverlappedResult(
                    self.raw(),
                    overlapped_ptr(overlapped),
                    &mut transferred,
                    true,
                );
            }
            Err(PipeError::Timeout)
        } else {
            Err(PipeError::Io(windows::core::Error::from_win32()))
        }
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn overlapped_ptr(overlapped: &mut Pin<Box<OVERLAPPED>>) -> *mut OVERLAPPED {
    // SAFETY: the box is pinned and its address remains stable until dropped;
    // the pointer is used only for the duration of the in-flight I/O.
    unsafe { overlapped.as_mut().get_unchecked_mut() as *mut OVERLAPPED }
}

fn create_event() -> windows::core::Result<Owned<HANDLE>> {
    unsafe {
        let handle = CreateEventW(None, true, false, None)?;
        Ok(Owned::new(handle))
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A connected client/server pair, created under a private pipe name so
    /// concurrent test runs don't collide.
    fn connected_pair(tag: &str) -> (PipeEndpoint, PipeEndpoint) {
        let name = format!(
            r"\\.\pipe\sunshine_wgc_test_{}_{}",
            tag,
            std::process::id()
        );
        let mut server = PipeEndpoint::create_server(&name).expect("server create");
        let connect_thread = std::thread::spawn({
            let name = name.clone();
            move || PipeEndpoint::create_client(&name)
        });
        assert!(server.wait_for_client_connection(Duration::from_secs(2)));
        let client = connect_thread.join().unwrap().expect("client connect");
        (server, client)
    }

    #[test]
    fn zero_length_send_is_a_noop_returning_true() {
        let (server, _client) = connected_pair("zero_send");
        assert!(server.send(&[], Duration::from_millis(100)));
    }

    #[test]
    fn zero_length_receive_returns_success_with_no_bytes() {
        let (server, _client) = connected_pair("zero_recv");
        let mut buf: [u8; 0] = [];
        let (outcome, count) = server.receive(&mut buf, Duration::from_millis(100));
        assert_eq!(outcome, PipeOutcome::Success);
        assert_eq!(count, 0);
    }

    #[test]
    fn send_then_receive_round_trips_bytes() {
        let (server, client) = connected_pair("roundtrip");
        let payload = [0xDEu8, 0xAD, 0xBE, 0xEF];
        assert!(server.send(&payload, Duration::from_secs(1)));

        let mut buf = [0u8; 16];
        let (outcome, count) = client.receive(&mut buf, Duration::from_secs(1));
        assert_eq!(outcome, PipeOutcome::Success);
        assert_eq!(&buf[..count], &payload);
    }

    #[test]
    fn receive_times_out_when_nothing_is_sent() {
        let (_server, client) = connected_pair("timeout");
        let mut buf = [0u8; 16];
        let (outcome, _) = client.receive(&mut buf, Duration::from_millis(100));
        assert_eq!(outcome, PipeOutcome::Timeout);
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (mut server, _client) = connected_pair("idempotent");
        server.disconnect();
        server.disconnect();
        server.disconnect();
        assert!(!server.is_connected());
    }

    #[test]
    fn client_connect_gives_up_after_budget_when_server_absent() {
        let name = format!(
            r"\\.\pipe\sunshine_wgc_test_absent_{}",
            std::process::id()
        );
        let start = Instant::now();
        let result = PipeEndpoint::create_client(&name);
        assert!(result.is_err());
        assert!(start.elapsed() >= Duration::from_millis(1900));
    }
}
