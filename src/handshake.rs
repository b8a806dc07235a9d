//! C2: anonymous handshake. The host listens on a well-known pipe name
//! (`SunshineWGCPipe_<parent_pid>`), accepts the helper's connection, sends a
//! freshly generated per-session data-pipe name, and waits for the ACK byte
//! before tearing the well-known pipe down. Grounded on
//! `examples/original_source/src/platform/windows/ipc/ipc_session.cpp`
//! (`SessionHost::run_handshake`/`SessionClient::run_handshake`).

use std::time::Duration;

use crate::error::SessionError;
use crate::misc::generate_guid;
use crate::pipe::PipeEndpoint;
use crate::wire::{ConnectionMessage, HANDSHAKE_PIPE_PREFIX, MSG_ACK};

const HANDSHAKE_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_SEND_TIMEOUT: Duration = Duration::from_secs(2);
const HANDSHAKE_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Well-known handshake pipe name for a host process with the given pid.
pub fn well_known_pipe_name(parent_pid: u32) -> String {
    format!(r"\\.\pipe\{}{}", HANDSHAKE_PIPE_PREFIX, parent_pid)
}

/// Host side: accepts one helper connection on the well-known pipe, hands it
/// a fresh per-session data pipe name, waits for the ACK, and returns the
/// already-connected data pipe. The well-known pipe is torn down as soon as
/// this returns (it is single-use, per spec §4.2).
pub fn host_handshake(parent_pid: u32) -> Result<PipeEndpoint, SessionError> {
    let well_known_name = well_known_pipe_name(parent_pid);
    let mut well_known = PipeEndpoint::create_server(&well_known_name)
        .map_err(|_| SessionError::HandshakeFailed)?;

    if !well_known.wait_for_client_connection(HANDSHAKE_ACCEPT_TIMEOUT) {
        return Err(SessionError::HandshakeFailed);
    }

    let session_guid = generate_guid().map_err(|_| SessionError::HandshakeFailed)?;
    let data_pipe_name = format!(r"\\.\pipe\{}", session_guid);

    let message = ConnectionMessage::new(&data_pipe_name);
    let mut data_pipe = PipeEndpoint::create_server(&data_pipe_name)
        .map_err(|_| SessionError::HandshakeFailed)?;

    if !well_known.send(message.as_bytes(), HANDSHAKE_SEND_TIMEOUT) {
        return Err(SessionError::HandshakeFailed);
    }

    if !data_pipe.wait_for_client_connection(HANDSHAKE_ACCEPT_TIMEOUT) {
        return Err(SessionError::HandshakeFailed);
    }

    let mut ack = [0u8; 1];
    let (outcome, count) = data_pipe.receive(&mut ack, HANDSHAKE_ACK_TIMEOUT);
    if outcome != crate::error::PipeOutcome::Success || count != 1 || ack[0] != MSG_ACK {
        return Err(SessionError::HandshakeFailed);
    }

    well_known.disconnect();
    Ok(data_pipe)
}

/// Helper side: connects to the well-known pipe, reads the per-session pipe
/// name, connects to that pipe, and sends the ACK byte.
pub fn helper_handshake(parent_pid: u32) -> Result<PipeEndpoint, SessionError> {
    let well_known_name = well_known_pipe_name(parent_pid);
    let well_known =
        PipeEndpoint::create_client(&well_known_name).map_err(|_| SessionError::HandshakeFailed)?;

    let mut buf = [0u8; crate::wire::CONNECTION_MESSAGE_LEN * 2];
    let (outcome, count) = well_known.receive(&mut buf, HANDSHAKE_ACCEPT_TIMEOUT);
    if outcome != crate::error::PipeOutcome::Success {
        return Err(SessionError::HandshakeFailed);
    }
    let message =
        ConnectionMessage::from_bytes(&buf[..count]).ok_or(SessionError::HandshakeFailed)?;

    let data_pipe = PipeEndpoint::create_client(&message.name())
        .map_err(|_| SessionError::HandshakeFailed)?;

    if !data_pipe.send(&[MSG_ACK], HANDSHAKE_SEND_TIMEOUT) {
        return Err(SessionError::HandshakeFailed);
    }

    Ok(data_pipe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_pipe_name_includes_prefix_and_pid() {
        let name = well_known_pipe_name(4242);
        assert_eq!(name, r"\\.\pipe\SunshineWGCPipe_4242");
    }

    #[test]
    fn host_and_helper_handshake_agree_on_a_connected_data_pipe() {
        let pid = std::process::id();
        let host_thread = std::thread::spawn(move || host_handshake(pid));
        // Give the host a moment to stand up the well-known pipe before the
        // helper side starts its bounded connect-retry loop.
        std::thread::sleep(Duration::from_millis(50));
        let helper_result = helper_handshake(pid);

        let host_result = host_thread.join().unwrap();
        assert!(host_result.is_ok());
        assert!(helper_result.is_ok());
        assert!(host_result.unwrap().is_connected());
        assert!(helper_result.unwrap().is_connected());
    }
}
