//! Integration test for spec §8 scenario 4: when the peer's read side is
//! never drained, `send` must eventually time out rather than block forever,
//! and the endpoint must remain usable afterwards.

use std::time::{Duration, Instant};

use sunshine_wgc::pipe::PipeEndpoint;

fn connected_pair(tag: &str) -> (PipeEndpoint, PipeEndpoint) {
    let name = format!(
        r"\\.\pipe\sunshine_wgc_itest_{}_{}",
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
fn send_times_out_once_the_unread_backlog_fills_both_buffers_and_recovers() {
    let (server, client) = connected_pair("backpressure");

    // Both the server's outbound buffer and the client's inbound buffer are
    // 64 KiB (spec §4.1); nobody ever reads on `client`'s side in this test,
    // so repeated sends eventually exhaust that headroom and `send` must
    // report failure within its own timeout instead of hanging the test.
    let payload = [0x42u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut timed_out = false;

    while Instant::now() < deadline {
        if !server.send(&payload, Duration::from_millis(100)) {
            timed_out = true;
            break;
        }
    }
    assert!(timed_out, "expected send to eventually time out against an unread peer");

    // Draining the backlog and reconnecting behaviour must not be corrupted
    // by the timed-out write: a fresh message still round-trips.
    let mut drain = [0u8; 4096];
    loop {
        let (outcome, count) = client.receive(&mut drain, Duration::from_millis(200));
        if outcome != sunshine_wgc::PipeOutcome::Success || count == 0 {
            break;
        }
    }

    assert!(server.send(&[0xAB, 0xCD], Duration::from_secs(1)));
    let mut buf = [0u8; 16];
    let (outcome, count) = client.receive(&mut buf, Duration::from_secs(1));
    assert_eq!(outcome, sunshine_wgc::PipeOutcome::Success);
    assert_eq!(&buf[..count], &[0xAB, 0xCD]);
}
