//! Integration test for spec §8 scenario 5: two independent host/helper pairs
//! running their anonymous handshake concurrently must not cross-talk, since
//! the well-known pipe name is suffixed with the host's own pid.

use std::time::Duration;

use sunshine_wgc::handshake::{helper_handshake, host_handshake};

/// Two distinct (fake) "parent pids" run their handshakes at the same time;
/// each pair should end up with its own connected data pipe and never see
/// the other pair's bytes.
#[test]
fn two_concurrent_handshakes_do_not_cross_talk() {
    // Real pids would collide across test runs on the same machine, so two
    // offsets from the real pid keep the well-known pipe names distinct
    // without needing to spawn real processes.
    let base = std::process::id();
    let pid_a = base.wrapping_add(100_000);
    let pid_b = base.wrapping_add(200_000);

    let host_a = std::thread::spawn(move || host_handshake(pid_a));
    let host_b = std::thread::spawn(move || host_handshake(pid_b));
    std::thread::sleep(Duration::from_millis(50));

    let helper_b = std::thread::spawn(move || helper_handshake(pid_b));
    let helper_a = std::thread::spawn(move || helper_handshake(pid_a));

    let host_a = host_a.join().unwrap().expect("host a handshake");
    let host_b = host_b.join().unwrap().expect("host b handshake");
    let helper_a = helper_a.join().unwrap().expect("helper a handshake");
    let helper_b = helper_b.join().unwrap().expect("helper b handshake");

    assert!(host_a.is_connected());
    assert!(host_b.is_connected());
    assert!(helper_a.is_connected());
    assert!(helper_b.is_connected());

    // Each pair's data pipe is private: a message sent on pair A must not be
    // observable on pair B's pipe.
    assert!(host_a.send(&[0xAA], Duration::from_millis(500)));
    let mut buf = [0u8; 4];
    let (outcome, count) = helper_b.receive(&mut buf, Duration::from_millis(200));
    assert_eq!(outcome, sunshine_wgc::PipeOutcome::Timeout);
    assert_eq!(count, 0);

    let mut buf = [0u8; 4];
    let (outcome, count) = helper_a.receive(&mut buf, Duration::from_millis(500));
    assert_eq!(outcome, sunshine_wgc::PipeOutcome::Success);
    assert_eq!(&buf[..count], &[0xAA]);
}
