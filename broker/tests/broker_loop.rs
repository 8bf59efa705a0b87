//! End-to-end tests of the broker command loop.
//!
//! The broker serves one end of a real socketpair from a thread, the way
//! the forked child serves the caller, so the whole wire path (framing,
//! descriptor passing, teardown) is exercised without privileges and
//! without a fork.

use std::cell::Cell;
use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::path::Path;
use std::rc::Rc;
use std::thread;

use pretty_assertions::assert_eq;
use socket2::Domain;
use socket2::Socket;
use socket2::Type;
use veldt_broker::Broker;
use veldt_broker::BrokerError;
use veldt_broker::BrokerHandle;
use veldt_broker::RelayEvent;

fn channel_pair() -> (Socket, Socket) {
    Socket::pair(Domain::UNIX, Type::SEQPACKET, None).unwrap()
}

/// Runs a broker over `end` on a background thread and returns its exit
/// result through the join handle.
fn serve(end: Socket) -> thread::JoinHandle<veldt_broker::Result<()>> {
    thread::spawn(move || Broker::new(end)?.run())
}

fn recv_nonblocking(peer: &Socket) -> Option<Vec<u8>> {
    peer.set_nonblocking(true).unwrap();
    let mut buf = [MaybeUninit::<u8>::uninit(); 32];
    let result = peer.recv(&mut buf);
    peer.set_nonblocking(false).unwrap();
    match result {
        Ok(n) => Some(buf[..n].iter().map(|b| unsafe { b.assume_init() }).collect()),
        Err(err) if err.kind() == ErrorKind::WouldBlock => None,
        Err(err) => panic!("recv failed: {err}"),
    }
}

#[test]
fn open_denies_paths_outside_the_device_allowlist() {
    let (ours, theirs) = channel_pair();
    let broker = serve(theirs);
    let mut handle = BrokerHandle::from_channel(ours);

    // A device node, but not an input or drm major.
    assert!(matches!(
        handle.open(Path::new("/dev/null"), libc::O_RDWR),
        Err(BrokerError::PolicyDenied)
    ));
    // A plain file: the broker's open(2) succeeds, classification rejects.
    let dir = tempfile::tempdir().unwrap();
    let plain = dir.path().join("plain");
    std::fs::write(&plain, b"not a device").unwrap();
    assert!(matches!(
        handle.open(&plain, libc::O_RDONLY),
        Err(BrokerError::PolicyDenied)
    ));
    // A path that does not exist at all.
    assert!(matches!(
        handle.open(Path::new("/dev/veldt-no-such-node"), libc::O_RDONLY),
        Err(BrokerError::PolicyDenied)
    ));

    handle.deinit();
    broker.join().unwrap().unwrap();
}

#[test]
fn foreign_flags_reject_before_the_filesystem_is_touched() {
    let (ours, theirs) = channel_pair();
    let broker = serve(theirs);
    let mut handle = BrokerHandle::from_channel(ours);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("should-not-exist");
    let flags = libc::O_RDWR | libc::O_CREAT | libc::O_APPEND;
    assert!(matches!(
        handle.open(&path, flags),
        Err(BrokerError::PolicyDenied)
    ));
    assert!(!path.exists());

    handle.deinit();
    broker.join().unwrap().unwrap();
}

#[test]
fn kill_handshake_stops_the_broker() {
    let (ours, theirs) = channel_pair();
    let broker = serve(theirs);
    let mut handle = BrokerHandle::from_channel(ours);

    handle.deinit();
    // Safe to repeat.
    handle.deinit();
    broker.join().unwrap().unwrap();
}

#[test]
fn dropping_the_handle_also_stops_the_broker() {
    let (ours, theirs) = channel_pair();
    let broker = serve(theirs);
    drop(BrokerHandle::from_channel(ours));
    broker.join().unwrap().unwrap();
}

#[test]
fn closing_the_channel_is_a_clean_broker_exit() {
    let (ours, theirs) = channel_pair();
    let broker = serve(theirs);
    drop(ours);
    broker.join().unwrap().unwrap();
}

#[test]
fn malformed_commands_are_fatal() {
    let (ours, theirs) = channel_pair();
    let broker = serve(theirs);

    ours.send(b"o not-a-number /dev/null\0").unwrap();
    assert!(matches!(
        broker.join().unwrap(),
        Err(BrokerError::Protocol(_))
    ));

    // The broker is gone: the next request must fail instead of hanging.
    let mut handle = BrokerHandle::from_channel(ours);
    assert!(matches!(
        handle.open(Path::new("/dev/null"), libc::O_RDONLY),
        Err(BrokerError::Transport(_))
    ));
}

#[test]
fn unknown_command_bytes_are_fatal() {
    let (ours, theirs) = channel_pair();
    let broker = serve(theirs);

    ours.send(b"z\0").unwrap();
    assert!(matches!(
        broker.join().unwrap(),
        Err(BrokerError::Protocol(_))
    ));
}

#[test]
fn tty_init_sends_the_command_exactly_once() {
    // Play the broker side ourselves so the datagrams are observable.
    let (ours, theirs) = channel_pair();
    let mut handle = BrokerHandle::from_channel(ours);

    handle.tty_init(|| (), || ()).unwrap();
    handle.tty_init(|| (), || ()).unwrap();
    handle.tty_init(|| (), || ()).unwrap();

    assert_eq!(recv_nonblocking(&theirs), Some(b"t\0".to_vec()));
    assert_eq!(recv_nonblocking(&theirs), None);
}

#[test]
fn relay_bytes_dispatch_to_the_registered_callbacks() {
    let (ours, theirs) = channel_pair();
    let mut handle = BrokerHandle::from_channel(ours);

    let activated = Rc::new(Cell::new(0u32));
    let deactivated = Rc::new(Cell::new(0u32));
    let (a, d) = (activated.clone(), deactivated.clone());
    handle
        .tty_init(
            move || a.set(a.get() + 1),
            move || d.set(d.get() + 1),
        )
        .unwrap();
    assert_eq!(recv_nonblocking(&theirs), Some(b"t\0".to_vec()));

    theirs.send(b"a").unwrap();
    assert_eq!(handle.dispatch_relay().unwrap(), RelayEvent::Activated);
    theirs.send(b"d").unwrap();
    assert_eq!(handle.dispatch_relay().unwrap(), RelayEvent::Deactivated);
    theirs.send(b"a").unwrap();
    assert_eq!(handle.dispatch_relay().unwrap(), RelayEvent::Activated);

    assert_eq!(activated.get(), 2);
    assert_eq!(deactivated.get(), 1);
}

#[test]
fn unknown_relay_bytes_are_a_protocol_error() {
    let (ours, theirs) = channel_pair();
    let mut handle = BrokerHandle::from_channel(ours);
    handle.tty_init(|| (), || ()).unwrap();
    assert_eq!(recv_nonblocking(&theirs), Some(b"t\0".to_vec()));

    theirs.send(b"q").unwrap();
    assert!(matches!(
        handle.dispatch_relay(),
        Err(BrokerError::Protocol(_))
    ));
}

#[test]
fn tty_init_without_a_controlling_vt_is_a_quiet_no_op() {
    // The test runner's stdin is a pipe or a pty, never a VT, so the broker
    // must leave signal handling and the console alone and keep serving.
    let (ours, theirs) = channel_pair();
    let broker = serve(theirs);
    let mut handle = BrokerHandle::from_channel(ours);

    handle.tty_init(|| (), || ()).unwrap();
    // Still serving requests afterwards.
    assert!(matches!(
        handle.open(Path::new("/dev/null"), libc::O_RDONLY),
        Err(BrokerError::PolicyDenied)
    ));

    handle.deinit();
    broker.join().unwrap().unwrap();
}

#[test]
fn forked_broker_serves_requests_and_deinit_leaves_no_zombie() {
    // The real fork path: the child keeps its privileges (none, here) and
    // serves; the parent drops to its own uid/gid and talks across the
    // process boundary.
    let mut handle = veldt_broker::spawn().unwrap();

    assert!(matches!(
        handle.open(Path::new("/dev/null"), libc::O_RDONLY),
        Err(BrokerError::PolicyDenied)
    ));

    handle.deinit();
    // No test in this binary forks except this one, so after the reap
    // there must be no child left at all.
    let rc = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
    let err = std::io::Error::last_os_error();
    assert_eq!(rc, -1);
    assert_eq!(err.raw_os_error(), Some(libc::ECHILD));
}

#[test]
fn open_never_sees_a_stale_reply() {
    // Back-to-back opens each consume exactly their own reply datagram.
    let (ours, theirs) = channel_pair();
    let broker = serve(theirs);
    let mut handle = BrokerHandle::from_channel(ours);

    for _ in 0..8 {
        assert!(matches!(
            handle.open(Path::new("/dev/null"), libc::O_RDONLY),
            Err(BrokerError::PolicyDenied)
        ));
    }

    handle.deinit();
    broker.join().unwrap().unwrap();
}
