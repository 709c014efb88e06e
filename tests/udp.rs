//! UDP listener and client behaviour.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use netmgr::net::SocketState;
use netmgr::{NetError, SocketKind};

mod common;
use common::{localhost, WAIT};

fn peer() -> UdpSocket {
    let socket = UdpSocket::bind(localhost()).unwrap();
    socket.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    socket
}

#[test]
fn listener_echoes_datagrams() {
    let mgr = common::manager(2);
    let listener = mgr.listen_udp(localhost(), common::echo).unwrap();
    assert_eq!(listener.kind(), SocketKind::Udp);

    let client = peer();
    client.set_read_timeout(Some(WAIT)).unwrap();
    for message in [&b"first"[..], b"second"] {
        client.send_to(message, listener.local_addr()).unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], message);
        assert_eq!(from, listener.local_addr());
    }

    listener.stop_listening();
    assert!(common::wait_until(WAIT, || mgr.socket_count() == 0));
    mgr.destroy();
}

#[test]
fn oversized_datagrams_are_dropped() {
    let mgr = common::manager(1);
    mgr.set_max_udp(64);
    let listener = mgr.listen_udp(localhost(), common::echo).unwrap();

    let client = peer();
    client.send_to(&[0u8; 100], listener.local_addr()).unwrap();
    let mut buf = [0u8; 256];
    assert!(client.recv_from(&mut buf).is_err());

    client.send_to(&[1u8; 10], listener.local_addr()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(n, 10);

    mgr.destroy();
}

#[test]
fn request_handles_leave_the_listener_alone() {
    let mgr = common::manager(1);
    let armed = Arc::new(AtomicUsize::new(0));
    let seen = armed.clone();
    let listener = mgr
        .listen_udp(localhost(), move |handle, result| {
            let Ok(data) = result else { return };
            handle.set_timeout(Duration::from_millis(50));
            if handle.timer_running() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            handle.pause_read();
            handle.cancel_read();
            handle.read(|_, _| {});
            handle.send(data.to_vec(), |_, _| {});
        })
        .unwrap();

    let client = peer();
    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut buf = [0u8; 64];
    for message in [&b"one"[..], b"two"] {
        client.send_to(message, listener.local_addr()).unwrap();
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], message);
        // Outlive the timeout set from the callback.
        std::thread::sleep(Duration::from_millis(300));
    }

    assert_eq!(armed.load(Ordering::SeqCst), 0);
    assert_eq!(listener.state(), SocketState::Listening);
    assert_eq!(mgr.socket_count(), 2);

    listener.stop_listening();
    assert!(common::wait_until(WAIT, || mgr.socket_count() == 0));
    mgr.destroy();
}

#[test]
fn connected_socket_reads_one_reply() {
    let mgr = common::manager(1);
    let server = peer();
    server.set_read_timeout(Some(WAIT)).unwrap();
    let server_addr = server.local_addr().unwrap();

    let handle = common::connect(|cb| mgr.udp_connect(localhost(), server_addr, cb, WAIT)).unwrap();
    assert!(!handle.is_stream());
    assert_eq!(handle.peer_addr(), server_addr);

    let replies = common::collect(&handle);
    common::send_sync(&handle, b"query").unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = server.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"query");
    server.send_to(b"answer", from).unwrap();

    assert_eq!(replies.recv_timeout(WAIT).unwrap().unwrap(), b"answer");

    drop(handle);
    assert!(common::wait_until(WAIT, || mgr.socket_count() == 0));
    mgr.destroy();
}

#[test]
fn read_timeout_is_reported_once() {
    let mgr = common::manager(1);
    let silent = peer();

    let handle = common::connect(|cb| {
        mgr.udp_connect(localhost(), silent.local_addr().unwrap(), cb, Duration::from_millis(100))
    })
    .unwrap();
    let results = common::collect(&handle);

    assert_eq!(results.recv_timeout(WAIT).unwrap(), Err(NetError::TimedOut));
    assert!(results.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(!handle.timer_running());

    drop(handle);
    mgr.destroy();
}

#[test]
fn paused_manager_delivers_nothing() {
    let mgr = common::manager(2);
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let listener = mgr
        .listen_udp(localhost(), move |_, result| {
            if result.is_ok() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();

    mgr.pause();
    let client = peer();
    client.send_to(b"while paused", listener.local_addr()).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    mgr.resume();
    assert!(common::wait_until(WAIT, || seen.load(Ordering::SeqCst) == 1));

    mgr.destroy();
}

#[test]
fn shutdown_cancels_active_reads() {
    let mgr = common::manager(1);
    let silent = peer();
    let handle = common::connect(|cb| {
        mgr.udp_connect(localhost(), silent.local_addr().unwrap(), cb, Duration::from_secs(60))
    })
    .unwrap();
    let results = common::collect(&handle);

    mgr.destroy();
    assert_eq!(results.recv_timeout(WAIT).unwrap(), Err(NetError::ShuttingDown));
    drop(handle);
}
