//! Raw TCP and TLS streams: echo, quotas, timers, cancellation.

use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::time::Duration;

use netmgr::{Handle, NetError, Quota, SocketKind};

mod common;
use common::{localhost, WAIT};

fn read_echo(handle: &Handle) -> netmgr::Result<()> {
    handle.read(common::echo);
    Ok(())
}

/// True once the server has closed or reset the connection.
fn closed_by_peer(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
    }
}

#[test]
fn tcp_echo_round_trip() {
    let mgr = common::manager(2);
    let listener = mgr.listen_tcp(localhost(), read_echo, 16, None).unwrap();
    assert_eq!(listener.kind(), SocketKind::Tcp);

    let handle = common::connect(|cb| mgr.tcp_connect(localhost(), listener.local_addr(), cb, WAIT)).unwrap();
    assert!(handle.is_stream());
    assert!(!handle.has_encryption());
    let replies = common::collect(&handle);

    common::send_sync(&handle, b"hello").unwrap();
    assert_eq!(replies.recv_timeout(WAIT).unwrap().unwrap(), b"hello");

    drop(handle);
    listener.stop_listening();
    assert!(common::wait_until(WAIT, || mgr.socket_count() == 0));
    mgr.destroy();
}

#[test]
fn quota_rejects_connections_over_the_limit() {
    let mgr = common::manager(1);
    let quota = Quota::new(2);
    let listener = mgr
        .listen_tcp(localhost(), read_echo, 16, Some(quota.clone()))
        .unwrap();
    let addr = listener.local_addr();

    let first = common::blocking_stream(addr);
    let _second = common::blocking_stream(addr);
    assert!(common::wait_until(WAIT, || quota.used() == 2));

    let mut third = common::blocking_stream(addr);
    assert!(closed_by_peer(&mut third));
    assert_eq!(quota.used(), 2);

    drop(first);
    assert!(common::wait_until(WAIT, || quota.used() == 1));
    let _fourth = common::blocking_stream(addr);
    assert!(common::wait_until(WAIT, || quota.used() == 2));

    mgr.destroy();
}

#[test]
fn accept_callback_error_closes_connection() {
    let mgr = common::manager(1);
    let listener = mgr
        .listen_tcp(localhost(), |_| Err(NetError::Canceled), 16, None)
        .unwrap();

    let mut stream = common::blocking_stream(listener.local_addr());
    assert!(closed_by_peer(&mut stream));
    mgr.destroy();
}

#[test]
fn read_timeout_fires_once_then_closes() {
    let mgr = common::manager(1);
    let listener = mgr.listen_tcp(localhost(), read_echo, 16, None).unwrap();
    let handle = common::connect(|cb| mgr.tcp_connect(localhost(), listener.local_addr(), cb, WAIT)).unwrap();

    let results = common::collect(&handle);
    handle.set_timeout(Duration::from_millis(100));
    assert!(handle.timer_running());

    assert_eq!(results.recv_timeout(WAIT).unwrap(), Err(NetError::TimedOut));
    assert!(results.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(
        common::send_sync(&handle, b"late"),
        Err(NetError::Canceled)
    );

    drop(handle);
    mgr.destroy();
}

#[test]
fn timeout_can_be_rearmed_from_the_callback() {
    let mgr = common::manager(1);
    let listener = mgr.listen_tcp(localhost(), read_echo, 16, None).unwrap();
    let handle = common::connect(|cb| mgr.tcp_connect(localhost(), listener.local_addr(), cb, WAIT)).unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    handle.read(move |handle, result| {
        if result == Err(NetError::TimedOut) && tx.send(()).is_ok() {
            handle.set_timeout(Duration::from_millis(50));
        }
    });
    handle.set_timeout(Duration::from_millis(50));

    for _ in 0..3 {
        rx.recv_timeout(WAIT).unwrap();
    }
    drop(rx);
    drop(handle);
    mgr.destroy();
}

#[test]
fn cleared_timeout_never_fires() {
    let mgr = common::manager(1);
    let listener = mgr.listen_tcp(localhost(), read_echo, 16, None).unwrap();
    let handle = common::connect(|cb| mgr.tcp_connect(localhost(), listener.local_addr(), cb, WAIT)).unwrap();

    let results = common::collect(&handle);
    handle.set_timeout(Duration::from_millis(50));
    handle.clear_timeout();
    assert!(!handle.timer_running());
    assert!(results.recv_timeout(Duration::from_millis(300)).is_err());

    drop(handle);
    mgr.destroy();
}

#[test]
fn cancel_read_is_idempotent() {
    let mgr = common::manager(1);
    let listener = mgr.listen_tcp(localhost(), read_echo, 16, None).unwrap();
    let handle = common::connect(|cb| mgr.tcp_connect(localhost(), listener.local_addr(), cb, WAIT)).unwrap();

    let results = common::collect(&handle);
    handle.cancel_read();
    handle.cancel_read();

    assert_eq!(results.recv_timeout(WAIT).unwrap(), Err(NetError::Canceled));
    assert!(results.recv_timeout(Duration::from_millis(200)).is_err());

    drop(handle);
    mgr.destroy();
}

#[test]
fn refused_connection_is_reported() {
    let mgr = common::manager(1);
    let unused = std::net::TcpListener::bind(localhost()).unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let result = common::connect(|cb| mgr.tcp_connect(localhost(), addr, cb, WAIT));
    assert_eq!(result.unwrap_err(), NetError::ConnectionRefused);
    mgr.destroy();
}

#[test]
fn stopped_listener_refuses_new_connections() {
    let mgr = common::manager(2);
    let listener = mgr.listen_tcp(localhost(), read_echo, 16, None).unwrap();
    let addr = listener.local_addr();

    listener.stop_listening();
    listener.stop_listening();
    assert!(common::wait_until(WAIT, || mgr.socket_count() == 0));
    assert!(TcpStream::connect(addr).is_err());
    mgr.destroy();
}

#[test]
fn tls_echo_round_trip() {
    let mgr = common::manager(2);
    let listener = mgr
        .listen_tls(localhost(), read_echo, 16, None, &common::server_tls())
        .unwrap();
    let client_tls = common::client_tls();

    let handle = common::connect(|cb| {
        mgr.tls_connect(localhost(), listener.local_addr(), cb, &client_tls, WAIT)
    })
    .unwrap();
    assert!(handle.has_encryption());
    assert_eq!(handle.socket_kind(), SocketKind::Tls);

    let replies = common::collect(&handle);
    common::send_sync(&handle, b"over tls").unwrap();
    assert_eq!(replies.recv_timeout(WAIT).unwrap().unwrap(), b"over tls");

    drop(handle);
    mgr.destroy();
}

#[test]
fn tls_rejects_mismatched_server_name() {
    let mgr = common::manager(1);
    let listener = mgr
        .listen_tls(localhost(), read_echo, 16, None, &common::server_tls())
        .unwrap();
    let client_tls = common::client_tls().with_server_name("example.com").unwrap();

    let result = common::connect(|cb| {
        mgr.tls_connect(localhost(), listener.local_addr(), cb, &client_tls, WAIT)
    });
    assert!(matches!(result, Err(NetError::Tls(_))));
    mgr.destroy();
}
