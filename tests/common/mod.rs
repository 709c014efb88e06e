//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use netmgr::{Handle, Manager, NetError, TlsContext};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn localhost() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn manager(workers: usize) -> Manager {
    Manager::new(workers).unwrap()
}

/// Poll `f` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    f()
}

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

pub fn server_tls() -> TlsContext {
    TlsContext::server_from_files(&fixture("cert.pem"), &fixture("key.pem")).unwrap()
}

pub fn client_tls() -> TlsContext {
    TlsContext::client_from_ca_file(&fixture("ca.pem")).unwrap()
}

/// Receive callback that answers every message with itself.
pub fn echo(handle: &Handle, result: netmgr::Result<&[u8]>) {
    if let Ok(data) = result {
        handle.send(data.to_vec(), |_, _| {});
    }
}

/// Turn a callback-style connect into a blocking call.
pub fn connect(start: impl FnOnce(Box<dyn FnOnce(netmgr::Result<Handle>) + Send>)) -> netmgr::Result<Handle> {
    let (tx, rx) = mpsc::channel();
    start(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.recv_timeout(WAIT).expect("connect callback never ran")
}

/// Read callback that forwards every result to a channel.
pub fn collect(handle: &Handle) -> mpsc::Receiver<netmgr::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::channel();
    handle.read(move |_, result| {
        let _ = tx.send(result.map(<[u8]>::to_vec));
    });
    rx
}

/// Send and wait for the completion.
pub fn send_sync(handle: &Handle, data: &[u8]) -> netmgr::Result<()> {
    let (tx, rx) = mpsc::channel();
    handle.send(data.to_vec(), move |_, result| {
        let _ = tx.send(result);
    });
    rx.recv_timeout(WAIT).unwrap_or(Err(NetError::TimedOut))
}

/// Write one length-prefixed DNS message on a plain socket.
pub fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
    let frame = netmgr::net::encode_frame(payload).unwrap();
    stream.write_all(&frame).unwrap();
}

/// Read one length-prefixed DNS message from a plain socket.
pub fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len = [0u8; 2];
    stream.read_exact(&mut len)?;
    let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn blocking_stream(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    stream
}
