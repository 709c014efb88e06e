//! Driver tasks for byte-stream sockets (TCP, TLS, TCPDNS, TLSDNS).
//!
//! Each connection runs a reader task and a writer task on its worker. The
//! writer drains a FIFO of [`WriteRequest`]s so sends complete in order.
//! Both tasks share a [`DriverGuard`]; the socket finishes when both end.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::error::{NetError, Result};
use crate::net::dns::{self, DnsFramer};
use crate::net::handle::SendCompletion;
use crate::net::socket::{self, DriverGuard, SocketInner};
use crate::observability::StatCounter;

/// Room for one maximal DNS message plus its length prefix.
const READ_BUFFER_SIZE: usize = 65537;

/// Time allowed for a final flush and shutdown after close.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Any byte stream a connection can run over.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub(crate) struct WriteRequest {
    data: Bytes,
    completion: SendCompletion,
}

/// Queue `data` on a connection's writer.
pub(crate) fn send(
    sock: &Arc<SocketInner>,
    writes: &mpsc::UnboundedSender<WriteRequest>,
    data: Bytes,
    completion: SendCompletion,
) {
    let data = if sock.kind.is_dns() {
        match dns::encode_frame(&data) {
            Ok(frame) => frame,
            Err(e) => {
                sock.core.stat(sock.kind, StatCounter::SendFail);
                completion.complete_later(Err(e));
                return;
            }
        }
    } else {
        data
    };

    if let Err(mpsc::error::SendError(request)) = writes.send(WriteRequest { data, completion }) {
        request.completion.complete_later(Err(NetError::Canceled));
    }
}

/// Start the reader and writer tasks for a connection. Must run on the
/// socket's worker.
pub(crate) fn spawn_driver<S: Io>(
    sock: Arc<SocketInner>,
    stream: S,
    writes: mpsc::UnboundedReceiver<WriteRequest>,
) {
    let guard = DriverGuard::new(sock.clone());
    let (reader, writer) = tokio::io::split(stream);
    tokio::spawn(write_loop(sock.clone(), writer, writes, guard.clone()));
    tokio::spawn(read_loop(sock, reader, guard));
}

enum ReadEvent {
    Closed,
    Wake,
    Timer,
    Read(std::io::Result<usize>),
}

async fn read_loop<S: Io>(sock: Arc<SocketInner>, mut reader: ReadHalf<S>, guard: Arc<DriverGuard>) {
    let _reservation = sock.core.mem().reserve(READ_BUFFER_SIZE);
    let mut closing = sock.closing_receiver();
    let mut framer = DnsFramer::new();
    let mut raw = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        if sock.kind.is_dns() {
            drain_messages(&sock, &mut framer);
        }
        if !sock.is_usable() {
            break;
        }

        let (reading, deadline) = sock.read_wait();
        let want_bytes = reading && !sock.is_throttled();
        let buf = if sock.kind.is_dns() {
            framer.buffer_mut()
        } else {
            &mut raw
        };
        if buf.capacity() - buf.len() < 512 {
            buf.reserve(READ_BUFFER_SIZE);
        }

        let event = tokio::select! {
            _ = socket::closed(&mut closing) => ReadEvent::Closed,
            _ = sock.read_notify.notified() => ReadEvent::Wake,
            _ = socket::sleep_until_deadline(deadline) => ReadEvent::Timer,
            res = reader.read_buf(buf), if want_bytes => ReadEvent::Read(res),
        };

        match event {
            ReadEvent::Closed => break,
            ReadEvent::Wake => continue,
            ReadEvent::Timer => sock.on_timer_expired(),
            ReadEvent::Read(Ok(0)) => {
                sock.fail_read(NetError::Eof);
                break;
            }
            ReadEvent::Read(Ok(_)) => {
                if !sock.kind.is_dns() {
                    let data = raw.split().freeze();
                    sock.deliver_read(&data);
                }
            }
            ReadEvent::Read(Err(e)) => {
                sock.fail_read(e.into());
                break;
            }
        }
    }
    drop(guard);
}

/// Deliver every buffered DNS message the socket is ready to take.
fn drain_messages(sock: &Arc<SocketInner>, framer: &mut DnsFramer) {
    let server = !sock.is_client();
    loop {
        if !sock.is_usable() || !sock.is_reading() || sock.is_throttled() {
            return;
        }
        let Some(message) = framer.next_message() else {
            return;
        };
        if server {
            sock.deliver_message(&message);
        } else {
            sock.deliver_read(&message);
        }
    }
}

async fn write_loop<S: Io>(
    sock: Arc<SocketInner>,
    mut writer: WriteHalf<S>,
    mut writes: mpsc::UnboundedReceiver<WriteRequest>,
    guard: Arc<DriverGuard>,
) {
    let mut closing = sock.closing_receiver();

    loop {
        let request = tokio::select! {
            biased;
            request = writes.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = socket::closed(&mut closing) => break,
        };

        match write_one(&mut writer, &request.data, sock.write_timeout()).await {
            Ok(()) => request.completion.complete(Ok(())),
            Err(e) => {
                sock.core.stat(sock.kind, StatCounter::SendFail);
                tracing::debug!(socket = %sock.id, peer = %sock.peer, error = %e, "Write failed");
                request.completion.complete(Err(e));
                sock.close(None);
                break;
            }
        }
    }

    writes.close();
    while let Ok(request) = writes.try_recv() {
        request.completion.complete(Err(NetError::Canceled));
    }
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
    drop(guard);
}

async fn write_one<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8], timeout: Duration) -> Result<()> {
    let write = async {
        writer.write_all(data).await?;
        writer.flush().await
    };
    if timeout.is_zero() {
        return Ok(write.await?);
    }
    match tokio::time::timeout(timeout, write).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(NetError::TimedOut),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_one_times_out_on_stalled_peer() {
        // Nobody reads the other end, so the small pipe fills up.
        let (mut near, _far) = tokio::io::duplex(16);
        let err = write_one(&mut near, &[0u8; 1024], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, NetError::TimedOut);
    }

    #[tokio::test]
    async fn write_one_without_timeout() {
        let (mut near, mut far) = tokio::io::duplex(64);
        write_one(&mut near, b"abc", Duration::ZERO).await.unwrap();
        let mut buf = [0u8; 3];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
    }
}
