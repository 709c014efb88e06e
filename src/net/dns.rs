//! DNS over TCP and TLS: two-byte length framing (RFC 1035 section 4.2.2).
//!
//! On the server side every complete message is delivered on its own
//! handle, so queries on one connection can be answered out of order. A
//! connection stops reading while more than
//! [`STREAM_CLIENTS_PER_CONN`](crate::net::socket::STREAM_CLIENTS_PER_CONN)
//! of its messages are unanswered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NetError, Result};
use crate::manager::Manager;
use crate::net::handle::{AcceptCb, ConnectCompletion, Handle};
use crate::net::socket::{Socket, SocketKind};
use crate::net::tcp::{self, ConnectRequest, ListenSpec};
use crate::net::tls::TlsContext;

/// Largest payload a two-byte length prefix can describe.
pub const MAX_DNS_MESSAGE: usize = 65535;

/// Reassembles length-prefixed messages from a byte stream.
#[derive(Debug, Default)]
pub struct DnsFramer {
    buf: BytesMut,
}

impl DnsFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_DNS_MESSAGE + 2),
        }
    }

    /// Append bytes read from the stream.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Next complete message, if one is buffered. Zero-length messages are
    /// returned as empty payloads.
    pub fn next_message(&mut self) -> Option<Bytes> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = usize::from(u16::from_be_bytes([self.buf[0], self.buf[1]]));
        if self.buf.len() < 2 + len {
            return None;
        }
        self.buf.advance(2);
        Some(self.buf.split_to(len).freeze())
    }

    /// Bytes held that do not yet form a complete message.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let len = u16::try_from(payload.len()).map_err(|_| NetError::MessageTooLarge(payload.len()))?;
    let mut frame = BytesMut::with_capacity(payload.len() + 2);
    frame.put_u16(len);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

impl Manager {
    /// Listen for DNS over TCP. `recv` gets one call per message, each on a
    /// fresh handle.
    pub fn listen_tcpdns<R>(
        &self,
        iface: SocketAddr,
        recv: R,
        accept: Option<AcceptCb>,
        backlog: i32,
        quota: Option<crate::net::Quota>,
    ) -> Result<Socket>
    where
        R: Fn(&Handle, Result<&[u8]>) + Send + Sync + 'static,
    {
        tcp::listen_stream(
            self.core(),
            iface,
            backlog,
            ListenSpec {
                kind: SocketKind::TcpDns,
                accept,
                recv: Some(Arc::new(recv)),
                quota,
                tls: None,
                http: None,
            },
        )
    }

    /// Listen for DNS over TLS. A connection that negotiated the `dot` ALPN
    /// token allows zone transfers.
    pub fn listen_tlsdns<R>(
        &self,
        iface: SocketAddr,
        recv: R,
        accept: Option<AcceptCb>,
        backlog: i32,
        quota: Option<crate::net::Quota>,
        tls: &TlsContext,
    ) -> Result<Socket>
    where
        R: Fn(&Handle, Result<&[u8]>) + Send + Sync + 'static,
    {
        let tls = tls.with_alpn(&[b"dot"]);
        tcp::listen_stream(
            self.core(),
            iface,
            backlog,
            ListenSpec {
                kind: SocketKind::TlsDns,
                accept,
                recv: Some(Arc::new(recv)),
                quota,
                tls: Some(tls.acceptor()?),
                http: None,
            },
        )
    }

    /// Connect for DNS over TCP. A zero `timeout` uses the initial timeout.
    pub fn tcpdns_connect<F>(&self, local: SocketAddr, peer: SocketAddr, cb: F, timeout: Duration)
    where
        F: FnOnce(Result<Handle>) + Send + 'static,
    {
        tcp::connect_stream(
            self.core(),
            ConnectRequest {
                kind: SocketKind::TcpDns,
                local,
                peer,
                timeout,
                tls: None,
                http: None,
            },
            ConnectCompletion::new(cb),
        );
    }

    /// Connect for DNS over TLS, offering the `dot` ALPN token.
    pub fn tlsdns_connect<F>(
        &self,
        local: SocketAddr,
        peer: SocketAddr,
        cb: F,
        tls: &TlsContext,
        timeout: Duration,
    ) where
        F: FnOnce(Result<Handle>) + Send + 'static,
    {
        tcp::connect_stream(
            self.core(),
            ConnectRequest {
                kind: SocketKind::TlsDns,
                local,
                peer,
                timeout,
                tls: Some(tls.with_alpn(&[b"dot"])),
                http: None,
            },
            ConnectCompletion::new(cb),
        );
    }
}
