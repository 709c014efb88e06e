//! Result codes shared by every transport.
//!
//! Asynchronous failures travel through the same callback as success, so the
//! error type is cheap to clone and compare.

use std::io;
use std::sync::Arc;

/// Error type for network manager operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetError {
    #[error("not implemented")]
    NotImplemented,

    #[error("quota reached")]
    Quota,

    #[error("timed out")]
    TimedOut,

    #[error("operation canceled")]
    Canceled,

    #[error("end of file")]
    Eof,

    #[error("connection reset")]
    ConnectionReset,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("socket is not connected")]
    NotConnected,

    #[error("message too large ({0} bytes)")]
    MessageTooLarge(usize),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("bad address")]
    BadAddress,

    #[error("address in use")]
    AddressInUse,

    #[error("address not available")]
    AddressNotAvailable,

    #[error("network manager is shutting down")]
    ShuttingDown,

    #[error("not enough space: need {needed} bytes, have {capacity}")]
    NoSpace { needed: usize, capacity: usize },

    #[error("endpoint set is frozen")]
    EndpointsFrozen,

    #[error("invalid HTTP path: {0}")]
    InvalidPath(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
}

/// Result alias used across the crate.
pub type Result<T, E = NetError> = std::result::Result<T, E>;

impl NetError {
    /// True for results that end a connection rather than a single request.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NetError::TimedOut | NetError::Canceled | NetError::Http(_))
    }
}

impl PartialEq for NetError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NetError::Io(a), NetError::Io(b)) => a.kind() == b.kind(),
            (NetError::MessageTooLarge(a), NetError::MessageTooLarge(b)) => a == b,
            (NetError::Protocol(a), NetError::Protocol(b)) => a == b,
            (NetError::InvalidPath(a), NetError::InvalidPath(b)) => a == b,
            (NetError::Tls(a), NetError::Tls(b)) => a == b,
            (NetError::Http(a), NetError::Http(b)) => a == b,
            (
                NetError::NoSpace { needed: a, capacity: b },
                NetError::NoSpace { needed: c, capacity: d },
            ) => a == c && b == d,
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => NetError::TimedOut,
            io::ErrorKind::UnexpectedEof => NetError::Eof,
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                NetError::ConnectionReset
            }
            io::ErrorKind::ConnectionAborted => NetError::ConnectionReset,
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::NotConnected => NetError::NotConnected,
            io::ErrorKind::AddrInUse => NetError::AddressInUse,
            io::ErrorKind::AddrNotAvailable => NetError::AddressNotAvailable,
            io::ErrorKind::Unsupported => NetError::NotImplemented,
            _ => NetError::Io(Arc::new(err)),
        }
    }
}

impl From<rustls::Error> for NetError {
    fn from(err: rustls::Error) -> Self {
        NetError::Tls(err.to_string())
    }
}

impl From<hyper::Error> for NetError {
    fn from(err: hyper::Error) -> Self {
        if err.is_timeout() {
            NetError::TimedOut
        } else if err.is_canceled() || err.is_closed() {
            NetError::Canceled
        } else {
            NetError::Http(err.to_string())
        }
    }
}

impl From<http::Error> for NetError {
    fn from(err: http::Error) -> Self {
        NetError::Http(err.to_string())
    }
}
