//! Network layer.
//!
//! # Data Flow
//! ```text
//! Manager::listen_* / *_connect
//!     → sockopt.rs (socket2: bind, buffers, linger)
//!     → udp.rs | tcp.rs (+ tls.rs handshake)
//!     → socket.rs (arena entry, state, read timer, handles)
//!     → driver task on the owning worker:
//!         udp.rs      datagrams
//!         stream.rs   raw bytes, or dns.rs framing for TCPDNS/TLSDNS
//!         http/       hyper HTTP/2 sessions
//!     → application callbacks with a Handle
//! ```
//!
//! Socket States:
//!     Listening | Connecting → Active → Closing → Closed

pub mod dns;
pub mod handle;
pub mod http;
pub mod quota;
pub mod socket;
pub(crate) mod sockopt;
pub(crate) mod stream;
pub mod tcp;
pub mod timer;
pub mod tls;
pub mod udp;

use std::net::SocketAddr;

use socket2::{Protocol, Type};

use crate::error::{NetError, Result};
use crate::manager::Manager;

pub use dns::{encode_frame, DnsFramer, MAX_DNS_MESSAGE};
pub use handle::{AcceptCb, Handle, HandleData, RecvCb};
pub use http::{make_uri, path_is_valid, HttpEndpoints, UriTarget};
pub use quota::{Quota, QuotaPermit};
pub use socket::{SockType, Socket, SocketId, SocketKind, SocketState};
pub use timer::Timer;
pub use tls::TlsContext;

/// Check that `addr` can be bound with the given socket type, releasing it
/// right away.
pub fn check_addr(addr: SocketAddr, ty: SockType) -> Result<()> {
    let (ty, protocol) = match ty {
        SockType::Tcp => (Type::STREAM, Protocol::TCP),
        SockType::Udp => (Type::DGRAM, Protocol::UDP),
        SockType::Unix | SockType::Raw => return Err(NetError::NotImplemented),
    };
    sockopt::probe(addr, ty, protocol).map_err(NetError::from)
}

impl Manager {
    /// Routing-socket transport. Not available on any supported platform;
    /// `cb` is never called.
    pub fn route_connect<F>(&self, cb: F) -> Result<()>
    where
        F: FnOnce(Result<Handle>) + Send + 'static,
    {
        drop(cb);
        Err(NetError::NotImplemented)
    }
}
