//! Asynchronous network manager for DNS servers and clients.
//!
//! A [`Manager`] owns a pool of worker threads. Listeners and connections
//! for UDP, TCP, TLS, DNS over TCP/TLS and DNS over HTTP/2 are bound to a
//! worker for their whole life, and every callback for a socket runs on
//! that worker.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod manager;
pub mod mem;
pub mod net;
pub mod observability;

pub use error::{NetError, Result};
pub use manager::{Manager, NetBuffers, Settings, Timeouts};
pub use mem::{MemContext, WaterEvent};
pub use net::{
    check_addr, AcceptCb, Handle, HandleData, HttpEndpoints, Quota, RecvCb, SockType, Socket,
    SocketKind, Timer, TlsContext,
};
