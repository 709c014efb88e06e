//! Manager-wide tunables.

use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout classes applied to connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// First read on a new connection (and TLS handshakes).
    pub init: Duration,
    /// Between messages when the client did not ask for keepalive.
    pub idle: Duration,
    /// Between messages on keepalive connections.
    pub keepalive: Duration,
    /// Value advertised to clients in the keepalive option.
    pub advertised: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init: DEFAULT_TIMEOUT,
            idle: DEFAULT_TIMEOUT,
            keepalive: DEFAULT_TIMEOUT,
            advertised: DEFAULT_TIMEOUT,
        }
    }
}

impl Timeouts {
    pub fn from_millis(init: u64, idle: u64, keepalive: u64, advertised: u64) -> Self {
        Self {
            init: Duration::from_millis(init),
            idle: Duration::from_millis(idle),
            keepalive: Duration::from_millis(keepalive),
            advertised: Duration::from_millis(advertised),
        }
    }
}

/// Socket buffer sizes. Zero keeps the operating system default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetBuffers {
    pub recv_tcp: usize,
    pub send_tcp: usize,
    pub recv_udp: usize,
    pub send_udp: usize,
}

/// Snapshot of everything a socket reads from its manager.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub timeouts: Timeouts,
    pub buffers: NetBuffers,
    /// Largest UDP datagram that is sent or received; zero disables the limit.
    pub max_udp: usize,
}
