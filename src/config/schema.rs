//! Configuration schema definitions.
//!
//! This module defines the configuration of the `netmgrd` daemon. All types
//! derive Serde traits for deserialization from TOML.

use serde::{Deserialize, Serialize};

use crate::manager::{NetBuffers, Timeouts};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetmgrConfig {
    /// Number of worker threads; 0 means one per CPU.
    pub workers: usize,

    /// Connection timeouts.
    pub timeouts: TimeoutConfig,

    /// Socket buffer sizes.
    pub buffers: BufferConfig,

    /// Largest UDP datagram to send or accept; 0 means no limit.
    pub max_udp: usize,

    /// Named connection quotas that listeners can refer to.
    pub quotas: Vec<QuotaConfig>,

    /// Listening sockets.
    pub listeners: Vec<ListenerConfig>,

    /// Memory accounting.
    pub memory: MemoryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl Default for NetmgrConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            timeouts: TimeoutConfig::default(),
            buffers: BufferConfig::default(),
            max_udp: 0,
            quotas: Vec::new(),
            listeners: Vec::new(),
            memory: MemoryConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl NetmgrConfig {
    /// Worker count with 0 resolved to the number of CPUs.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            std::thread::available_parallelism().map_or(1, |n| n.get())
        }
    }

    pub fn quota(&self, name: &str) -> Option<&QuotaConfig> {
        self.quotas.iter().find(|q| q.name == name)
    }
}

/// Timeout configuration, in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Initial timeout: connect, TLS handshake, first message.
    pub init_ms: u64,

    /// Idle timeout between messages.
    pub idle_ms: u64,

    /// Idle timeout once the client asked for keepalive.
    pub keepalive_ms: u64,

    /// Keepalive timeout advertised to clients.
    pub advertised_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            init_ms: 30_000,
            idle_ms: 30_000,
            keepalive_ms: 30_000,
            advertised_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts::from_millis(self.init_ms, self.idle_ms, self.keepalive_ms, self.advertised_ms)
    }
}

/// Socket buffer sizes in bytes; 0 keeps the OS default.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    pub recv_tcp: usize,
    pub send_tcp: usize,
    pub recv_udp: usize,
    pub send_udp: usize,
}

impl BufferConfig {
    pub fn to_net_buffers(&self) -> NetBuffers {
        NetBuffers {
            recv_tcp: self.recv_tcp,
            send_tcp: self.send_tcp,
            recv_udp: self.recv_udp,
            send_udp: self.send_udp,
        }
    }
}

/// A named connection quota.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    pub name: String,

    /// Hard limit on concurrent connections; 0 means unlimited.
    pub max: usize,

    /// Soft limit; connections above it are logged. 0 disables it.
    #[serde(default)]
    pub soft: usize,
}

/// Transport served by a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    Udp,
    Tcp,
    Tls,
    TcpDns,
    TlsDns,
    Http,
}

impl ListenerKind {
    pub fn needs_tls(&self) -> bool {
        matches!(self, ListenerKind::Tls | ListenerKind::TlsDns)
    }

    pub fn is_stream(&self) -> bool {
        !matches!(self, ListenerKind::Udp)
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub kind: ListenerKind,

    /// Bind address (e.g., "0.0.0.0:53").
    pub address: String,

    /// Listen backlog for stream listeners.
    #[serde(default = "default_backlog")]
    pub backlog: i32,

    /// Name of a quota from `[[quotas]]`.
    #[serde(default)]
    pub quota: Option<String>,

    /// TLS configuration; required for tls and tlsdns, optional for http.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// HTTP paths served by an http listener.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Concurrent HTTP/2 streams per connection; 0 uses the default.
    #[serde(default)]
    pub max_concurrent_streams: u32,
}

fn default_backlog() -> i32 {
    128
}

fn default_endpoints() -> Vec<String> {
    vec![crate::net::http::DEFAULT_PATH.to_string()]
}

/// TLS configuration for a listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Memory water marks in bytes. A zero high mark disables them.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub hi_water: usize,
    pub lo_water: usize,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config: NetmgrConfig = toml::from_str("").unwrap();
        assert_eq!(config.timeouts.init_ms, 30_000);
        assert!(config.listeners.is_empty());
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn parses_listeners_and_quotas() {
        let config: NetmgrConfig = toml::from_str(
            r#"
            workers = 2
            max_udp = 1232

            [timeouts]
            init_ms = 5000

            [[quotas]]
            name = "tcp-clients"
            max = 100
            soft = 90

            [[listeners]]
            kind = "tcpdns"
            address = "127.0.0.1:5300"
            quota = "tcp-clients"

            [[listeners]]
            kind = "http"
            address = "127.0.0.1:8443"
            tls = { cert_path = "cert.pem", key_path = "key.pem" }
            "#,
        )
        .unwrap();

        assert_eq!(config.worker_count(), 2);
        assert_eq!(config.timeouts.to_timeouts().init.as_millis(), 5000);
        assert_eq!(config.timeouts.idle_ms, 30_000);
        assert_eq!(config.quota("tcp-clients").map(|q| q.soft), Some(90));
        assert_eq!(config.listeners[0].kind, ListenerKind::TcpDns);
        assert_eq!(config.listeners[0].backlog, 128);
        assert_eq!(config.listeners[1].endpoints, vec!["/dns-query".to_string()]);
        assert!(config.listeners[1].tls.is_some());
    }
}
