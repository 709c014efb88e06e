//! Socket statistics.
//!
//! The manager reports socket events to an optional [`StatsSink`]. The
//! default sink, [`MetricsSink`], publishes them through the `metrics` facade,
//! and [`init_metrics`] exposes them to Prometheus.
//!
//! # Metrics
//! - `netmgr_socket_events_total{kind, event}`: counter
//! - `netmgr_active_sockets{kind}`: gauge

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::net::SocketKind;

/// Per-socket events counted by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatCounter {
    Open,
    OpenFail,
    Close,
    BindFail,
    ConnectFail,
    Connect,
    AcceptFail,
    Accept,
    SendFail,
    RecvFail,
    Active,
}

impl StatCounter {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatCounter::Open => "open",
            StatCounter::OpenFail => "open_fail",
            StatCounter::Close => "close",
            StatCounter::BindFail => "bind_fail",
            StatCounter::ConnectFail => "connect_fail",
            StatCounter::Connect => "connect",
            StatCounter::AcceptFail => "accept_fail",
            StatCounter::Accept => "accept",
            StatCounter::SendFail => "send_fail",
            StatCounter::RecvFail => "recv_fail",
            StatCounter::Active => "active",
        }
    }
}

/// Receiver for socket statistics.
pub trait StatsSink: Send + Sync {
    fn increment(&self, kind: SocketKind, counter: StatCounter);

    /// Only gauges ([`StatCounter::Active`]) are ever decremented.
    fn decrement(&self, kind: SocketKind, counter: StatCounter);
}

/// [`StatsSink`] backed by the global `metrics` recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsSink;

impl StatsSink for MetricsSink {
    fn increment(&self, kind: SocketKind, counter: StatCounter) {
        match counter {
            StatCounter::Active => {
                metrics::gauge!("netmgr_active_sockets", "kind" => kind.as_str()).increment(1.0)
            }
            _ => metrics::counter!(
                "netmgr_socket_events_total",
                "kind" => kind.as_str(),
                "event" => counter.as_str()
            )
            .increment(1),
        }
    }

    fn decrement(&self, kind: SocketKind, counter: StatCounter) {
        if counter == StatCounter::Active {
            metrics::gauge!("netmgr_active_sockets", "kind" => kind.as_str()).decrement(1.0);
        }
    }
}

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}
