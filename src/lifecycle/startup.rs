//! Startup orchestration.
//!
//! Turns a validated [`NetmgrConfig`] into a configured [`Manager`] and a
//! set of running listeners. Any listener that fails to start is fatal;
//! the ones already running are stopped before the error is returned.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::config::schema::{ListenerConfig, ListenerKind, NetmgrConfig};
use crate::error::NetError;
use crate::manager::Manager;
use crate::mem::WaterEvent;
use crate::net::{HttpEndpoints, Quota, RecvCb, Socket, TlsContext};
use crate::observability::MetricsSink;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("network manager: {0}")]
    Manager(#[from] NetError),

    #[error("listeners[{index}] ({address}): {source}")]
    Listener {
        index: usize,
        address: String,
        source: NetError,
    },

    #[error("listeners[{index}]: {message}")]
    Config { index: usize, message: String },
}

/// Start a manager sized and tuned by `config`.
pub fn configure_manager(config: &NetmgrConfig) -> Result<Manager, StartupError> {
    let manager = Manager::new(config.worker_count())?;
    apply_settings(&manager, config);

    if config.observability.metrics_enabled {
        manager.set_stats(Arc::new(MetricsSink));
    }

    let memory = &config.memory;
    if memory.hi_water > 0 {
        manager
            .memctx()
            .setwater(memory.hi_water, memory.lo_water, |ctx, event| {
                match event {
                    WaterEvent::High => {
                        tracing::warn!(context = ctx.name(), inuse = ctx.inuse(), "Memory above high water mark")
                    }
                    WaterEvent::Low => {
                        tracing::info!(context = ctx.name(), inuse = ctx.inuse(), "Memory back below low water mark")
                    }
                }
                ctx.waterack(event);
            });
    }

    Ok(manager)
}

/// Push the tunable parts of `config` into a running manager.
pub fn apply_settings(manager: &Manager, config: &NetmgrConfig) {
    manager.set_timeouts(config.timeouts.to_timeouts());
    manager.set_net_buffers(config.buffers.to_net_buffers());
    manager.set_max_udp(config.max_udp);
    tracing::debug!(
        timeouts = ?manager.timeouts(),
        max_udp = config.max_udp,
        "Manager settings applied"
    );
}

/// Listeners started from a configuration, with the quotas they share.
#[derive(Debug, Default)]
pub struct Running {
    pub listeners: Vec<Socket>,
    quotas: HashMap<String, Quota>,
}

impl Running {
    pub fn quota(&self, name: &str) -> Option<&Quota> {
        self.quotas.get(name)
    }

    /// Update the limits of quotas that exist in both configurations.
    /// Added or removed quotas take effect on restart only.
    pub fn apply_quotas(&self, config: &NetmgrConfig) {
        for q in &config.quotas {
            match self.quotas.get(&q.name) {
                Some(quota) => {
                    quota.set_max(q.max);
                    quota.set_soft(q.soft);
                }
                None => tracing::warn!(quota = %q.name, "New quota ignored until restart"),
            }
        }
    }

    /// Stop every listener. Established connections run to completion.
    pub fn stop(&self) {
        for listener in &self.listeners {
            listener.stop_listening();
        }
    }
}

/// Start every listener in `config`, handing every message to `recv`.
///
/// Raw TCP and TLS connections start reading into `recv` as soon as they
/// are accepted; HTTP listeners serve `recv` on each configured endpoint.
pub fn start_listeners(
    manager: &Manager,
    config: &NetmgrConfig,
    recv: RecvCb,
) -> Result<Running, StartupError> {
    let mut running = Running {
        listeners: Vec::with_capacity(config.listeners.len()),
        quotas: config
            .quotas
            .iter()
            .map(|q| (q.name.clone(), Quota::with_soft(q.max, q.soft)))
            .collect(),
    };

    for (index, listener) in config.listeners.iter().enumerate() {
        match start_listener(manager, &running, index, listener, recv.clone()) {
            Ok(socket) => {
                tracing::info!(
                    kind = %socket.kind(),
                    address = %socket.local_addr(),
                    "Listener started"
                );
                running.listeners.push(socket);
            }
            Err(e) => {
                running.stop();
                return Err(e);
            }
        }
    }

    Ok(running)
}

fn start_listener(
    manager: &Manager,
    running: &Running,
    index: usize,
    listener: &ListenerConfig,
    recv: RecvCb,
) -> Result<Socket, StartupError> {
    let config_error = |message: String| StartupError::Config { index, message };
    let iface: SocketAddr = listener
        .address
        .parse()
        .map_err(|e| config_error(format!("invalid address {:?}: {e}", listener.address)))?;
    let quota = match &listener.quota {
        Some(name) => Some(
            running
                .quota(name)
                .cloned()
                .ok_or_else(|| config_error(format!("unknown quota {name:?}")))?,
        ),
        None => None,
    };
    let tls = match &listener.tls {
        Some(tls) => Some(
            TlsContext::server_from_files(Path::new(&tls.cert_path), Path::new(&tls.key_path))
                .map_err(|e| config_error(e.to_string()))?,
        ),
        None if listener.kind.needs_tls() => {
            return Err(config_error(format!("{:?} listener needs [tls]", listener.kind)))
        }
        None => None,
    };

    let backlog = listener.backlog;
    let started = match (listener.kind, tls.as_ref()) {
        (ListenerKind::Udp, _) => manager.listen_udp(iface, move |h, r| recv(h, r)),
        (ListenerKind::Tcp, _) => manager.listen_tcp(iface, read_into(recv), backlog, quota),
        (ListenerKind::Tls, Some(tls)) => {
            manager.listen_tls(iface, read_into(recv), backlog, quota, tls)
        }
        (ListenerKind::TcpDns, _) => {
            manager.listen_tcpdns(iface, move |h, r| recv(h, r), None, backlog, quota)
        }
        (ListenerKind::TlsDns, Some(tls)) => {
            manager.listen_tlsdns(iface, move |h, r| recv(h, r), None, backlog, quota, tls)
        }
        (ListenerKind::Http, tls) => {
            let endpoints = HttpEndpoints::new();
            for path in &listener.endpoints {
                endpoints
                    .add_with(path, recv.clone())
                    .map_err(|e| config_error(e.to_string()))?;
            }
            manager.listen_http(
                iface,
                backlog,
                quota,
                tls,
                &endpoints,
                listener.max_concurrent_streams,
            )
        }
        (ListenerKind::Tls | ListenerKind::TlsDns, None) => {
            return Err(config_error("missing TLS context".into()))
        }
    };

    started.map_err(|source| StartupError::Listener {
        index,
        address: listener.address.clone(),
        source,
    })
}

/// Accept callback that starts reading every new connection into `recv`.
fn read_into(recv: RecvCb) -> impl Fn(&crate::net::Handle) -> crate::Result<()> + Send + Sync + 'static {
    move |handle| {
        handle.read_with(recv.clone());
        Ok(())
    }
}
