//! UDP listeners and connected UDP sockets.
//!
//! A UDP listener binds one socket per worker with address reuse, so the
//! kernel spreads datagrams across workers. Each datagram is delivered on a
//! fresh handle addressed to its sender.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::error::{NetError, Result};
use crate::manager::{Core, Manager};
use crate::net::handle::{ConnectCompletion, Handle, RecvCb, SendCompletion};
use crate::net::socket::{
    self, DriverGuard, Role, Socket, SocketInner, SocketIo, SocketKind, SocketSpec, SocketState,
};
use crate::net::sockopt;
use crate::observability::StatCounter;

/// Largest datagram we can receive.
const MAX_DATAGRAM: usize = 65535;

enum RecvEvent {
    Closed,
    Wake,
    Timer,
    Recv(std::io::Result<(usize, SocketAddr)>),
}

/// Receive loop shared by listener children and connected sockets.
async fn recv_loop(sock: Arc<SocketInner>, udp: Arc<UdpSocket>) {
    let guard = DriverGuard::new(sock.clone());
    let mut buf = sock.core.mem().allocate(MAX_DATAGRAM);
    let mut closing = sock.closing_receiver();
    let client = sock.is_client();

    loop {
        if !sock.is_usable() {
            break;
        }
        let (reading, deadline) = sock.read_wait();
        let event = tokio::select! {
            _ = socket::closed(&mut closing) => RecvEvent::Closed,
            _ = sock.read_notify.notified() => RecvEvent::Wake,
            _ = socket::sleep_until_deadline(deadline) => RecvEvent::Timer,
            res = udp.recv_from(&mut buf), if reading => RecvEvent::Recv(res),
        };

        match event {
            RecvEvent::Closed => break,
            RecvEvent::Wake => continue,
            RecvEvent::Timer => sock.on_timer_expired(),
            RecvEvent::Recv(Ok((len, peer))) => {
                let max_udp = sock.core.settings().max_udp;
                if max_udp > 0 && len > max_udp {
                    tracing::trace!(socket = %sock.id, peer = %peer, len, max_udp, "Dropping oversized datagram");
                    continue;
                }
                if client {
                    sock.deliver_read(&buf[..len]);
                } else {
                    sock.deliver_datagram(peer, &buf[..len]);
                }
            }
            RecvEvent::Recv(Err(e)) => {
                if client {
                    sock.fail_read(e.into());
                    break;
                }
                // ICMP errors from earlier sends surface here on some
                // platforms; a listener keeps going.
                sock.core.stat(sock.kind, StatCounter::RecvFail);
                tracing::debug!(socket = %sock.id, error = %e, "UDP receive failed");
            }
        }
    }
    drop(guard);
}

/// Send one datagram. Datagrams over the configured limit are dropped and
/// reported as sent.
pub(crate) fn send(
    sock: &Arc<SocketInner>,
    udp: &Arc<UdpSocket>,
    peer: SocketAddr,
    data: Bytes,
    completion: SendCompletion,
) {
    let max_udp = sock.core.settings().max_udp;
    if max_udp > 0 && data.len() > max_udp {
        tracing::trace!(socket = %sock.id, len = data.len(), max_udp, "Dropping oversized datagram");
        completion.complete_later(Ok(()));
        return;
    }

    let connected = sock.is_client();
    let udp = udp.clone();
    let task_sock = sock.clone();
    sock.core.spawn_on(sock.tid, async move {
        let sock = task_sock;
        let res = if connected {
            udp.send(&data).await
        } else {
            udp.send_to(&data, peer).await
        };
        match res {
            Ok(_) => completion.complete(Ok(())),
            Err(e) => {
                sock.core.stat(sock.kind, StatCounter::SendFail);
                tracing::debug!(socket = %sock.id, peer = %peer, error = %e, "UDP send failed");
                completion.complete(Err(e.into()));
            }
        }
    });
}

fn start_udp_child(
    root: &Arc<SocketInner>,
    tid: usize,
    std_socket: std::net::UdpSocket,
    recv: RecvCb,
) {
    if tokio::runtime::Handle::try_current().is_err() {
        tracing::error!(tid, "UDP receive loop started off a worker runtime");
        return;
    }
    let udp = match UdpSocket::from_std(std_socket) {
        Ok(udp) => Arc::new(udp),
        Err(e) => {
            tracing::error!(tid, error = %e, "Failed to register UDP socket with the runtime");
            return;
        }
    };
    let child = SocketInner::new(
        &root.core,
        SocketSpec {
            kind: SocketKind::Udp,
            role: Role::ListenerChild,
            tid,
            parent: Some(root.id),
            local: root.local,
            peer: root.local,
            io: SocketIo::Udp(udp.clone()),
            state: SocketState::Listening,
            encrypted: false,
            xfr_allowed: false,
            permit: None,
            timeout: Duration::ZERO,
        },
    );
    root.add_child(child.id);
    child.start_read(None, recv);
    tokio::spawn(recv_loop(child, udp));
}

fn listen_udp(core: &Arc<Core>, iface: SocketAddr, recv: RecvCb) -> Result<Socket> {
    if core.is_shutting_down() {
        return Err(NetError::ShuttingDown);
    }
    let settings = core.settings();

    // The first bind settles an ephemeral port for the others.
    let mut sockets = Vec::with_capacity(core.nworkers());
    let mut local = iface;
    for _ in 0..core.nworkers() {
        let bound = sockopt::udp_socket(local, &settings.buffers).map_err(|e| {
            core.stat(SocketKind::Udp, StatCounter::BindFail);
            tracing::warn!(address = %iface, error = %e, "Failed to bind UDP listener");
            NetError::from(e)
        })?;
        local = bound.local_addr()?;
        sockets.push(Some(bound));
    }

    let root = SocketInner::new(
        core,
        SocketSpec {
            kind: SocketKind::Udp,
            role: Role::Listener,
            tid: core.pick_tid(),
            parent: None,
            local,
            peer: local,
            io: SocketIo::Listener,
            state: SocketState::Listening,
            encrypted: false,
            xfr_allowed: false,
            permit: None,
            timeout: Duration::ZERO,
        },
    );

    core.register_on_all(|tid| {
        if let Some(socket) = sockets.get_mut(tid).and_then(Option::take) {
            start_udp_child(&root, tid, socket, recv.clone());
        }
    });

    tracing::info!(socket = %root.id, kind = %root.kind, address = %local, workers = core.nworkers(), "Listener bound");
    Ok(Socket::new(root))
}

fn connect_udp(core: &Arc<Core>, tid: usize, local: SocketAddr, peer: SocketAddr, timeout: Duration) -> Result<Handle> {
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(NetError::ShuttingDown);
    }
    let settings = core.settings();
    let std_socket = sockopt::udp_socket(sockopt::local_for(local, peer), &settings.buffers)?;
    std_socket.connect(peer)?;
    let udp = Arc::new(UdpSocket::from_std(std_socket)?);
    let local = udp.local_addr()?;

    let sock = SocketInner::new(
        core,
        SocketSpec {
            kind: SocketKind::Udp,
            role: Role::Connection { client: true },
            tid,
            parent: None,
            local,
            peer,
            io: SocketIo::Udp(udp.clone()),
            state: SocketState::Active,
            encrypted: false,
            xfr_allowed: false,
            permit: None,
            timeout,
        },
    );
    tokio::spawn(recv_loop(sock.clone(), udp));
    Ok(sock.new_handle(peer))
}

impl Manager {
    /// Listen for UDP on every worker. `recv` gets one call per datagram.
    pub fn listen_udp<R>(&self, iface: SocketAddr, recv: R) -> Result<Socket>
    where
        R: Fn(&Handle, Result<&[u8]>) + Send + Sync + 'static,
    {
        listen_udp(self.core(), iface, Arc::new(recv))
    }

    /// Create a connected UDP socket. `timeout` is the read timeout; zero
    /// uses the initial timeout.
    pub fn udp_connect<F>(&self, local: SocketAddr, peer: SocketAddr, cb: F, timeout: Duration)
    where
        F: FnOnce(Result<Handle>) + Send + 'static,
    {
        let core = self.core().clone();
        let cb = ConnectCompletion::new(cb);
        let tid = core.pick_tid();
        if core.is_shutting_down() {
            core.enqueue(tid, move || cb.complete(Err(NetError::ShuttingDown)));
            return;
        }
        let timeout = if timeout.is_zero() {
            core.settings().timeouts.init
        } else {
            timeout
        };

        let task_core = core.clone();
        core.enqueue(tid, move || {
            let core = task_core;
            match connect_udp(&core, tid, local, peer, timeout) {
                Ok(handle) => {
                    core.stat(SocketKind::Udp, StatCounter::Connect);
                    cb.complete(Ok(handle));
                }
                Err(e) => {
                    core.stat(SocketKind::Udp, StatCounter::ConnectFail);
                    tracing::debug!(peer = %peer, error = %e, "UDP connect failed");
                    cb.complete(Err(e));
                }
            }
        });
    }
}
