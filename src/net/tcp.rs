//! Stream listeners and connectors shared by TCP, TLS, TCPDNS, TLSDNS and
//! HTTP.
//!
//! # Data Flow
//! ```text
//! listen_stream()
//!     → one bound socket, cloned into every worker's runtime (register_on_all)
//!     → per-worker accept loop (ListenerChild)
//!     → quota check (RST when over the limit)
//!     → optional TLS handshake, bounded by the initial timeout
//!     → Connection socket + stream driver, accept callback, read callback
//!
//! connect_stream()
//!     → connect (+ handshake) on the caller's worker, bounded by the timeout
//!     → Connection socket + stream driver → connect callback
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;

use crate::error::{NetError, Result};
use crate::manager::{Core, Manager};
use crate::net::handle::{AcceptCb, ConnectCompletion, Handle, RecvCb};
use crate::net::http::client::HttpTarget;
use crate::net::http::server::HttpListen;
use crate::net::quota::{Quota, QuotaPermit};
use crate::net::socket::{
    self, DriverGuard, Role, Socket, SocketInner, SocketIo, SocketKind, SocketSpec, SocketState,
};
use crate::net::stream::{self, Io};
use crate::net::tls::TlsContext;
use crate::net::{http, sockopt};
use crate::observability::StatCounter;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// What a stream listener does with the connections it accepts.
pub(crate) struct ListenSpec {
    pub kind: SocketKind,
    pub accept: Option<AcceptCb>,
    pub recv: Option<RecvCb>,
    pub quota: Option<Quota>,
    pub tls: Option<TlsAcceptor>,
    pub http: Option<HttpListen>,
}

/// Await `fut` for at most `limit`; zero means no limit.
pub(crate) async fn within<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    if limit.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(limit, fut).await.ok()
    }
}

/// Bind `iface` and start accepting on every worker.
pub(crate) fn listen_stream(
    core: &Arc<Core>,
    iface: SocketAddr,
    backlog: i32,
    spec: ListenSpec,
) -> Result<Socket> {
    if core.is_shutting_down() {
        return Err(NetError::ShuttingDown);
    }
    let settings = core.settings();
    let listener = sockopt::tcp_listener(iface, backlog, &settings.buffers).map_err(|e| {
        core.stat(spec.kind, StatCounter::BindFail);
        tracing::warn!(address = %iface, kind = %spec.kind, error = %e, "Failed to bind listener");
        NetError::from(e)
    })?;
    let local = listener.local_addr()?;

    let mut slots = Vec::with_capacity(core.nworkers());
    for _ in 0..core.nworkers() {
        slots.push(Some(listener.try_clone()?));
    }
    drop(listener);

    let root = SocketInner::new(
        core,
        SocketSpec {
            kind: spec.kind,
            role: Role::Listener,
            tid: core.pick_tid(),
            parent: None,
            local,
            peer: local,
            io: SocketIo::Listener,
            state: SocketState::Listening,
            encrypted: spec.tls.is_some(),
            xfr_allowed: false,
            permit: None,
            timeout: Duration::ZERO,
        },
    );

    let spec = Arc::new(spec);
    core.register_on_all(|tid| {
        if let Some(listener) = slots.get_mut(tid).and_then(Option::take) {
            start_accept_loop(&root, tid, listener, spec.clone());
        }
    });

    tracing::info!(
        socket = %root.id,
        kind = %root.kind,
        address = %local,
        workers = core.nworkers(),
        "Listener bound"
    );
    Ok(Socket::new(root))
}

fn start_accept_loop(
    root: &Arc<SocketInner>,
    tid: usize,
    listener: std::net::TcpListener,
    spec: Arc<ListenSpec>,
) {
    if tokio::runtime::Handle::try_current().is_err() {
        tracing::error!(tid, "Accept loop started off a worker runtime");
        return;
    }
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(tid, error = %e, "Failed to register listener with the runtime");
            return;
        }
    };

    let child = SocketInner::new(
        &root.core,
        SocketSpec {
            kind: root.kind,
            role: Role::ListenerChild,
            tid,
            parent: Some(root.id),
            local: root.local,
            peer: root.local,
            io: SocketIo::Listener,
            state: SocketState::Listening,
            encrypted: root.encrypted,
            xfr_allowed: false,
            permit: None,
            timeout: Duration::ZERO,
        },
    );
    root.add_child(child.id);
    tokio::spawn(accept_loop(root.clone(), child, listener, spec));
}

async fn accept_loop(
    root: Arc<SocketInner>,
    child: Arc<SocketInner>,
    listener: TcpListener,
    spec: Arc<ListenSpec>,
) {
    let guard = DriverGuard::new(child.clone());
    let mut closing = child.closing_receiver();

    loop {
        let accepted = tokio::select! {
            _ = socket::closed(&mut closing) => break,
            res = listener.accept() => res,
        };
        match accepted {
            Ok((stream, peer)) => admit(&root, child.tid, stream, peer, &spec),
            Err(e) => {
                root.core.stat(root.kind, StatCounter::AcceptFail);
                tracing::warn!(socket = %child.id, error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
    // Release the port before the child counts as closed.
    drop(listener);
    drop(guard);
}

fn admit(
    root: &Arc<SocketInner>,
    tid: usize,
    stream: TcpStream,
    peer: SocketAddr,
    spec: &Arc<ListenSpec>,
) {
    let permit = match &spec.quota {
        None => None,
        Some(quota) => match quota.acquire() {
            Ok(permit) => Some(permit),
            Err(_) => {
                root.core.stat(root.kind, StatCounter::AcceptFail);
                tracing::debug!(peer = %peer, used = quota.used(), max = quota.max(), "Connection quota reached; resetting");
                if let Err(e) = sockopt::reset_on_close(&stream) {
                    tracing::debug!(error = %e, "Failed to set SO_LINGER");
                }
                return;
            }
        },
    };
    if permit.as_ref().is_some_and(QuotaPermit::is_soft) {
        tracing::debug!(peer = %peer, "Connection admitted over the soft quota");
    }

    tokio::spawn(establish(root.clone(), tid, stream, peer, permit, spec.clone()));
}

async fn establish(
    root: Arc<SocketInner>,
    tid: usize,
    stream: TcpStream,
    peer: SocketAddr,
    permit: Option<QuotaPermit>,
    spec: Arc<ListenSpec>,
) {
    let settings = root.core.settings();
    sockopt::apply_stream_buffers(&stream, &settings.buffers);
    let local = stream.local_addr().unwrap_or(root.local);

    let Some(acceptor) = &spec.tls else {
        start_connection(&root, tid, stream, local, peer, permit, false, &spec);
        return;
    };

    match within(settings.timeouts.init, acceptor.accept(stream)).await {
        Some(Ok(tls)) => {
            let dot = tls.get_ref().1.alpn_protocol() == Some(b"dot".as_slice());
            start_connection(&root, tid, tls, local, peer, permit, dot, &spec);
        }
        Some(Err(e)) => {
            root.core.stat(root.kind, StatCounter::AcceptFail);
            tracing::debug!(peer = %peer, error = %e, "TLS handshake failed");
        }
        None => {
            root.core.stat(root.kind, StatCounter::AcceptFail);
            tracing::debug!(peer = %peer, "TLS handshake timed out");
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn start_connection<S: Io>(
    root: &Arc<SocketInner>,
    tid: usize,
    stream: S,
    local: SocketAddr,
    peer: SocketAddr,
    permit: Option<QuotaPermit>,
    xfr_allowed: bool,
    spec: &ListenSpec,
) {
    if !root.is_usable() {
        return;
    }
    if let Some(listen) = &spec.http {
        http::server::start_session(root, tid, stream, local, peer, permit, listen.clone());
        return;
    }

    let (writes, writes_rx) = mpsc::unbounded_channel();
    let sock = SocketInner::new(
        &root.core,
        SocketSpec {
            kind: spec.kind,
            role: Role::Connection { client: false },
            tid,
            parent: Some(root.id),
            local,
            peer,
            io: SocketIo::Stream(writes),
            state: SocketState::Active,
            encrypted: spec.tls.is_some(),
            xfr_allowed,
            permit,
            timeout: root.core.settings().timeouts.init,
        },
    );
    root.connection_opened();
    root.core.stat(spec.kind, StatCounter::Accept);
    tracing::debug!(socket = %sock.id, kind = %sock.kind, peer = %peer, "Connection accepted");

    stream::spawn_driver(sock.clone(), stream, writes_rx);
    let handle = sock.new_handle(peer);

    if let Some(accept) = &spec.accept {
        if let Err(e) = accept(&handle) {
            tracing::debug!(socket = %sock.id, error = %e, "Accept callback rejected connection");
            drop(handle);
            sock.close(None);
            return;
        }
    }
    if let Some(recv) = &spec.recv {
        sock.start_read(Some(&handle), recv.clone());
    }
}

/// Parameters of an outgoing stream connection.
pub(crate) struct ConnectRequest {
    pub kind: SocketKind,
    pub local: SocketAddr,
    pub peer: SocketAddr,
    pub timeout: Duration,
    pub tls: Option<TlsContext>,
    pub http: Option<HttpTarget>,
}

/// Connect on a worker and report the outcome through `cb`.
pub(crate) fn connect_stream(core: &Arc<Core>, req: ConnectRequest, cb: ConnectCompletion) {
    let tid = core.pick_tid();
    if core.is_shutting_down() {
        core.enqueue(tid, move || cb.complete(Err(NetError::ShuttingDown)));
        return;
    }
    let timeout = if req.timeout.is_zero() {
        core.settings().timeouts.init
    } else {
        req.timeout
    };

    let task_core = core.clone();
    core.spawn_on(tid, async move {
        let core = task_core;
        let kind = req.kind;
        let result = match within(timeout, establish_client(&core, tid, &req, timeout)).await {
            Some(result) => result,
            None => Err(NetError::TimedOut),
        };
        match result {
            Ok(handle) => {
                core.stat(kind, StatCounter::Connect);
                tracing::debug!(kind = %kind, peer = %req.peer, "Connected");
                cb.complete(Ok(handle));
            }
            Err(e) => {
                core.stat(kind, StatCounter::ConnectFail);
                tracing::debug!(kind = %kind, peer = %req.peer, error = %e, "Connect failed");
                cb.complete(Err(e));
            }
        }
    });
}

async fn establish_client(
    core: &Arc<Core>,
    tid: usize,
    req: &ConnectRequest,
    timeout: Duration,
) -> Result<Handle> {
    let settings = core.settings();
    let local = sockopt::local_for(req.local, req.peer);
    let stream = sockopt::tcp_client(local, req.peer, &settings.buffers)?
        .connect(req.peer)
        .await?;
    let local = stream.local_addr()?;

    match &req.tls {
        None => finish_client(core, tid, req, stream, local, false, timeout).await,
        Some(ctx) => {
            let (connector, name) = ctx.connector(req.peer)?;
            let tls = connector
                .connect(name, stream)
                .await
                .map_err(|e| NetError::Tls(e.to_string()))?;
            let dot = tls.get_ref().1.alpn_protocol() == Some(b"dot".as_slice());
            finish_client(core, tid, req, tls, local, dot, timeout).await
        }
    }
}

async fn finish_client<S: Io>(
    core: &Arc<Core>,
    tid: usize,
    req: &ConnectRequest,
    stream: S,
    local: SocketAddr,
    xfr_allowed: bool,
    timeout: Duration,
) -> Result<Handle> {
    if let Some(target) = &req.http {
        return http::client::start_session(
            core,
            tid,
            stream,
            local,
            req.peer,
            req.tls.is_some(),
            target.clone(),
            timeout,
        )
        .await;
    }

    let (writes, writes_rx) = mpsc::unbounded_channel();
    let sock = SocketInner::new(
        core,
        SocketSpec {
            kind: req.kind,
            role: Role::Connection { client: true },
            tid,
            parent: None,
            local,
            peer: req.peer,
            io: SocketIo::Stream(writes),
            state: SocketState::Active,
            encrypted: req.tls.is_some(),
            xfr_allowed,
            permit: None,
            timeout,
        },
    );
    stream::spawn_driver(sock.clone(), stream, writes_rx);
    Ok(sock.new_handle(req.peer))
}

impl Manager {
    /// Listen for raw TCP. `accept` runs for every new connection and must
    /// keep the handle (for example by calling [`Handle::read`]) or the
    /// connection closes.
    pub fn listen_tcp<A>(
        &self,
        iface: SocketAddr,
        accept: A,
        backlog: i32,
        quota: Option<Quota>,
    ) -> Result<Socket>
    where
        A: Fn(&Handle) -> Result<()> + Send + Sync + 'static,
    {
        listen_stream(
            self.core(),
            iface,
            backlog,
            ListenSpec {
                kind: SocketKind::Tcp,
                accept: Some(Arc::new(accept)),
                recv: None,
                quota,
                tls: None,
                http: None,
            },
        )
    }

    /// Connect a raw TCP stream. A zero `timeout` uses the initial timeout.
    pub fn tcp_connect<F>(&self, local: SocketAddr, peer: SocketAddr, cb: F, timeout: Duration)
    where
        F: FnOnce(Result<Handle>) + Send + 'static,
    {
        connect_stream(
            self.core(),
            ConnectRequest {
                kind: SocketKind::Tcp,
                local,
                peer,
                timeout,
                tls: None,
                http: None,
            },
            ConnectCompletion::new(cb),
        );
    }
}
