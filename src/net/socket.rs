//! Socket state shared by every transport.
//!
//! # Responsibilities
//! - Identify sockets and track their state (Listening/Connecting → Active → Closing → Closed)
//! - Hold the read callback, read timer and keepalive flag
//! - Issue handles and recycle their payloads
//! - Close once, then finish once the driver task is gone
//!
//! Sockets live in the manager's arena keyed by [`SocketId`]; children name
//! their parent by id only.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

use crate::error::NetError;
use crate::manager::Core;
use crate::net::handle::{Handle, HandleData, RecvCb, Reply, SendCompletion};
use crate::net::http::client::ClientSession;
use crate::net::quota::QuotaPermit;
use crate::net::stream::WriteRequest;
use crate::net::{http, stream, udp};
use crate::observability::StatCounter;

/// Maximum number of message handles a server DNS connection may have
/// outstanding before it stops reading from the socket.
pub(crate) const STREAM_CLIENTS_PER_CONN: usize = 23;

/// Upper bound on recycled handle payloads kept per socket.
const HANDLE_POOL_LIMIT: usize = 64;

static SOCKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

impl SocketId {
    pub(crate) fn new() -> Self {
        Self(SOCKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}

/// Transport kind of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Udp,
    Tcp,
    Tls,
    TcpDns,
    TlsDns,
    Http,
}

impl SocketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketKind::Udp => "udp",
            SocketKind::Tcp => "tcp",
            SocketKind::Tls => "tls",
            SocketKind::TcpDns => "tcpdns",
            SocketKind::TlsDns => "tlsdns",
            SocketKind::Http => "http",
        }
    }

    pub fn is_stream(&self) -> bool {
        !matches!(self, SocketKind::Udp)
    }

    /// Kinds that carry length-prefixed DNS messages.
    pub fn is_dns(&self) -> bool {
        matches!(self, SocketKind::TcpDns | SocketKind::TlsDns)
    }
}

impl std::fmt::Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket types accepted by [`check_addr`](crate::net::check_addr).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Tcp = 1,
    Udp,
    Unix,
    Raw,
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SocketState {
    Listening = 0,
    Connecting = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl From<u8> for SocketState {
    fn from(value: u8) -> Self {
        match value {
            0 => SocketState::Listening,
            1 => SocketState::Connecting,
            2 => SocketState::Active,
            3 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// Bound listener returned to the application.
    Listener,
    /// Per-worker accept (or receive) loop of a listener.
    ListenerChild,
    /// Accepted or connected stream, or a connected UDP socket.
    Connection { client: bool },
}

pub(crate) enum SocketIo {
    Listener,
    Udp(Arc<tokio::net::UdpSocket>),
    Stream(mpsc::UnboundedSender<WriteRequest>),
    HttpServer,
    HttpClient(ClientSession),
}

/// Everything needed to create a socket.
pub(crate) struct SocketSpec {
    pub kind: SocketKind,
    pub role: Role,
    pub tid: usize,
    pub parent: Option<SocketId>,
    pub local: SocketAddr,
    pub peer: SocketAddr,
    pub io: SocketIo,
    pub state: SocketState,
    pub encrypted: bool,
    pub xfr_allowed: bool,
    pub permit: Option<QuotaPermit>,
    pub timeout: Duration,
}

struct ReadState {
    cb: Option<RecvCb>,
    /// Keeps a connection open while it is being read.
    handle: Option<Handle>,
    reading: bool,
    timeout: Duration,
    deadline: Option<Instant>,
    keepalive: bool,
}

impl ReadState {
    fn arm(&mut self) {
        self.deadline = if self.reading && !self.timeout.is_zero() {
            Some(Instant::now() + self.timeout)
        } else {
            None
        };
    }
}

pub(crate) struct SocketInner {
    pub(crate) id: SocketId,
    pub(crate) kind: SocketKind,
    pub(crate) role: Role,
    pub(crate) tid: usize,
    pub(crate) core: Arc<Core>,
    pub(crate) parent: Option<SocketId>,
    pub(crate) local: SocketAddr,
    pub(crate) peer: SocketAddr,
    pub(crate) io: SocketIo,
    pub(crate) encrypted: bool,
    pub(crate) xfr_allowed: bool,
    pub(crate) read_notify: Notify,
    state: AtomicU8,
    closing: watch::Sender<bool>,
    read: Mutex<ReadState>,
    active_handles: AtomicUsize,
    pool: Mutex<Vec<HandleData>>,
    children: Mutex<Vec<SocketId>>,
    open_children: AtomicUsize,
    permit: Mutex<Option<QuotaPermit>>,
    write_timeout: Mutex<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Resolves once the socket has started closing.
pub(crate) async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closing| *closing).await;
}

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl SocketInner {
    pub(crate) fn new(core: &Arc<Core>, spec: SocketSpec) -> Arc<Self> {
        let (closing, _) = watch::channel(false);
        let write_timeout = core.settings().timeouts.idle;
        let sock = Arc::new(SocketInner {
            id: SocketId::new(),
            kind: spec.kind,
            role: spec.role,
            tid: spec.tid,
            core: core.clone(),
            parent: spec.parent,
            local: spec.local,
            peer: spec.peer,
            io: spec.io,
            encrypted: spec.encrypted,
            xfr_allowed: spec.xfr_allowed,
            read_notify: Notify::new(),
            state: AtomicU8::new(spec.state as u8),
            closing,
            read: Mutex::new(ReadState {
                cb: None,
                handle: None,
                reading: false,
                timeout: spec.timeout,
                deadline: None,
                keepalive: false,
            }),
            active_handles: AtomicUsize::new(0),
            pool: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            open_children: AtomicUsize::new(0),
            permit: Mutex::new(spec.permit),
            write_timeout: Mutex::new(write_timeout),
        });
        core.register(sock.clone());
        tracing::trace!(socket = %sock.id, kind = %sock.kind, tid = sock.tid, "Socket created");
        sock
    }

    pub(crate) fn state(&self) -> SocketState {
        SocketState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True until the socket starts closing.
    pub(crate) fn is_usable(&self) -> bool {
        self.state() < SocketState::Closing
    }

    pub(crate) fn closing_receiver(&self) -> watch::Receiver<bool> {
        self.closing.subscribe()
    }

    /// Per-worker receive loop shared by every datagram of a UDP listener.
    pub(crate) fn is_listener_child(&self) -> bool {
        self.role == Role::ListenerChild
    }

    pub(crate) fn is_client(&self) -> bool {
        matches!(self.role, Role::Connection { client: true })
    }

    fn is_server_connection(&self) -> bool {
        matches!(self.role, Role::Connection { client: false })
    }

    /// Client DNS, UDP and HTTP sockets deliver one message per `read`.
    fn is_one_shot(&self) -> bool {
        self.is_client() && !matches!(self.kind, SocketKind::Tcp | SocketKind::Tls)
    }

    fn closes_when_idle(&self) -> bool {
        match self.role {
            Role::Connection { client } => client || self.kind != SocketKind::Http,
            _ => false,
        }
    }

    pub(crate) fn active_handles(&self) -> usize {
        self.active_handles.load(Ordering::Acquire)
    }

    /// Server DNS connections stop reading while too many messages are in flight.
    pub(crate) fn is_throttled(&self) -> bool {
        self.kind.is_dns()
            && self.is_server_connection()
            && self.active_handles() > STREAM_CLIENTS_PER_CONN
    }

    // Handles

    pub(crate) fn new_handle(self: &Arc<Self>, peer: SocketAddr) -> Handle {
        self.new_handle_with(peer, None)
    }

    pub(crate) fn new_handle_with(self: &Arc<Self>, peer: SocketAddr, reply: Option<Reply>) -> Handle {
        self.active_handles.fetch_add(1, Ordering::AcqRel);
        let data = lock(&self.pool).pop();
        Handle::new(self.clone(), peer, self.local, data, reply)
    }

    /// Called when the last reference to a handle goes away.
    pub(crate) fn release_handle(self: &Arc<Self>, data: Option<HandleData>) {
        if let Some(mut data) = data {
            let mut pool = lock(&self.pool);
            if self.is_usable() && pool.len() < HANDLE_POOL_LIMIT {
                data.reset();
                pool.push(data);
            } else {
                drop(pool);
                data.free();
            }
        }

        let previous = self.active_handles.fetch_sub(1, Ordering::AcqRel);
        if self.kind.is_dns() && self.is_server_connection() {
            self.read_notify.notify_one();
        }
        if previous == 1 && self.closes_when_idle() {
            self.close(None);
        }
    }

    // Reading

    /// Install `cb` and start delivering.
    pub(crate) fn start_read(self: &Arc<Self>, handle: Option<&Handle>, cb: RecvCb) {
        let keep = match self.role {
            Role::Connection { .. } => handle.cloned(),
            _ => None,
        };
        let previous = {
            let mut st = lock(&self.read);
            st.cb = Some(cb);
            st.reading = true;
            st.arm();
            match keep {
                Some(handle) => st.handle.replace(handle),
                None => None,
            }
        };
        drop(previous);
        self.read_notify.notify_one();
    }

    pub(crate) fn pause_read(&self) {
        {
            let mut st = lock(&self.read);
            st.reading = false;
            st.deadline = None;
        }
        self.read_notify.notify_one();
    }

    pub(crate) fn resume_read(&self) {
        {
            let mut st = lock(&self.read);
            if st.cb.is_some() && self.is_usable() {
                st.reading = true;
                st.arm();
            }
        }
        self.read_notify.notify_one();
    }

    /// Stop delivery and take the callback; `None` when nothing was reading.
    pub(crate) fn cancel_read(&self) -> Option<(RecvCb, Option<Handle>)> {
        let taken = {
            let mut st = lock(&self.read);
            st.reading = false;
            st.deadline = None;
            st.cb.take().map(|cb| (cb, st.handle.take()))
        };
        self.read_notify.notify_one();
        taken
    }

    pub(crate) fn is_reading(&self) -> bool {
        lock(&self.read).reading
    }

    /// Whether the driver should read, and when the read timer expires.
    pub(crate) fn read_wait(&self) -> (bool, Option<Instant>) {
        let st = lock(&self.read);
        (st.reading, st.deadline)
    }

    /// Start a read timer on a socket that has no callback of its own.
    pub(crate) fn start_session_timer(&self, timeout: Duration) {
        let mut st = lock(&self.read);
        st.reading = true;
        st.timeout = timeout;
        st.arm();
    }

    // Timers

    pub(crate) fn set_timeout(&self, timeout: Duration) {
        {
            let mut st = lock(&self.read);
            st.timeout = timeout;
            st.arm();
        }
        self.read_notify.notify_one();
    }

    pub(crate) fn clear_timeout(&self) {
        {
            let mut st = lock(&self.read);
            st.timeout = Duration::ZERO;
            st.deadline = None;
        }
        self.read_notify.notify_one();
    }

    /// Push the deadline out after activity, if a timer is running.
    pub(crate) fn restart_timer(&self) {
        let mut st = lock(&self.read);
        if st.deadline.is_some() {
            st.arm();
        }
    }

    pub(crate) fn timer_running(&self) -> bool {
        lock(&self.read).deadline.is_some()
    }

    /// Switch between the keepalive and idle timeout classes.
    pub(crate) fn set_keepalive(&self, keepalive: bool) {
        if !self.kind.is_dns() {
            return;
        }
        let timeouts = self.core.settings().timeouts;
        {
            let mut st = lock(&self.read);
            st.keepalive = keepalive;
            st.timeout = if keepalive { timeouts.keepalive } else { timeouts.idle };
            if st.deadline.is_some() {
                st.arm();
            }
        }
        self.read_notify.notify_one();
    }

    pub(crate) fn write_timeout(&self) -> Duration {
        *lock(&self.write_timeout)
    }

    pub(crate) fn set_write_timeout(&self, timeout: Duration) {
        *lock(&self.write_timeout) = timeout;
    }

    /// Called by a driver once its read deadline has passed.
    ///
    /// The callback sees exactly one timed-out result. Unless it re-arms the
    /// timer, the socket then closes.
    pub(crate) fn on_timer_expired(self: &Arc<Self>) {
        let (cb, handle) = {
            let mut st = lock(&self.read);
            match st.deadline {
                Some(deadline) if deadline <= Instant::now() => st.deadline = None,
                _ => return,
            }
            (st.cb.clone(), st.handle.clone())
        };

        tracing::debug!(socket = %self.id, peer = %self.peer, "Read timed out");
        if let Some(cb) = cb {
            let handle = handle.unwrap_or_else(|| self.new_handle(self.peer));
            cb(&handle, Err(NetError::TimedOut));
        }

        if self.timer_running() {
            return;
        }
        let held = {
            let mut st = lock(&self.read);
            st.reading = false;
            st.cb = None;
            st.handle.take()
        };
        drop(held);
        self.close(None);
    }

    // Delivery

    /// Take the callback for one delivery. One-shot sockets stop reading
    /// and give up the read handle; the others restart their timer.
    fn take_delivery(&self) -> Option<(RecvCb, Option<Handle>)> {
        let mut st = lock(&self.read);
        let cb = st.cb.clone()?;
        if self.is_one_shot() {
            st.reading = false;
            st.deadline = None;
            Some((cb, st.handle.take()))
        } else {
            st.arm();
            Some((cb, st.handle.clone()))
        }
    }

    /// Pass bytes read from a connection to its callback.
    pub(crate) fn deliver_read(self: &Arc<Self>, data: &[u8]) {
        if let Some((cb, held)) = self.take_delivery() {
            let handle = held.unwrap_or_else(|| self.new_handle(self.peer));
            cb(&handle, Ok(data));
        }
    }

    /// Pass a failed result to the callback without closing the socket.
    pub(crate) fn deliver_error(self: &Arc<Self>, err: NetError) {
        if let Some((cb, held)) = self.take_delivery() {
            let handle = held.unwrap_or_else(|| self.new_handle(self.peer));
            cb(&handle, Err(err));
        }
    }

    /// Server side of DNS framing: every message gets a fresh handle.
    pub(crate) fn deliver_message(self: &Arc<Self>, data: &[u8]) {
        let timeouts = self.core.settings().timeouts;
        let cb = {
            let mut st = lock(&self.read);
            let Some(cb) = st.cb.clone() else { return };
            st.timeout = if st.keepalive { timeouts.keepalive } else { timeouts.idle };
            st.arm();
            cb
        };
        let handle = self.new_handle(self.peer);
        cb(&handle, Ok(data));
    }

    /// UDP listener side: one handle per datagram, addressed to its sender.
    pub(crate) fn deliver_datagram(self: &Arc<Self>, peer: SocketAddr, data: &[u8]) {
        let cb = {
            let st = lock(&self.read);
            match (&st.cb, st.reading) {
                (Some(cb), true) => cb.clone(),
                _ => return,
            }
        };
        let handle = self.new_handle(peer);
        cb(&handle, Ok(data));
    }

    /// Report a read failure and close.
    pub(crate) fn fail_read(self: &Arc<Self>, err: NetError) {
        if !matches!(err, NetError::Eof | NetError::Canceled) {
            self.core.stat(self.kind, StatCounter::RecvFail);
        }
        tracing::debug!(socket = %self.id, peer = %self.peer, error = %err, "Read failed");
        self.close(Some(err));
    }

    // Sending

    pub(crate) fn send(self: &Arc<Self>, handle: &Handle, data: Bytes, completion: SendCompletion) {
        if !self.is_usable() {
            completion.complete_later(Err(NetError::Canceled));
            return;
        }
        match &self.io {
            SocketIo::Udp(udp) => udp::send(self, udp, handle.peer_addr(), data, completion),
            SocketIo::Stream(writes) => stream::send(self, writes, data, completion),
            SocketIo::HttpServer => http::server::send(handle, data, completion),
            SocketIo::HttpClient(session) => session.send(self, data, completion),
            SocketIo::Listener => completion.complete_later(Err(NetError::NotConnected)),
        }
    }

    // Lifecycle

    pub(crate) fn take_permit(&self) -> Option<QuotaPermit> {
        lock(&self.permit).take()
    }

    pub(crate) fn add_child(&self, child: SocketId) {
        lock(&self.children).push(child);
        self.open_children.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn connection_opened(&self) {
        self.open_children.fetch_add(1, Ordering::AcqRel);
    }

    fn child_closed(&self) {
        let previous = self.open_children.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.state() == SocketState::Closing {
            self.finish();
        }
    }

    fn begin_closing(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < SocketState::Closing as u8).then_some(SocketState::Closing as u8)
            })
            .is_ok()
    }

    /// Start closing. `reason`, if any, is delivered to the read callback.
    pub(crate) fn close(self: &Arc<Self>, reason: Option<NetError>) {
        if !self.begin_closing() {
            return;
        }
        self.closing.send_replace(true);
        tracing::trace!(socket = %self.id, kind = %self.kind, "Socket closing");

        let (cb, held) = {
            let mut st = lock(&self.read);
            st.reading = false;
            st.deadline = None;
            (st.cb.take(), st.handle.take())
        };
        if let (Some(cb), Some(reason)) = (cb, reason) {
            let handle = held.clone().unwrap_or_else(|| self.new_handle(self.peer));
            self.core.enqueue(self.tid, move || cb(&handle, Err(reason)));
        }
        drop(held);

        if self.role == Role::Listener {
            let children = lock(&self.children).clone();
            for id in children {
                if let Some(child) = self.core.socket(id) {
                    child.close(None);
                }
            }
            if self.open_children.load(Ordering::Acquire) == 0 {
                self.finish();
            }
        }
    }

    /// Final step: the socket leaves the arena and releases its quota slot.
    pub(crate) fn finish(&self) {
        if self.state.swap(SocketState::Closed as u8, Ordering::AcqRel) == SocketState::Closed as u8 {
            return;
        }
        self.closing.send_replace(true);
        drop(self.take_permit());
        self.core.unregister(self.id, self.kind);
        tracing::trace!(socket = %self.id, kind = %self.kind, "Socket closed");

        if let Some(parent) = self.parent.and_then(|id| self.core.socket(id)) {
            parent.child_closed();
        }
    }
}

impl Drop for SocketInner {
    fn drop(&mut self) {
        let pool = std::mem::take(self.pool.get_mut().unwrap_or_else(|p| p.into_inner()));
        for data in pool {
            data.free();
        }
    }
}

/// Finishes its socket when the driver task ends, however it ends.
pub(crate) struct DriverGuard(Arc<SocketInner>);

impl DriverGuard {
    pub(crate) fn new(sock: Arc<SocketInner>) -> Arc<Self> {
        Arc::new(DriverGuard(sock))
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.0.close(None);
        self.0.finish();
    }
}

/// A listening socket.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("local", &self.inner.local)
            .field("state", &self.state())
            .finish()
    }
}

impl Socket {
    pub(crate) fn new(inner: Arc<SocketInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    pub fn kind(&self) -> SocketKind {
        self.inner.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn state(&self) -> SocketState {
        self.inner.state()
    }

    /// Stop accepting. Established connections run until they close on
    /// their own. Calling this again has no effect.
    pub fn stop_listening(&self) {
        if self.inner.is_usable() {
            tracing::info!(socket = %self.inner.id, kind = %self.inner.kind, address = %self.inner.local, "Listener stopping");
        }
        self.inner.close(None);
    }
}
