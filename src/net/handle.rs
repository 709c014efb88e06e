//! Handles: the application's view of one exchange.
//!
//! A handle stands for one connection, one UDP flow, one DNS message on a
//! pipelined connection, or one HTTP request. Cloning attaches, dropping
//! detaches. While any handle of a connection is alive the connection stays
//! open; when the last one goes, it closes.
//!
//! Handles carry an optional typed payload ([`HandleData`]). When a handle
//! is released on a socket that is still in use, the payload is reset and
//! parked for the next handle on that socket.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;

use crate::error::{NetError, Result};
use crate::manager::Manager;
use crate::net::http::server::ReplySlot;
use crate::net::socket::{SocketInner, SocketKind};

/// Receive callback: one call per message, error, timeout or cancellation.
pub type RecvCb = Arc<dyn Fn(&Handle, Result<&[u8]>) + Send + Sync>;

/// Accept callback. Returning an error closes the new connection.
pub type AcceptCb = Arc<dyn Fn(&Handle) -> Result<()> + Send + Sync>;

type ResetFn = Box<dyn FnMut(&mut (dyn Any + Send)) + Send>;
type FreeFn = Box<dyn FnOnce(Box<dyn Any + Send>) + Send>;

/// Per-handle application payload.
pub struct HandleData {
    value: Box<dyn Any + Send>,
    reset: Option<ResetFn>,
    free: Option<FreeFn>,
}

impl std::fmt::Debug for HandleData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleData")
            .field("reset", &self.reset.is_some())
            .field("free", &self.free.is_some())
            .finish_non_exhaustive()
    }
}

impl HandleData {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self {
            value: Box::new(value),
            reset: None,
            free: None,
        }
    }

    /// Runs when the handle is released and the payload is kept for reuse.
    pub fn on_reset<T, F>(mut self, mut f: F) -> Self
    where
        T: Any + Send,
        F: FnMut(&mut T) + Send + 'static,
    {
        self.reset = Some(Box::new(move |value| {
            if let Some(value) = value.downcast_mut::<T>() {
                f(value);
            }
        }));
        self
    }

    /// Runs when the payload is discarded for good.
    pub fn on_free<T, F>(mut self, f: F) -> Self
    where
        T: Any + Send,
        F: FnOnce(T) + Send + 'static,
    {
        self.free = Some(Box::new(move |value| {
            if let Ok(value) = value.downcast::<T>() {
                f(*value);
            }
        }));
        self
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.downcast_mut()
    }

    pub(crate) fn reset(&mut self) {
        if let Some(reset) = self.reset.as_mut() {
            reset(self.value.as_mut());
        }
    }

    pub(crate) fn free(self) {
        if let Some(free) = self.free {
            free(self.value);
        }
    }
}

/// Response slot of an HTTP request handle.
pub(crate) type Reply = Arc<ReplySlot>;

pub(crate) struct HandleInner {
    pub(crate) sock: Arc<SocketInner>,
    peer: SocketAddr,
    local: SocketAddr,
    data: Mutex<Option<HandleData>>,
    pub(crate) reply: Option<Reply>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let data = self.data.get_mut().unwrap_or_else(|p| p.into_inner()).take();
        self.sock.release_handle(data);
    }
}

/// Reference-counted proxy for one exchange.
#[derive(Clone)]
pub struct Handle {
    pub(crate) inner: Arc<HandleInner>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("socket", &self.inner.sock.id)
            .field("kind", &self.inner.sock.kind)
            .field("peer", &self.inner.peer)
            .field("references", &self.references())
            .finish()
    }
}

impl Handle {
    pub(crate) fn new(
        sock: Arc<SocketInner>,
        peer: SocketAddr,
        local: SocketAddr,
        data: Option<HandleData>,
        reply: Option<Reply>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                sock,
                peer,
                local,
                data: Mutex::new(data),
                reply,
            }),
        }
    }

    /// Datagram handles of a UDP listener share the listener's receive
    /// loop; read and timer calls on them leave it alone.
    fn is_datagram(&self) -> bool {
        self.inner.sock.is_listener_child()
    }

    fn data_lock(&self) -> MutexGuard<'_, Option<HandleData>> {
        self.inner.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Take another reference to this handle.
    pub fn attach(&self) -> Handle {
        self.clone()
    }

    /// Release this reference. The payload is recycled with the last one.
    pub fn detach(self) {}

    /// Number of live references to this handle.
    pub fn references(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn socket_kind(&self) -> SocketKind {
        self.inner.sock.kind
    }

    pub fn is_stream(&self) -> bool {
        self.inner.sock.kind.is_stream()
    }

    pub fn has_encryption(&self) -> bool {
        self.inner.sock.encrypted
    }

    pub fn is_http(&self) -> bool {
        self.inner.sock.kind == SocketKind::Http
    }

    /// Whether zone transfers may be served over this transport.
    pub fn xfr_allowed(&self) -> bool {
        match self.inner.sock.kind {
            SocketKind::TcpDns => true,
            SocketKind::TlsDns => self.inner.sock.xfr_allowed,
            _ => false,
        }
    }

    /// The owning manager, if it still exists.
    pub fn manager(&self) -> Option<Manager> {
        self.inner.sock.core.manager()
    }

    // Payload

    /// Attach a payload, freeing the previous one.
    pub fn set_data(&self, data: HandleData) {
        let previous = self.data_lock().replace(data);
        if let Some(previous) = previous {
            previous.free();
        }
    }

    /// Run `f` on the payload if it is a `T`.
    pub fn with_data<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut data = self.data_lock();
        data.as_mut().and_then(|d| d.downcast_mut::<T>()).map(f)
    }

    pub fn data<T: Any + Clone>(&self) -> Option<T> {
        self.data_lock().as_ref().and_then(|d| d.downcast_ref::<T>()).cloned()
    }

    // Reading

    /// Start (or restart) delivering messages to `cb`, replacing any
    /// previous callback.
    pub fn read<F>(&self, cb: F)
    where
        F: Fn(&Handle, Result<&[u8]>) + Send + Sync + 'static,
    {
        self.read_with(Arc::new(cb));
    }

    pub fn read_with(&self, cb: RecvCb) {
        let sock = &self.inner.sock;
        if sock.kind == SocketKind::Http && !sock.is_client() {
            tracing::debug!(socket = %sock.id, "read() on an HTTP request handle has no effect");
            return;
        }
        if self.is_datagram() {
            tracing::debug!(socket = %sock.id, "read() on a UDP request handle has no effect");
            return;
        }
        if !sock.is_usable() {
            let handle = self.clone();
            sock.core.enqueue(sock.tid, move || cb(&handle, Err(NetError::Canceled)));
            return;
        }
        sock.start_read(Some(self), cb);
    }

    pub fn pause_read(&self) {
        if !self.is_datagram() {
            self.inner.sock.pause_read();
        }
    }

    pub fn resume_read(&self) {
        if !self.is_datagram() {
            self.inner.sock.resume_read();
        }
    }

    /// Deliver one canceled result to the active callback and stop reading.
    /// Further calls do nothing.
    pub fn cancel_read(&self) {
        let sock = &self.inner.sock;
        if self.is_datagram() {
            return;
        }
        if let Some((cb, held)) = sock.cancel_read() {
            let handle = held.clone().unwrap_or_else(|| self.clone());
            sock.core.enqueue(sock.tid, move || {
                cb(&handle, Err(NetError::Canceled));
                drop(held);
            });
        }
    }

    // Timers

    /// Arm the read timer. Zero disarms it.
    pub fn set_timeout(&self, timeout: Duration) {
        if !self.is_datagram() {
            self.inner.sock.set_timeout(timeout);
        }
    }

    pub fn clear_timeout(&self) {
        if !self.is_datagram() {
            self.inner.sock.clear_timeout();
        }
    }

    pub fn timer_running(&self) -> bool {
        !self.is_datagram() && self.inner.sock.timer_running()
    }

    /// Select the keepalive (true) or idle (false) timeout. DNS stream
    /// transports only.
    pub fn keepalive(&self, keepalive: bool) {
        self.inner.sock.set_keepalive(keepalive);
    }

    /// Fail sends that do not complete within `timeout`. Zero disables.
    pub fn set_write_timeout(&self, timeout: Duration) {
        self.inner.sock.set_write_timeout(timeout);
    }

    // Sending

    /// Send `data`. `cb` runs exactly once with the outcome.
    ///
    /// DNS stream transports add the length prefix; payloads over 65535
    /// bytes fail with [`NetError::MessageTooLarge`] before anything is
    /// written.
    pub fn send<F>(&self, data: impl Into<Bytes>, cb: F)
    where
        F: FnOnce(&Handle, Result<()>) + Send + 'static,
    {
        let completion = SendCompletion::new(self.clone(), cb);
        self.inner.sock.send(self, data.into(), completion);
    }

    /// Answer an HTTP request with 400. No effect on other transports.
    pub fn bad_request(&self) {
        if let Some(reply) = &self.inner.reply {
            if let Err(e) = reply.respond(StatusCode::BAD_REQUEST, Bytes::new()) {
                tracing::debug!(error = %e, "Could not send 400 response");
            }
        }
    }

    /// Set `Cache-Control: max-age` on the HTTP response. No effect on
    /// other transports.
    pub fn set_max_age(&self, ttl: u32) {
        if let Some(reply) = &self.inner.reply {
            reply.set_max_age(ttl);
        }
    }
}

type SendFn = Box<dyn FnOnce(&Handle, Result<()>) + Send>;

/// Pending send callback. Fires `Canceled` if dropped without completing.
pub(crate) struct SendCompletion {
    handle: Handle,
    cb: Option<SendFn>,
}

impl SendCompletion {
    pub(crate) fn new<F>(handle: Handle, cb: F) -> Self
    where
        F: FnOnce(&Handle, Result<()>) + Send + 'static,
    {
        Self {
            handle,
            cb: Some(Box::new(cb)),
        }
    }

    pub(crate) fn complete(mut self, result: Result<()>) {
        if let Some(cb) = self.cb.take() {
            cb(&self.handle, result);
        }
    }

    /// Complete on the socket's worker instead of the current call stack.
    pub(crate) fn complete_later(self, result: Result<()>) {
        let sock = self.handle.inner.sock.clone();
        sock.core.enqueue(sock.tid, move || self.complete(result));
    }
}

impl Drop for SendCompletion {
    fn drop(&mut self) {
        if let Some(cb) = self.cb.take() {
            cb(&self.handle, Err(NetError::Canceled));
        }
    }
}

type ConnectFn = Box<dyn FnOnce(Result<Handle>) + Send>;

/// Pending connect callback. Fires `Canceled` if dropped without completing.
pub(crate) struct ConnectCompletion {
    cb: Option<ConnectFn>,
}

impl ConnectCompletion {
    pub(crate) fn new<F>(cb: F) -> Self
    where
        F: FnOnce(Result<Handle>) + Send + 'static,
    {
        Self {
            cb: Some(Box::new(cb)),
        }
    }

    pub(crate) fn complete(mut self, result: Result<Handle>) {
        if let Some(cb) = self.cb.take() {
            cb(result);
        }
    }
}

impl Drop for ConnectCompletion {
    fn drop(&mut self) {
        if let Some(cb) = self.cb.take() {
            cb(Err(NetError::Canceled));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn handle_data_reset_and_free() {
        let frees = Arc::new(AtomicUsize::new(0));
        let f = frees.clone();
        let mut data = HandleData::new(vec![1u8, 2, 3])
            .on_reset(|v: &mut Vec<u8>| v.clear())
            .on_free(move |v: Vec<u8>| {
                assert!(v.is_empty());
                f.fetch_add(1, Ordering::SeqCst);
            });

        data.reset();
        assert_eq!(data.downcast_ref::<Vec<u8>>().map(Vec::len), Some(0));
        data.free();
        assert_eq!(frees.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connect_completion_fires_canceled_on_drop() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let completion = ConnectCompletion::new(move |res: Result<Handle>| {
            *s.lock().unwrap() = Some(res.err());
        });
        drop(completion);
        assert_eq!(*seen.lock().unwrap(), Some(Some(NetError::Canceled)));
    }
}
