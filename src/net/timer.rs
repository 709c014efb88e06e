//! One-shot timers bound to a handle.
//!
//! The callback runs on the worker that owns the handle's socket. A timer
//! that is restarted or stopped before it fires never delivers the old
//! expiry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{NetError, Result};
use crate::net::handle::Handle;

type TimerCb = Arc<dyn Fn(&Handle, Result<()>) + Send + Sync>;

struct TimerInner {
    handle: Handle,
    cb: TimerCb,
    generation: AtomicU64,
    running: AtomicBool,
}

/// Timer attached to a handle. Cloning attaches another reference to the
/// same timer; the handle is held until the last clone is dropped.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("handle", &self.inner.handle)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Timer {
    /// Create a stopped timer. `cb` gets `Ok(())` on expiry, or
    /// [`NetError::Canceled`] if the socket closed while the timer ran.
    pub fn new<F>(handle: &Handle, cb: F) -> Self
    where
        F: Fn(&Handle, Result<()>) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(TimerInner {
                handle: handle.clone(),
                cb: Arc::new(cb),
                generation: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// (Re)start the timer. A pending expiry is discarded.
    pub fn start(&self, after: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.running.store(true, Ordering::Release);

        let sock = self.inner.handle.inner.sock.clone();
        let weak: Weak<TimerInner> = Arc::downgrade(&self.inner);
        sock.core.clone().spawn_on(sock.tid, async move {
            tokio::time::sleep(after).await;
            let Some(timer) = weak.upgrade() else {
                return;
            };
            if timer.generation.load(Ordering::Acquire) != generation {
                return;
            }
            timer.running.store(false, Ordering::Release);
            let result = if sock.is_usable() {
                Ok(())
            } else {
                Err(NetError::Canceled)
            };
            (timer.cb)(&timer.handle, result);
        });
    }

    /// Stop the timer; a pending expiry is discarded.
    pub fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        self.inner.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }
}
