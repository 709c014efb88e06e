//! Memory accounting for transport buffers.
//!
//! A [`MemContext`] does not allocate anything itself. Callers reserve the
//! size of the buffers they hold, and the context tracks current and peak
//! usage and reports water mark crossings.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Water mark notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaterEvent {
    /// Usage rose above the high water mark.
    High,
    /// Usage fell below the low water mark after a high event.
    Low,
}

type WaterCallback = Arc<dyn Fn(&MemContext, WaterEvent) + Send + Sync>;

struct Water {
    hi: usize,
    lo: usize,
    cb: WaterCallback,
    above: bool,
}

struct MemInner {
    name: String,
    inuse: AtomicUsize,
    maxinuse: AtomicUsize,
    overmem: AtomicBool,
    water: Mutex<Option<Water>>,
}

/// Named, shareable accounting context.
#[derive(Clone)]
pub struct MemContext {
    inner: Arc<MemInner>,
}

impl fmt::Debug for MemContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemContext")
            .field("name", &self.inner.name)
            .field("inuse", &self.inuse())
            .field("maxinuse", &self.maxinuse())
            .finish()
    }
}

impl MemContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemInner {
                name: name.into(),
                inuse: AtomicUsize::new(0),
                maxinuse: AtomicUsize::new(0),
                overmem: AtomicBool::new(false),
                water: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bytes currently reserved.
    pub fn inuse(&self) -> usize {
        self.inner.inuse.load(Ordering::Acquire)
    }

    /// Highest value `inuse` has reached.
    pub fn maxinuse(&self) -> usize {
        self.inner.maxinuse.load(Ordering::Acquire)
    }

    /// Account for `size` bytes until the returned reservation is dropped.
    pub fn reserve(&self, size: usize) -> MemReservation {
        let now = self.inner.inuse.fetch_add(size, Ordering::AcqRel) + size;
        self.inner.maxinuse.fetch_max(now, Ordering::AcqRel);
        self.check_water(now);
        MemReservation {
            ctx: self.clone(),
            size,
        }
    }

    /// Zeroed buffer of `size` bytes, accounted until it is dropped.
    pub fn allocate(&self, size: usize) -> MemBuffer {
        MemBuffer {
            buf: BytesMut::zeroed(size),
            reservation: self.reserve(size),
        }
    }

    /// Install high/low water marks. `hi == 0` removes them.
    ///
    /// `cb` gets the context so it can call [`MemContext::waterack`].
    ///
    /// # Panics
    /// Panics if `lo > hi`.
    pub fn setwater<F>(&self, hi: usize, lo: usize, cb: F)
    where
        F: Fn(&MemContext, WaterEvent) + Send + Sync + 'static,
    {
        assert!(lo <= hi, "low water mark above high water mark");
        let mut water = self.lock_water();
        *water = if hi == 0 {
            None
        } else {
            Some(Water {
                hi,
                lo,
                cb: Arc::new(cb),
                above: false,
            })
        };
    }

    /// Acknowledge a water event; `is_overmem` follows the last acknowledged one.
    pub fn waterack(&self, event: WaterEvent) {
        self.inner
            .overmem
            .store(event == WaterEvent::High, Ordering::Release);
    }

    pub fn is_overmem(&self) -> bool {
        self.inner.overmem.load(Ordering::Acquire)
    }

    fn release(&self, size: usize) {
        let now = self.inner.inuse.fetch_sub(size, Ordering::AcqRel) - size;
        self.check_water(now);
    }

    fn check_water(&self, now: usize) {
        let fire = {
            let mut water = self.lock_water();
            match water.as_mut() {
                Some(w) if !w.above && now > w.hi => {
                    w.above = true;
                    Some((w.cb.clone(), WaterEvent::High))
                }
                Some(w) if w.above && now < w.lo => {
                    w.above = false;
                    Some((w.cb.clone(), WaterEvent::Low))
                }
                _ => None,
            }
        };
        if let Some((cb, event)) = fire {
            tracing::debug!(context = %self.inner.name, inuse = now, ?event, "Memory water mark crossed");
            cb(self, event);
        }
    }

    fn lock_water(&self) -> std::sync::MutexGuard<'_, Option<Water>> {
        self.inner
            .water
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Accounted bytes, returned to the context on drop.
#[derive(Debug)]
pub struct MemReservation {
    ctx: MemContext,
    size: usize,
}

impl MemReservation {
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MemReservation {
    fn drop(&mut self) {
        self.ctx.release(self.size);
    }
}

/// Buffer whose size is charged to a [`MemContext`].
#[derive(Debug)]
pub struct MemBuffer {
    buf: BytesMut,
    reservation: MemReservation,
}

impl MemBuffer {
    pub fn reserved(&self) -> usize {
        self.reservation.size()
    }
}

impl Deref for MemBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for MemBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}
