//! Admission control for accepted connections.
//!
//! A [`Quota`] is a counter with a hard ceiling and a soft limit. Listeners
//! acquire a slot before handing a new connection to the application; the
//! slot is held by a [`QuotaPermit`] that lives as long as the connection.
//!
//! A `max` of zero means unlimited. Reaching `soft` still admits the
//! connection, but the permit reports it so the caller can log it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{NetError, Result};

#[derive(Debug)]
struct QuotaInner {
    max: AtomicUsize,
    soft: AtomicUsize,
    used: AtomicUsize,
}

/// Shared admission counter. Cloning attaches, dropping detaches.
#[derive(Debug, Clone)]
pub struct Quota {
    inner: Arc<QuotaInner>,
}

impl Quota {
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(QuotaInner {
                max: AtomicUsize::new(max),
                soft: AtomicUsize::new(0),
                used: AtomicUsize::new(0),
            }),
        }
    }

    pub fn attach(&self) -> Self {
        self.clone()
    }

    pub fn detach(self) {}

    pub fn with_soft(max: usize, soft: usize) -> Self {
        let quota = Self::new(max);
        quota.set_soft(soft);
        quota
    }

    pub fn set_max(&self, max: usize) {
        self.inner.max.store(max, Ordering::Release);
    }

    /// Zero disables the soft limit.
    pub fn set_soft(&self, soft: usize) {
        self.inner.soft.store(soft, Ordering::Release);
    }

    pub fn max(&self) -> usize {
        self.inner.max.load(Ordering::Acquire)
    }

    pub fn soft(&self) -> usize {
        self.inner.soft.load(Ordering::Acquire)
    }

    /// Slots currently held.
    pub fn used(&self) -> usize {
        self.inner.used.load(Ordering::Acquire)
    }

    /// Take one slot, or fail with [`NetError::Quota`] when the ceiling is reached.
    ///
    /// The counter is updated with a compare-and-swap loop, so concurrent
    /// callers can never push `used` past `max`, not even briefly.
    pub fn acquire(&self) -> Result<QuotaPermit> {
        let max = self.max();
        let soft = self.soft();
        let previous = self
            .inner
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                if max != 0 && used >= max {
                    None
                } else {
                    Some(used + 1)
                }
            })
            .map_err(|_| NetError::Quota)?;

        Ok(QuotaPermit {
            quota: self.clone(),
            soft: soft != 0 && previous >= soft,
        })
    }

    fn release(&self) {
        let previous = self.inner.used.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "quota released more often than acquired");
    }
}

/// One admitted slot. Released when dropped.
#[derive(Debug)]
#[must_use = "dropping a permit releases the quota slot immediately"]
pub struct QuotaPermit {
    quota: Quota,
    soft: bool,
}

impl QuotaPermit {
    /// True when this slot was granted past the soft limit.
    pub fn is_soft(&self) -> bool {
        self.soft
    }

    pub fn quota(&self) -> &Quota {
        &self.quota
    }
}

impl Drop for QuotaPermit {
    fn drop(&mut self) {
        self.quota.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max() {
        let quota = Quota::new(2);
        let a = quota.acquire().unwrap();
        let b = quota.acquire().unwrap();
        assert_eq!(quota.acquire().unwrap_err(), NetError::Quota);
        assert_eq!(quota.used(), 2);

        drop(a);
        let c = quota.acquire().unwrap();
        assert_eq!(quota.used(), 2);
        drop(b);
        drop(c);
        assert_eq!(quota.used(), 0);
    }

    #[test]
    fn zero_max_is_unlimited() {
        let quota = Quota::new(0);
        let permits: Vec<_> = (0..1000).map(|_| quota.acquire().unwrap()).collect();
        assert_eq!(quota.used(), 1000);
        drop(permits);
        assert_eq!(quota.used(), 0);
    }

    #[test]
    fn soft_limit_still_admits() {
        let quota = Quota::with_soft(3, 1);
        let a = quota.acquire().unwrap();
        assert!(!a.is_soft());
        let b = quota.acquire().unwrap();
        assert!(b.is_soft());
        let c = quota.acquire().unwrap();
        assert!(c.is_soft());
        assert!(quota.acquire().is_err());
    }

    #[test]
    fn concurrent_acquire_never_exceeds_max() {
        let quota = Quota::new(8);
        let peak = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let quota = quota.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        if let Ok(permit) = quota.acquire() {
                            peak.fetch_max(quota.used(), Ordering::SeqCst);
                            drop(permit);
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 8);
        assert_eq!(quota.used(), 0);
    }
}
