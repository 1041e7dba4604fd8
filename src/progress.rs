//! Shared progress reporting and cooperative cancellation.
//!
//! Every long-running stage of the pipeline holds a clone of [`Progress`]
//! and calls [`Progress::checkpoint`] at work-item boundaries. Callers can
//! cancel from any thread; workers notice at the next checkpoint, unwind
//! with [`Error::Cancelled`](crate::error::Error::Cancelled) and leave
//! shared state untouched.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Cheap-to-clone handle onto a shared progress counter and cancel flag.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    completed: AtomicUsize,
    total: AtomicUsize,
    cancelled: AtomicBool,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` expected work units to the total.
    pub fn add_work(&self, n: usize) {
        self.inner.total.fetch_add(n, Ordering::Relaxed);
    }

    /// Mark one work unit as done.
    pub fn step(&self) {
        self.inner.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark `n` work units as done.
    pub fn advance(&self, n: usize) {
        self.inner.completed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn completed(&self) -> usize {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Completed fraction in `[0, 1]`, or 0.0 before any work is added.
    pub fn fraction(&self) -> f32 {
        let total = self.total();
        if total == 0 {
            0.0
        } else {
            (self.completed() as f32 / total as f32).min(1.0)
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Relaxed)
    }

    /// Cancellation boundary. Workers call this between work items.
    #[inline]
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
