//! Completion signals.
//!
//! A job submitted with the fence-out flag gets a [`Fence`] that is
//! signalled when every assigned core has finished. A job submitted with
//! fence-in waits on the caller's fence first, unless that fence was
//! produced by this driver's own context.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{NpuError, Result};

/// One-shot completion signal.
pub trait Fence: fmt::Debug + Send + Sync {
    /// Context the fence was allocated from.
    fn context(&self) -> u64;
    /// Sequence number within its context.
    fn seqno(&self) -> u64;
    /// Mark complete and wake waiters. Idempotent.
    fn signal(&self);
    /// True once signalled.
    fn is_signaled(&self) -> bool;
    /// Block until signalled or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::Timeout`] if the fence is not signalled in time.
    fn wait(&self, timeout: Duration) -> Result<()>;
}

/// Allocator of fences for one timeline.
pub trait FenceContext: fmt::Debug + Send + Sync {
    /// Context id shared by every fence this allocator produces.
    fn context(&self) -> u64;
    /// Allocate a new unsignalled fence.
    ///
    /// # Errors
    ///
    /// Returns an error if the fence cannot be allocated.
    fn allocate(&self) -> Result<Arc<dyn Fence>>;
}

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Fence built on a mutex and condition variable.
#[derive(Debug)]
pub struct SyncFence {
    context: u64,
    seqno: u64,
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl SyncFence {
    /// Create an unsignalled fence.
    #[must_use]
    pub const fn new(context: u64, seqno: u64) -> Self {
        Self {
            context,
            seqno,
            signaled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Create an unsignalled fence on a fresh context, not tied to any
    /// driver. Useful as a foreign input fence.
    #[must_use]
    pub fn foreign() -> Arc<Self> {
        Arc::new(Self::new(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed), 1))
    }
}

impl Fence for SyncFence {
    fn context(&self) -> u64 {
        self.context
    }

    fn seqno(&self) -> u64 {
        self.seqno
    }

    fn signal(&self) {
        let mut s = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        *s = true;
        self.cv.notify_all();
    }

    fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let guard = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |s| !*s)
            .unwrap_or_else(PoisonError::into_inner);
        if *guard {
            Ok(())
        } else {
            Err(NpuError::timeout(start.elapsed(), 0))
        }
    }
}

/// Allocator for [`SyncFence`]s.
#[derive(Debug)]
pub struct SyncFenceContext {
    context: u64,
    next_seqno: AtomicU64,
}

impl Default for SyncFenceContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncFenceContext {
    /// Create a context with a process-unique id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            context: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
            next_seqno: AtomicU64::new(1),
        }
    }
}

impl FenceContext for SyncFenceContext {
    fn context(&self) -> u64 {
        self.context
    }

    fn allocate(&self) -> Result<Arc<dyn Fence>> {
        let seqno = self.next_seqno.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(SyncFence::new(self.context, seqno)))
    }
}
