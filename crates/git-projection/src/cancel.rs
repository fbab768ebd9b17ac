//! Shutdown tokens for the projection background work.
//!
//! The engine owns a single [`ShutdownSignal`]; every long-running loop holds a
//! cloned [`CancellationToken`] and checks it at well-defined points: after a
//! rebuild attempt, before placeholder sync, and at the top of the wait loop.
//!
//! ## Sparse Checking
//!
//! Tight loops (index parsing, per-placeholder work) use
//! `is_cancelled_sparse()`, which only reads the atomic every
//! `CANCEL_CHECK_INTERVAL` iterations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How often tight loops check whether shutdown was requested.
/// Using a power of 2 allows efficient modulo via bitwise AND.
pub const CANCEL_CHECK_INTERVAL: usize = 0x400; // 1,024

/// Owner side of the shutdown flag.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Creates a signal that has not been triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown. Every token created from this signal observes it.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Returns true once `trigger` has been called.
    pub fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Creates a token observing this signal.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            requested: Some(self.requested.clone()),
        }
    }
}

/// A cheap, cloneable view of a [`ShutdownSignal`].
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    requested: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    /// Creates a cancellation token that is never cancelled.
    ///
    /// Useful for tests or operations that should not be interruptible.
    #[inline]
    pub fn noop() -> Self {
        Self { requested: None }
    }

    /// Checks if this token is still active.
    ///
    /// Returns `Some(())` if still active, `None` if cancelled.
    /// This enables use with the `?` operator for early returns.
    #[inline]
    pub fn is_cancelled(&self) -> Option<()> {
        match &self.requested {
            Some(flag) if flag.load(Ordering::Relaxed) => None,
            _ => Some(()),
        }
    }

    /// Sparse cancellation check - only checks every `CANCEL_CHECK_INTERVAL` iterations.
    #[inline]
    pub fn is_cancelled_sparse(&self, counter: usize) -> Option<()> {
        if counter & (CANCEL_CHECK_INTERVAL - 1) == 0 {
            self.is_cancelled()
        } else {
            Some(())
        }
    }

    /// Convenience inverse of [`Self::is_cancelled`].
    #[inline]
    pub fn cancelled(&self) -> bool {
        self.is_cancelled().is_none()
    }
}
