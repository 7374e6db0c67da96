//! Cooperative cancellation.
//!
//! Long-running operations poll a [`CancelFlag`] at fixed points (before
//! each extracted entry, before each demultiplexed packet) and report an
//! [`Outcome`] instead of an error when they stop early.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared, clonable cancellation signal
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Creates a flag in the "not cancelled" state
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; every clone observes it
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called
    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}

/// How an operation that supports cancellation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// All work was attempted
    Completed,
    /// Stopped early on request; partial output is kept
    Cancelled,
}

impl Outcome {
    /// Returns true for [`Outcome::Cancelled`]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }
}
