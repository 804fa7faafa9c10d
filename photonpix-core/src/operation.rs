//! Progress reporting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::{Error, Result};

/// Context passed through long-running work.
///
/// Implementations must be cheap to poll; pipelines call
/// [`Operation::is_cancelled`] once per read block and every few thousand
/// events.
pub trait Operation {
    /// Reports progress as a fraction in `[0, 1]`.
    fn set_progress(&self, fraction: f64);

    /// Returns true once the caller has requested cancellation.
    fn is_cancelled(&self) -> bool;

    /// Fails with [`Error::Cancelled`] if cancellation was requested.
    ///
    /// # Errors
    /// Returns [`Error::Cancelled`] when [`Operation::is_cancelled`] is true.
    fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl<T: Operation + ?Sized> Operation for &T {
    fn set_progress(&self, fraction: f64) {
        (**self).set_progress(fraction);
    }

    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

impl<T: Operation + ?Sized> Operation for Arc<T> {
    fn set_progress(&self, fraction: f64) {
        (**self).set_progress(fraction);
    }

    fn is_cancelled(&self) -> bool {
        (**self).is_cancelled()
    }
}

/// Shareable operation state: a cancel flag and the last reported progress.
///
/// Clones share the same state, so one clone can be handed to a worker
/// thread while another is polled or cancelled from the caller.
#[derive(Debug, Clone, Default)]
pub struct OperationHandle {
    cancel_flag: Arc<AtomicBool>,
    progress_bits: Arc<AtomicU64>,
}

impl OperationHandle {
    /// Creates a fresh, uncancelled handle with zero progress.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Last reported progress fraction.
    #[must_use]
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress_bits.load(Ordering::Relaxed))
    }

    /// The underlying cancel flag.
    #[must_use]
    pub fn cancel_flag(&self) -> &Arc<AtomicBool> {
        &self.cancel_flag
    }
}

impl Operation for OperationHandle {
    fn set_progress(&self, fraction: f64) {
        let clamped = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.progress_bits
            .store(clamped.to_bits(), Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }
}

/// Operation that ignores progress and is never cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopOperation;

impl Operation for NoopOperation {
    fn set_progress(&self, _fraction: f64) {}

    fn is_cancelled(&self) -> bool {
        false
    }
}
