//! Progress and cancellation signal for long-running operations

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Observes long operations and lets the caller request a stop.
///
/// Cancellation is cooperative: the engine polls [`Monitor::is_cancelled`]
/// between units of work and never interrupts a fetch or write in flight.
pub trait Monitor: Send + Sync {
    /// Whether the caller asked the operation to stop
    fn is_cancelled(&self) -> bool;

    /// Report `units` of completed work
    fn worked(&self, units: u64);

    /// Describe the item currently being processed
    fn sub_task(&self, label: &str);
}

/// Monitor that never cancels and discards progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl Monitor for NullMonitor {
    fn is_cancelled(&self) -> bool {
        false
    }

    fn worked(&self, _units: u64) {}

    fn sub_task(&self, _label: &str) {}
}

/// Shared cancellation flag that also counts completed work.
///
/// Clones share state, so one clone can be handed to a signal handler
/// while another is passed to the engine.
#[derive(Debug, Default, Clone)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
    worked: Arc<AtomicU64>,
}

impl CancelFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Total units reported through [`Monitor::worked`]
    #[must_use]
    pub fn total_worked(&self) -> u64 {
        self.worked.load(Ordering::SeqCst)
    }
}

impl Monitor for CancelFlag {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn worked(&self, units: u64) {
        self.worked.fetch_add(units, Ordering::SeqCst);
    }

    fn sub_task(&self, label: &str) {
        tracing::trace!(task = label, "sub task");
    }
}
