//! Hooks through which a merge scheduler paces component iterators.
//!
//! The iterator reports every tuple it reads and, before moving to the next
//! leaf data page, its cumulative progress together with the current value
//! of the flush signal. It never waits on the signal; pacing is entirely up
//! to the [`MergeManager`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared flag the scheduler raises while a flush is in progress.
#[derive(Debug, Clone, Default)]
pub struct FlushSignal(Arc<AtomicBool>);

impl FlushSignal {
    /// Creates a lowered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Lowers the signal.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Returns true while the signal is raised.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Cumulative progress of one component iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterProgress {
    /// Tuples returned so far.
    pub tuples_read: u64,
    /// Encoded bytes of the tuples returned so far.
    pub bytes_read: u64,
    /// Leaf data pages fully consumed.
    pub pages_read: u64,
}

/// Scheduler-side receiver of iterator progress.
pub trait MergeManager: Send + Sync {
    /// A tuple of `bytes` encoded bytes was read.
    fn tuple_read(&self, bytes: usize);

    /// The iterator finished a leaf data page and is about to load the next.
    fn page_boundary(&self, progress: &IterProgress, target_progress_delta: f64, flushing: bool);
}

/// Throttle configuration handed to a component iterator.
#[derive(Clone)]
pub struct ThrottleHook {
    /// Receiver of progress reports.
    pub manager: Arc<dyn MergeManager>,
    /// Flag polled at each page boundary.
    pub flush_signal: FlushSignal,
    /// Progress the scheduler expects between reports.
    pub target_progress_delta: f64,
}

impl ThrottleHook {
    /// Creates a hook.
    pub fn new(
        manager: Arc<dyn MergeManager>,
        flush_signal: FlushSignal,
        target_progress_delta: f64,
    ) -> Self {
        Self {
            manager,
            flush_signal,
            target_progress_delta,
        }
    }
}

impl std::fmt::Debug for ThrottleHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleHook")
            .field("flush_signal", &self.flush_signal)
            .field("target_progress_delta", &self.target_progress_delta)
            .finish_non_exhaustive()
    }
}
