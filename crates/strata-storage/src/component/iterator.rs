//! Tuple-level iteration over a finalized component.

use super::throttle::{IterProgress, ThrottleHook};
use crate::datapage::DataPage;
use crate::store::PageStore;
use crate::tree::IndexIterator;
use crate::tuple::DataTuple;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata_common::{Result, StrataError, Xid};

/// Registration of one open iterator with its component.
///
/// Incremented on creation, decremented exactly once when dropped.
pub(crate) struct IteratorGuard(Arc<AtomicUsize>);

impl IteratorGuard {
    pub(crate) fn register(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(open))
    }
}

impl Drop for IteratorGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IterState {
    Open,
    Exhausted,
    Closed,
}

/// Iterator over the tuples of a finalized component in key order.
///
/// Walks the index leaf level with an [`IndexIterator`] and scans each data
/// page it names. Only the current data page is held in memory.
pub struct ComponentIterator {
    store: Arc<dyn PageStore>,
    xid: Xid,
    index: IndexIterator,
    page: Option<DataPage>,
    pos: usize,
    /// Applied to the first page loaded, then cleared.
    seek_key: Option<Bytes>,
    throttle: Option<ThrottleHook>,
    progress: IterProgress,
    registration: Option<IteratorGuard>,
    state: IterState,
}

impl ComponentIterator {
    pub(crate) fn new(
        store: Arc<dyn PageStore>,
        xid: Xid,
        index: IndexIterator,
        seek_key: Option<Bytes>,
        throttle: Option<ThrottleHook>,
        guard: IteratorGuard,
    ) -> Self {
        Self {
            store,
            xid,
            index,
            page: None,
            pos: 0,
            seek_key,
            throttle,
            progress: IterProgress::default(),
            registration: Some(guard),
            state: IterState::Open,
        }
    }

    /// Returns the next tuple, `Ok(None)` once the component is exhausted.
    pub fn next_tuple(&mut self) -> Result<Option<DataTuple>> {
        match self.state {
            IterState::Closed => return Err(StrataError::IteratorClosed),
            IterState::Exhausted => return Ok(None),
            IterState::Open => {}
        }

        match self.step() {
            Ok(Some(tuple)) => Ok(Some(tuple)),
            Ok(None) => {
                self.state = IterState::Exhausted;
                self.page = None;
                Ok(None)
            }
            Err(e) => {
                self.state = IterState::Exhausted;
                self.page = None;
                Err(e)
            }
        }
    }

    fn step(&mut self) -> Result<Option<DataTuple>> {
        loop {
            if let Some(page) = &self.page {
                if self.pos < page.len() {
                    let tuple = page.get(self.pos)?;
                    self.pos += 1;
                    self.record_tuple(&tuple);
                    return Ok(Some(tuple));
                }
                self.page = None;
                self.progress.pages_read += 1;
                self.report_page_boundary();
            }

            let Some(entry) = self.index.next_entry()? else {
                return Ok(None);
            };
            let page = DataPage::load(self.store.as_ref(), self.xid, entry.page)?;
            self.pos = match self.seek_key.take() {
                Some(key) => page.lower_bound(&key),
                None => 0,
            };
            self.page = Some(page);
        }
    }

    fn record_tuple(&mut self, tuple: &DataTuple) {
        let bytes = tuple.encoded_size();
        self.progress.tuples_read += 1;
        self.progress.bytes_read += bytes as u64;
        if let Some(hook) = &self.throttle {
            hook.manager.tuple_read(bytes);
        }
    }

    fn report_page_boundary(&self) {
        if let Some(hook) = &self.throttle {
            let flushing = hook.flush_signal.is_raised();
            hook.manager
                .page_boundary(&self.progress, hook.target_progress_delta, flushing);
        }
    }

    /// Cumulative progress so far.
    pub fn progress(&self) -> IterProgress {
        self.progress
    }

    /// Releases the held page and the iterator's registration with its
    /// component. Safe to call any number of times.
    pub fn close(&mut self) {
        self.page = None;
        self.index.close();
        self.registration = None;
        self.state = IterState::Closed;
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state == IterState::Closed
    }
}

impl Iterator for ComponentIterator {
    type Item = Result<DataTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.state == IterState::Closed {
            return None;
        }
        self.next_tuple().transpose()
    }
}

impl std::fmt::Debug for ComponentIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentIterator")
            .field("xid", &self.xid)
            .field("page", &self.page.as_ref().map(|p| p.page_id()))
            .field("pos", &self.pos)
            .field("progress", &self.progress)
            .field("state", &self.state)
            .field("registered", &self.registration.is_some())
            .finish_non_exhaustive()
    }
}
