//! Shared state for the page workers: the cursor queue and the record sink.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

use crate::types::{Cursor, Record};

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Cursor>,
    in_flight: usize,
    aborted: bool,
}

/// Work queue of continuation cursors.
///
/// A worker that takes a cursor holds it "in flight" until it calls
/// [`complete`](CursorQueue::complete), which may enqueue the page's own
/// continuation. The queue is drained once nothing is pending and nothing is
/// in flight; only then does [`next`](CursorQueue::next) return `None`.
#[derive(Debug, Default)]
pub struct CursorQueue {
    state: Mutex<QueueState>,
    wake: Notify,
}

impl CursorQueue {
    pub fn new(seed: impl IntoIterator<Item = Cursor>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: seed.into_iter().collect(),
                ..Default::default()
            }),
            wake: Notify::new(),
        }
    }

    /// Wait for the next cursor. `None` once drained or aborted.
    pub async fn next(&self) -> Option<Cursor> {
        loop {
            // Registered before the state check so a concurrent
            // `complete` cannot slip between check and wait.
            let notified = self.wake.notified();
            {
                let mut state = self.lock();
                if state.aborted {
                    return None;
                }
                if let Some(cursor) = state.pending.pop_front() {
                    state.in_flight += 1;
                    return Some(cursor);
                }
                if state.in_flight == 0 {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark one in-flight cursor finished, enqueueing its continuation.
    pub fn complete(&self, next: Option<Cursor>) {
        {
            let mut state = self.lock();
            if let Some(cursor) = next {
                state.pending.push_back(cursor);
            }
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.wake.notify_waiters();
    }

    /// Stop handing out cursors; every waiter returns `None`.
    pub fn abort(&self) {
        self.lock().aborted = true;
        self.wake.notify_waiters();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Concurrent sink for fetched records.
#[derive(Debug, Default)]
pub struct RecordCollector {
    inner: Mutex<Collected>,
}

#[derive(Debug, Default)]
struct Collected {
    records: Vec<Record>,
    pages: usize,
}

impl RecordCollector {
    pub fn new(first_page: Vec<Record>) -> Self {
        Self {
            inner: Mutex::new(Collected {
                records: first_page,
                pages: 1,
            }),
        }
    }

    pub fn push_page(&self, records: Vec<Record>) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.records.extend(records);
        inner.pages += 1;
    }

    pub fn pages(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).pages
    }

    /// Take every collected record, leaving the collector empty.
    pub fn take(&self) -> Vec<Record> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut inner.records)
    }
}
