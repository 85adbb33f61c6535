//! Bounded dispatch queue between assemblers and the analyzer.
//!
//! The queue never blocks a producer: when it is full the oldest bundle is
//! dropped, counted, and handed back to the caller. Consumers wait on a
//! [`Notify`] and see `None` only after the queue is closed and drained.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::types::ContextBundle;

#[derive(Debug, Default)]
struct QueueState {
    bundles: VecDeque<ContextBundle>,
    closed: bool,
}

/// Drop-oldest FIFO of sealed bundles.
#[derive(Debug)]
pub struct DispatchQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
    dropped: AtomicU64,
}

impl DispatchQueue {
    /// Creates a queue holding at most `capacity` bundles.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Adds a bundle, returning the oldest bundle if one had to be dropped.
    ///
    /// Bundles enqueued after `close` are still accepted so that assemblers
    /// sealing during shutdown are drained.
    pub fn enqueue(&self, bundle: ContextBundle) -> Option<ContextBundle> {
        let evicted = {
            let mut state = self.state.lock();
            let evicted = if state.bundles.len() >= self.capacity {
                state.bundles.pop_front()
            } else {
                None
            };
            state.bundles.push_back(bundle);
            evicted
        };

        if let Some(dropped) = &evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error_id = %dropped.error_id, "dispatch queue full, dropped oldest bundle");
        }
        self.notify.notify_one();
        evicted
    }

    /// Removes the oldest bundle without waiting.
    pub fn try_dequeue(&self) -> Option<ContextBundle> {
        self.state.lock().bundles.pop_front()
    }

    /// Waits for the next bundle; returns `None` once closed and empty.
    pub async fn dequeue(&self) -> Option<ContextBundle> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(bundle) = state.bundles.pop_front() {
                    return Some(bundle);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stops waiting consumers once the queue is empty.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Accepts waiting consumers again after a `close`.
    pub fn reopen(&self) {
        self.state.lock().closed = false;
    }

    /// Returns true if the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Bundles waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().bundles.len()
    }

    /// Returns true if no bundles are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().bundles.is_empty()
    }

    /// Total bundles dropped since creation.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Maximum number of waiting bundles.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
