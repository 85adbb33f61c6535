//! Bounded context buffer with leases.
//!
//! The buffer keeps the most recent records in sequence order. It evicts from
//! the front once it holds more than `capacity` records, except for records
//! covered by a live lease. Leased records may push the buffer past
//! `capacity`, but never past `ceiling`: at the ceiling the oldest lease is
//! force-released and its holder sees [`LeaseGuard::is_forced`].
//!
//! A lease stops pinning records as soon as its whole range has been
//! appended: the buffer copies the range into the lease ([`Capture`]) and
//! drops it from the pinned set, so a completed window survives any amount
//! of later ingestion even if its holder has not run yet.
//!
//! Writers and readers share the buffer behind a single mutex; every critical
//! section is O(records touched). Appends publish the latest sequence number
//! on a `watch` channel so assemblers can wait for after-context without
//! polling.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BufferConfig;
use crate::error::{LogwatchError, Result};
use crate::types::LogRecord;

/// Result of a successful append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Records evicted by this append
    pub evicted: usize,
    /// Leases force-released to stay under the ceiling
    pub forced_leases: usize,
}

/// Records copied out of the buffer.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Resident records in the requested range, oldest first
    pub records: Vec<Arc<LogRecord>>,
    /// True if part of the requested range was already evicted
    pub gap: bool,
}

/// Records copied when a lease's whole range had been appended.
#[derive(Debug, Clone)]
pub struct Capture {
    /// The leased range as it was resident at capture time
    pub snapshot: Snapshot,
    /// When the last record of the range was appended
    pub captured_at: Instant,
}

#[derive(Debug, Default)]
struct LeaseState {
    forced: AtomicBool,
    capture: Mutex<Option<Capture>>,
}

impl LeaseState {
    fn complete(&self, snapshot: Snapshot) {
        *self.capture.lock() = Some(Capture {
            snapshot,
            captured_at: Instant::now(),
        });
    }
}

#[derive(Debug)]
struct Lease {
    from: u64,
    to: u64,
    state: Arc<LeaseState>,
}

impl Lease {
    const fn covers(&self, sequence_no: u64) -> bool {
        self.from <= sequence_no && sequence_no <= self.to
    }
}

#[derive(Debug, Default)]
struct Inner {
    records: VecDeque<Arc<LogRecord>>,
    first_sequence: Option<u64>,
    last_sequence: Option<u64>,
    leases: BTreeMap<u64, Lease>,
    next_lease_id: u64,
}

impl Inner {
    fn is_protected(&self, sequence_no: u64) -> bool {
        self.leases.values().any(|lease| lease.covers(sequence_no))
    }

    fn range(&self, from: u64, to: u64) -> Snapshot {
        let (Some(first), Some(last)) = (self.first_sequence, self.last_sequence) else {
            return Snapshot::default();
        };

        let lo = from.max(first);
        let hi = to.min(last);
        if lo > hi {
            return Snapshot::default();
        }

        let start = self.records.partition_point(|r| r.sequence_no < lo);
        let end = self.records.partition_point(|r| r.sequence_no <= hi);
        let records: Vec<Arc<LogRecord>> = self.records.range(start..end).cloned().collect();

        let resident_from = self.records.front().map_or(u64::MAX, |r| r.sequence_no);
        Snapshot {
            records,
            gap: resident_from > lo,
        }
    }

    /// Captures and unpins every lease whose range ends at or before `latest`.
    fn capture_completed(&mut self, latest: u64) {
        if !self.leases.values().any(|lease| lease.to <= latest) {
            return;
        }
        let completed: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.to <= latest)
            .map(|(id, _)| *id)
            .collect();
        for id in completed {
            if let Some(lease) = self.leases.remove(&id) {
                lease.state.complete(self.range(lease.from, lease.to));
                debug!(lease = id, "lease range complete");
            }
        }
    }

    fn force_oldest_lease(&mut self) -> bool {
        let Some((id, lease)) = self.leases.pop_first() else {
            return false;
        };
        lease.state.forced.store(true, Ordering::Release);
        warn!(
            lease = id,
            from = lease.from,
            to = lease.to,
            "context buffer at ceiling, force-releasing lease"
        );
        true
    }
}

/// Sequence-ordered, bounded record buffer.
#[derive(Debug)]
pub struct ContextBuffer {
    config: BufferConfig,
    inner: Mutex<Inner>,
    latest: watch::Sender<Option<u64>>,
}

impl ContextBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new(config: BufferConfig) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            latest,
        }
    }

    /// Buffer limits.
    #[must_use]
    pub const fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns `LogwatchError::OutOfOrder` if the record's sequence number is
    /// not greater than the last appended one. The buffer is unchanged.
    pub fn append(&self, record: Arc<LogRecord>) -> Result<AppendOutcome> {
        let sequence_no = record.sequence_no;
        let mut outcome = AppendOutcome::default();

        {
            let mut inner = self.inner.lock();
            if let Some(last) = inner.last_sequence {
                if sequence_no <= last {
                    return Err(LogwatchError::OutOfOrder {
                        last,
                        got: sequence_no,
                    });
                }
            }

            inner.first_sequence.get_or_insert(sequence_no);
            inner.last_sequence = Some(sequence_no);
            inner.records.push_back(record);
            inner.capture_completed(sequence_no);

            while inner.records.len() > self.config.capacity {
                let Some(front) = inner.records.front().map(|r| r.sequence_no) else {
                    break;
                };
                if inner.is_protected(front) {
                    if inner.records.len() <= self.config.ceiling {
                        break;
                    }
                    if inner.force_oldest_lease() {
                        outcome.forced_leases += 1;
                    }
                    continue;
                }
                inner.records.pop_front();
                outcome.evicted += 1;
            }
        }

        self.latest.send_replace(Some(sequence_no));
        Ok(outcome)
    }

    /// Copies the resident records with sequence numbers in `from..=to`.
    ///
    /// `gap` is set when records in that range were ingested but have since
    /// been evicted. Sequence numbers before the first append or after the
    /// last one are never a gap.
    #[must_use]
    pub fn snapshot(&self, from: u64, to: u64) -> Snapshot {
        self.inner.lock().range(from, to)
    }

    /// Protects records in `from..=to` from eviction until the range has been
    /// fully appended, the guard drops, or the lease is forced at the ceiling.
    ///
    /// A range that is already complete is captured immediately.
    #[must_use]
    pub fn lease(self: &Arc<Self>, from: u64, to: u64) -> LeaseGuard {
        let state = Arc::new(LeaseState::default());
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_lease_id;
            inner.next_lease_id += 1;
            if inner.last_sequence.is_some_and(|last| last >= to) {
                state.complete(inner.range(from, to));
            } else {
                inner.leases.insert(
                    id,
                    Lease {
                        from,
                        to,
                        state: Arc::clone(&state),
                    },
                );
            }
            id
        };
        debug!(lease = id, from, to, "lease acquired");

        LeaseGuard {
            buffer: Arc::clone(self),
            id,
            state,
        }
    }

    /// Watches the latest appended sequence number.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.latest.subscribe()
    }

    /// Sequence number of the most recent append.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.inner.lock().last_sequence
    }

    /// Number of resident records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns true if no records are resident.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Number of leases still pinning records.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.inner.lock().leases.len()
    }

    fn release(&self, id: u64) {
        if self.inner.lock().leases.remove(&id).is_some() {
            debug!(lease = id, "lease released");
        }
    }
}

/// Holds a lease; dropping it releases the lease.
#[derive(Debug)]
pub struct LeaseGuard {
    buffer: Arc<ContextBuffer>,
    id: u64,
    state: Arc<LeaseState>,
}

impl LeaseGuard {
    /// Returns true if the buffer force-released this lease.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.state.forced.load(Ordering::Acquire)
    }

    /// The leased range, once every record in it has been appended.
    #[must_use]
    pub fn captured(&self) -> Option<Capture> {
        self.state.capture.lock().clone()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.buffer.release(self.id);
    }
}
