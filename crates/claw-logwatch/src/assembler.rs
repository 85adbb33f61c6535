//! Context assembly.
//!
//! For each detected error the producer leases the surrounding range of the
//! buffer; an assembler then waits for after-context and seals an immutable
//! [`ContextBundle`].
//! Waiting is driven by the buffer's `watch` channel and bounded by the grace
//! period and the shutdown token.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffer::{ContextBuffer, LeaseGuard, Snapshot};
use crate::config::AssemblyConfig;
use crate::stats::PipelineStats;
use crate::types::{Completeness, ContextBundle, DetectedError, LogRecord};

/// Why the after-context wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitEnd {
    Complete,
    GraceExpired,
    Forced,
    Shutdown,
    BufferClosed,
}

/// Builds context bundles from a shared buffer.
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    buffer: Arc<ContextBuffer>,
    config: AssemblyConfig,
    stats: Arc<PipelineStats>,
}

impl ContextAssembler {
    /// Creates an assembler over the given buffer.
    #[must_use]
    pub fn new(buffer: Arc<ContextBuffer>, config: AssemblyConfig) -> Self {
        Self {
            buffer,
            config,
            stats: Arc::new(PipelineStats::new()),
        }
    }

    /// Reports counters into shared stats.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<PipelineStats>) -> Self {
        self.stats = stats;
        self
    }

    /// Assembly settings.
    #[must_use]
    pub const fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    /// Leases the window around a detected error.
    ///
    /// Called on the producer path right after detection, before any further
    /// append, so the window is protected from the moment the error is seen.
    #[must_use]
    pub fn lease(&self, detected: &DetectedError) -> LeaseGuard {
        let (from, to) = self.window(detected.triggering_record.sequence_no);
        self.buffer.lease(from, to)
    }

    fn window(&self, trigger_seq: u64) -> (u64, u64) {
        (
            trigger_seq.saturating_sub(self.config.before_span as u64),
            trigger_seq.saturating_add(self.config.after_span as u64),
        )
    }

    /// Assembles the bundle for one detected error under its lease.
    ///
    /// Returns once `after_span` records follow the trigger, the grace period
    /// measured from detection elapses, the lease is forced, or `shutdown` is
    /// cancelled. Only the first case seals `Full`.
    pub async fn assemble(
        &self,
        detected: DetectedError,
        lease: LeaseGuard,
        shutdown: CancellationToken,
    ) -> ContextBundle {
        let trigger = Arc::clone(&detected.triggering_record);
        let trigger_seq = trigger.sequence_no;
        let (from, to) = self.window(trigger_seq);

        let before = if trigger_seq > from {
            self.buffer.snapshot(from, trigger_seq - 1)
        } else {
            Snapshot::default()
        };

        let deadline = Instant::from_std(detected.detected_at) + self.config.grace_period();
        let mut latest = self.buffer.subscribe();

        let end = loop {
            if let Some(capture) = lease.captured() {
                break if capture.captured_at <= deadline {
                    WaitEnd::Complete
                } else {
                    WaitEnd::GraceExpired
                };
            }
            if lease.is_forced() {
                break WaitEnd::Forced;
            }

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break WaitEnd::Shutdown,
                changed = tokio::time::timeout_at(deadline, latest.changed()) => match changed {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => break WaitEnd::BufferClosed,
                    Err(_) => break WaitEnd::GraceExpired,
                },
            }
        };

        let (before, after) = match lease.captured() {
            Some(capture) => split_at_trigger(capture.snapshot, trigger_seq),
            None => (before, self.buffer.snapshot(trigger_seq.saturating_add(1), to)),
        };
        let forced = lease.is_forced();
        drop(lease);

        let before_gap = before.gap && trigger_seq > from;
        let before_records = self.within_window(before.records, &trigger);
        let mut after_records = after.records;
        after_records.truncate(self.config.after_span);

        let completeness = if end == WaitEnd::Complete
            && !forced
            && !after.gap
            && after_records.len() == self.config.after_span
        {
            Completeness::Full
        } else {
            Completeness::PartialTimeout
        };

        self.stats.record_sealed(completeness);
        if forced {
            self.stats.record_forced_releases(1);
        }
        debug!(
            error_id = %detected.error_id,
            reason = ?end,
            before = before_records.len(),
            after = after_records.len(),
            completeness = ?completeness,
            "bundle sealed"
        );

        ContextBundle {
            error_id: detected.error_id,
            rule: detected.matched_rule,
            category_hint: detected.category_hint,
            severity_hint: detected.severity_hint,
            before: before_records,
            trigger,
            after: after_records,
            completeness,
            gap: before_gap || after.gap,
            sealed_at: Utc::now(),
        }
    }

    fn within_window(
        &self,
        records: Vec<Arc<LogRecord>>,
        trigger: &LogRecord,
    ) -> Vec<Arc<LogRecord>> {
        let Some(window) = self.config.before_window() else {
            return records;
        };
        let Ok(window) = chrono::Duration::from_std(window) else {
            return records;
        };
        let cutoff = event_time(trigger) - window;
        records
            .into_iter()
            .filter(|record| event_time(record) >= cutoff)
            .collect()
    }
}

/// Splits a captured window into the records before and after the trigger.
/// The gap flag stays with the before half; after records are never evicted
/// while leased.
fn split_at_trigger(window: Snapshot, trigger_seq: u64) -> (Snapshot, Snapshot) {
    let (before, rest): (Vec<_>, Vec<_>) = window
        .records
        .into_iter()
        .partition(|record| record.sequence_no < trigger_seq);
    let after = rest
        .into_iter()
        .filter(|record| record.sequence_no > trigger_seq)
        .collect();
    (
        Snapshot {
            records: before,
            gap: window.gap,
        },
        Snapshot {
            records: after,
            gap: false,
        },
    )
}

/// The parsed timestamp when present, otherwise the ingestion time.
fn event_time(record: &LogRecord) -> DateTime<Utc> {
    record.timestamp.unwrap_or(record.ingested_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::types::{Category, ErrorId, LogLevel, Severity};
    use std::time::Duration;

    fn record(seq: u64, level: LogLevel) -> Arc<LogRecord> {
        Arc::new(LogRecord::new(seq, level, format!("line {seq}")))
    }

    fn detected(trigger: Arc<LogRecord>) -> DetectedError {
        DetectedError {
            error_id: ErrorId(1),
            triggering_record: trigger,
            matched_rule: "error_level".to_string(),
            category_hint: Category::Application,
            severity_hint: Severity::High,
            detected_at: std::time::Instant::now(),
        }
    }

    fn setup(before_span: usize, after_span: usize, grace_ms: u64) -> (Arc<ContextBuffer>, ContextAssembler) {
        let buffer = Arc::new(ContextBuffer::new(BufferConfig::for_spans(before_span, after_span, 2)));
        let assembler = ContextAssembler::new(
            Arc::clone(&buffer),
            AssemblyConfig {
                before_span,
                after_span,
                grace_period_ms: grace_ms,
                before_window_ms: None,
            },
        );
        (buffer, assembler)
    }

    async fn seal(
        assembler: &ContextAssembler,
        detected: DetectedError,
        shutdown: CancellationToken,
    ) -> ContextBundle {
        let lease = assembler.lease(&detected);
        assembler.assemble(detected, lease, shutdown).await
    }

    fn seqs(records: &[Arc<LogRecord>]) -> Vec<u64> {
        records.iter().map(|r| r.sequence_no).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn seals_full_once_after_span_arrives() {
        let (buffer, assembler) = setup(2, 2, 5_000);
        for seq in 1..=3 {
            buffer.append(record(seq, LogLevel::Info)).expect("append");
        }
        let trigger = record(4, LogLevel::Error);
        buffer.append(Arc::clone(&trigger)).expect("append");

        let detected = detected(trigger);
        let lease = assembler.lease(&detected);
        let task = tokio::spawn({
            let assembler = assembler.clone();
            async move { assembler.assemble(detected, lease, CancellationToken::new()).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        for seq in 5..=7 {
            buffer.append(record(seq, LogLevel::Info)).expect("append");
        }

        let bundle = task.await.expect("assembler task");
        assert_eq!(seqs(&bundle.before), vec![2, 3]);
        assert_eq!(bundle.trigger.sequence_no, 4);
        assert_eq!(seqs(&bundle.after), vec![5, 6]);
        assert_eq!(bundle.completeness, Completeness::Full);
        assert!(!bundle.gap);
        assert_eq!(buffer.active_leases(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn seals_partial_when_grace_expires() {
        let (buffer, assembler) = setup(2, 3, 1_000);
        let trigger = record(1, LogLevel::Error);
        buffer.append(Arc::clone(&trigger)).expect("append");
        buffer.append(record(2, LogLevel::Info)).expect("append");

        let bundle = seal(&assembler, detected(trigger), CancellationToken::new()).await;
        assert!(bundle.before.is_empty());
        assert_eq!(seqs(&bundle.after), vec![2]);
        assert_eq!(bundle.completeness, Completeness::PartialTimeout);
        assert!(!bundle.gap);
    }

    #[tokio::test(start_paused = true)]
    async fn seals_immediately_on_shutdown() {
        let (buffer, assembler) = setup(1, 5, 60_000);
        let trigger = record(1, LogLevel::Error);
        buffer.append(Arc::clone(&trigger)).expect("append");

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let bundle = seal(&assembler, detected(trigger), shutdown).await;
        assert_eq!(bundle.completeness, Completeness::PartialTimeout);
        assert!(bundle.after.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_after_span_is_full_immediately() {
        let (buffer, assembler) = setup(3, 0, 1_000);
        for seq in 1..=2 {
            buffer.append(record(seq, LogLevel::Info)).expect("append");
        }
        let trigger = record(3, LogLevel::Error);
        buffer.append(Arc::clone(&trigger)).expect("append");

        let bundle = seal(&assembler, detected(trigger), CancellationToken::new()).await;
        assert_eq!(seqs(&bundle.before), vec![1, 2]);
        assert!(bundle.after.is_empty());
        assert!(bundle.is_full());
    }

    #[tokio::test(start_paused = true)]
    async fn reports_gap_when_before_context_was_evicted() {
        let buffer = Arc::new(ContextBuffer::new(BufferConfig {
            capacity: 2,
            ceiling: 20,
        }));
        let assembler = ContextAssembler::new(
            Arc::clone(&buffer),
            AssemblyConfig {
                before_span: 4,
                after_span: 0,
                grace_period_ms: 1_000,
                before_window_ms: None,
            },
        );
        for seq in 1..=5 {
            buffer.append(record(seq, LogLevel::Info)).expect("append");
        }
        let trigger = record(6, LogLevel::Error);
        buffer.append(Arc::clone(&trigger)).expect("append");

        let bundle = seal(&assembler, detected(trigger), CancellationToken::new()).await;
        assert_eq!(seqs(&bundle.before), vec![5]);
        assert!(bundle.gap);
    }

    #[tokio::test(start_paused = true)]
    async fn before_window_drops_stale_records() {
        let (buffer, _) = setup(5, 0, 1_000);
        let assembler = ContextAssembler::new(
            Arc::clone(&buffer),
            AssemblyConfig {
                before_span: 5,
                after_span: 0,
                grace_period_ms: 1_000,
                before_window_ms: Some(60_000),
            },
        );
        let now = Utc::now();
        let stale = LogRecord::new(1, LogLevel::Info, "stale")
            .with_ingested_at(now - chrono::Duration::minutes(5));
        let fresh = LogRecord::new(2, LogLevel::Info, "fresh")
            .with_ingested_at(now - chrono::Duration::seconds(10));
        let trigger = Arc::new(LogRecord::new(3, LogLevel::Error, "boom").with_ingested_at(now));
        buffer.append(Arc::new(stale)).expect("append");
        buffer.append(Arc::new(fresh)).expect("append");
        buffer.append(Arc::clone(&trigger)).expect("append");

        let bundle = seal(&assembler, detected(trigger), CancellationToken::new()).await;
        assert_eq!(seqs(&bundle.before), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_after_lease_keeps_full_window() {
        let buffer = Arc::new(ContextBuffer::new(BufferConfig {
            capacity: 4,
            ceiling: 8,
        }));
        let assembler = ContextAssembler::new(
            Arc::clone(&buffer),
            AssemblyConfig {
                before_span: 2,
                after_span: 2,
                grace_period_ms: 1_000,
                before_window_ms: None,
            },
        );
        for seq in 1..=2 {
            buffer.append(record(seq, LogLevel::Info)).expect("append");
        }
        let trigger = record(3, LogLevel::Error);
        buffer.append(Arc::clone(&trigger)).expect("append");

        let detected = detected(trigger);
        let lease = assembler.lease(&detected);
        for seq in 4..=60 {
            buffer.append(record(seq, LogLevel::Info)).expect("append");
        }

        let bundle = assembler.assemble(detected, lease, CancellationToken::new()).await;
        assert_eq!(seqs(&bundle.before), vec![1, 2]);
        assert_eq!(seqs(&bundle.after), vec![4, 5]);
        assert_eq!(bundle.completeness, Completeness::Full);
        assert!(!bundle.gap);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_lease_seals_partial() {
        let stats = Arc::new(PipelineStats::new());
        let buffer = Arc::new(ContextBuffer::new(BufferConfig {
            capacity: 2,
            ceiling: 4,
        }));
        let assembler = ContextAssembler::new(
            Arc::clone(&buffer),
            AssemblyConfig {
                before_span: 1,
                after_span: 10,
                grace_period_ms: 60_000,
                before_window_ms: None,
            },
        )
        .with_stats(Arc::clone(&stats));

        buffer.append(record(1, LogLevel::Info)).expect("append");
        let trigger = record(2, LogLevel::Error);
        buffer.append(Arc::clone(&trigger)).expect("append");

        let detected = detected(trigger);
        let lease = assembler.lease(&detected);
        let task = tokio::spawn({
            let assembler = assembler.clone();
            async move { assembler.assemble(detected, lease, CancellationToken::new()).await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut forced = 0;
        for seq in 3..=5 {
            forced += buffer.append(record(seq, LogLevel::Info)).expect("append").forced_leases;
        }
        assert_eq!(forced, 1);

        let bundle = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("sealed before grace")
            .expect("assembler task");
        assert_eq!(bundle.completeness, Completeness::PartialTimeout);
        assert!(bundle.after.len() < 10);
        assert_eq!(buffer.active_leases(), 0);

        let snap = stats.snapshot(0);
        assert_eq!(snap.forced_lease_releases, 1);
        assert_eq!(snap.bundles_partial, 1);
    }
}
