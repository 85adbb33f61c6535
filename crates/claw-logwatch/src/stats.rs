//! Observability counters for the pipeline.
//!
//! Counters are updated from the producer, the assemblers and the dispatcher
//! and polled externally through [`PipelineStats::snapshot`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{Completeness, LogLevel};

/// Shared pipeline counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    lines_ingested: AtomicU64,
    incomplete_lines: AtomicU64,
    bundles_full: AtomicU64,
    bundles_partial: AtomicU64,
    bundles_dropped: AtomicU64,
    source_open_failures: AtomicU64,
    source_reopens: AtomicU64,
    forced_lease_releases: AtomicU64,
    analyses_succeeded: AtomicU64,
    analyses_failed: AtomicU64,
    records_by_level: Mutex<BTreeMap<LogLevel, u64>>,
    errors_by_rule: Mutex<BTreeMap<String, u64>>,
}

/// Point-in-time copy of the pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Lines delivered by the line source
    pub lines_ingested: u64,
    /// Lines flushed without a terminator
    pub incomplete_lines: u64,
    /// Parsed records by level
    pub records_by_level: BTreeMap<LogLevel, u64>,
    /// Detected errors by rule name
    pub errors_by_rule: BTreeMap<String, u64>,
    /// Bundles sealed with full after-context
    pub bundles_full: u64,
    /// Bundles sealed as partial
    pub bundles_partial: u64,
    /// Bundles dropped because the dispatch queue was full
    pub bundles_dropped: u64,
    /// Bundles currently waiting for analysis
    pub queue_depth: usize,
    /// Failed attempts to open the monitored file
    pub source_open_failures: u64,
    /// Reopens caused by truncation or rotation
    pub source_reopens: u64,
    /// Leases force-released at the buffer ceiling
    pub forced_lease_releases: u64,
    /// Analyzer calls that returned a result
    pub analyses_succeeded: u64,
    /// Analyzer calls that failed or timed out
    pub analyses_failed: u64,
}

impl StatsSnapshot {
    /// Total detected errors across all rules.
    #[must_use]
    pub fn errors_detected(&self) -> u64 {
        self.errors_by_rule.values().sum()
    }

    /// Total parsed records across all levels.
    #[must_use]
    pub fn records_parsed(&self) -> u64 {
        self.records_by_level.values().sum()
    }
}

impl PipelineStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a line delivered by the source.
    pub fn record_line(&self, incomplete: bool) {
        self.lines_ingested.fetch_add(1, Ordering::Relaxed);
        if incomplete {
            self.incomplete_lines.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a parsed record.
    pub fn record_parsed(&self, level: LogLevel) {
        *self.records_by_level.lock().entry(level).or_insert(0) += 1;
    }

    /// Records a detection by the named rule.
    pub fn record_detection(&self, rule: &str) {
        let mut by_rule = self.errors_by_rule.lock();
        match by_rule.get_mut(rule) {
            Some(count) => *count += 1,
            None => {
                by_rule.insert(rule.to_string(), 1);
            }
        }
    }

    /// Records a sealed bundle.
    pub fn record_sealed(&self, completeness: Completeness) {
        let counter = match completeness {
            Completeness::Full => &self.bundles_full,
            Completeness::PartialTimeout => &self.bundles_partial,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a bundle dropped from a full queue.
    pub fn record_dropped(&self) {
        self.bundles_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed attempt to open the monitored file.
    pub fn record_open_failure(&self) {
        self.source_open_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reopen after truncation or rotation.
    pub fn record_reopen(&self) {
        self.source_reopens.fetch_add(1, Ordering::Relaxed);
    }

    /// Records forced lease releases.
    pub fn record_forced_releases(&self, count: usize) {
        self.forced_lease_releases
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Records the outcome of an analyzer call.
    pub fn record_analysis(&self, succeeded: bool) {
        let counter = if succeeded {
            &self.analyses_succeeded
        } else {
            &self.analyses_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot; the queue depth is supplied by the caller.
    #[must_use]
    pub fn snapshot(&self, queue_depth: usize) -> StatsSnapshot {
        StatsSnapshot {
            lines_ingested: self.lines_ingested.load(Ordering::Relaxed),
            incomplete_lines: self.incomplete_lines.load(Ordering::Relaxed),
            records_by_level: self.records_by_level.lock().clone(),
            errors_by_rule: self.errors_by_rule.lock().clone(),
            bundles_full: self.bundles_full.load(Ordering::Relaxed),
            bundles_partial: self.bundles_partial.load(Ordering::Relaxed),
            bundles_dropped: self.bundles_dropped.load(Ordering::Relaxed),
            queue_depth,
            source_open_failures: self.source_open_failures.load(Ordering::Relaxed),
            source_reopens: self.source_reopens.load(Ordering::Relaxed),
            forced_lease_releases: self.forced_lease_releases.load(Ordering::Relaxed),
            analyses_succeeded: self.analyses_succeeded.load(Ordering::Relaxed),
            analyses_failed: self.analyses_failed.load(Ordering::Relaxed),
        }
    }
}
