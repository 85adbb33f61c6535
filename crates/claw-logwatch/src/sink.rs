//! Result sinks.
//!
//! A sink receives every analyzed bundle paired with the analyzer's result or
//! failure. Sinks are infallible from the pipeline's point of view: write
//! errors are logged and the outcome is dropped.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::analyzer::{AnalysisFailure, AnalysisResult};
use crate::types::ContextBundle;

/// History size kept by [`MemorySink::default`].
pub const DEFAULT_HISTORY: usize = 100;

/// A bundle together with what the analyzer made of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    /// The analyzed bundle
    pub bundle: ContextBundle,
    /// Analyzer result or failure
    pub result: Result<AnalysisResult, AnalysisFailure>,
    /// When the analyzer returned
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisOutcome {
    /// Pairs a bundle with an analyzer answer.
    #[must_use]
    pub fn new(bundle: ContextBundle, result: Result<AnalysisResult, AnalysisFailure>) -> Self {
        Self {
            bundle,
            result,
            analyzed_at: Utc::now(),
        }
    }

    /// Returns true if the analyzer produced a result.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Receives analysis outcomes.
pub trait ResultSink: Send + Sync + 'static {
    /// Accepts one outcome.
    fn emit(&self, outcome: AnalysisOutcome);
}

impl<T: ResultSink> ResultSink for Arc<T> {
    fn emit(&self, outcome: AnalysisOutcome) {
        (**self).emit(outcome);
    }
}

/// Writes each outcome as one JSON line.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send + 'static> {
    writer: Mutex<W>,
}

impl<W: Write + Send + 'static> JsonLinesSink<W> {
    /// Wraps a writer.
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Returns the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }

    fn write_line(&self, outcome: &AnalysisOutcome) -> std::io::Result<()> {
        let line = serde_json::to_string(outcome)?;
        let mut writer = self.writer.lock();
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

impl JsonLinesSink<std::io::Stdout> {
    /// Sink writing to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send + 'static> ResultSink for JsonLinesSink<W> {
    fn emit(&self, outcome: AnalysisOutcome) {
        if let Err(e) = self.write_line(&outcome) {
            warn!(error_id = %outcome.bundle.error_id, error = %e, "failed to write outcome");
        }
    }
}

/// Keeps the most recent outcomes in memory.
#[derive(Debug)]
pub struct MemorySink {
    limit: usize,
    outcomes: Mutex<VecDeque<AnalysisOutcome>>,
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl MemorySink {
    /// Keeps at most `limit` outcomes, discarding the oldest.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    /// Copies the retained outcomes, oldest first.
    #[must_use]
    pub fn outcomes(&self) -> Vec<AnalysisOutcome> {
        self.outcomes.lock().iter().cloned().collect()
    }

    /// The most recent outcome.
    #[must_use]
    pub fn latest(&self) -> Option<AnalysisOutcome> {
        self.outcomes.lock().back().cloned()
    }

    /// Number of retained outcomes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    /// Returns true if nothing has been retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.lock().is_empty()
    }
}

impl ResultSink for MemorySink {
    fn emit(&self, outcome: AnalysisOutcome) {
        let mut outcomes = self.outcomes.lock();
        if outcomes.len() >= self.limit {
            outcomes.pop_front();
        }
        outcomes.push_back(outcome);
    }
}
