//! # claw-logwatch
//!
//! Streaming log ingestion, context windows and error detection.
//!
//! This crate provides:
//!
//! - [`LineSource`] - `tail -F` style reader that survives truncation and rotation
//! - [`LogParser`] - ROS, JSON and plain line parsing into [`LogRecord`]s
//! - [`ContextBuffer`] - Bounded, sequence-ordered buffer with leases
//! - [`ErrorDetector`] - Ordered pattern rules, first match wins
//! - [`ContextAssembler`] - Before/trigger/after bundles with a grace period
//! - [`DispatchQueue`] - Drop-oldest hand-off to the analyzer
//! - [`Analyzer`] and [`ResultSink`] - Pluggable analysis and output
//! - [`LogMonitor`] - Start/stop control over the whole pipeline
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use claw_logwatch::{
//!     BufferConfig, ContextBuffer, ErrorDetector, IngestPipeline, LogParser, PipelineStats,
//!     RawLine, RuleSet,
//! };
//!
//! let buffer = Arc::new(ContextBuffer::new(BufferConfig::default()));
//! let rules = RuleSet::defaults().expect("built-in rules compile");
//! let mut pipeline = IngestPipeline::new(
//!     LogParser::new(),
//!     Arc::clone(&buffer),
//!     ErrorDetector::new(rules),
//!     Arc::new(PipelineStats::new()),
//! );
//!
//! let (_, detected) = pipeline
//!     .ingest(&RawLine::complete("[ERROR] [/move_base]: Failed to get robot pose: Transform timeout"))
//!     .expect("in-order ingest");
//! assert_eq!(detected.map(|d| d.matched_rule), Some("transform_timeout".to_string()));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod analyzer;
pub mod assembler;
pub mod buffer;
pub mod config;
pub mod detector;
pub mod dispatch;
pub mod error;
pub mod monitor;
pub mod parser;
pub mod rules;
pub mod sink;
pub mod source;
pub mod stats;
pub mod types;

// Re-export main types
pub use analyzer::{AnalysisFailure, AnalysisResult, Analyzer, HeuristicAnalyzer};
pub use assembler::ContextAssembler;
pub use buffer::{AppendOutcome, Capture, ContextBuffer, LeaseGuard, Snapshot};
pub use config::{
    AssemblyConfig, BufferConfig, DispatchConfig, LogwatchConfig, SourceConfig, StartPosition,
};
pub use detector::ErrorDetector;
pub use dispatch::DispatchQueue;
pub use error::{LogwatchError, Result};
pub use monitor::{IngestPipeline, LogMonitor};
pub use parser::{LineFormat, LogParser, ParsedLine};
pub use rules::{default_rule_specs, MatcherSpec, PatternRule, RuleSet, RuleSpec};
pub use sink::{AnalysisOutcome, JsonLinesSink, MemorySink, ResultSink};
pub use source::{Backoff, LineSource};
pub use stats::{PipelineStats, StatsSnapshot};
pub use types::{
    Category, Completeness, ContextBundle, DetectedError, ErrorId, LogLevel, LogRecord, RawLine,
    Severity,
};
