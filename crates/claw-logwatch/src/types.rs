//! Core types for the log watch pipeline.
//!
//! This module provides:
//! - [`LogLevel`] - Severity levels recognized by the parser
//! - [`RawLine`] - A line as produced by the line source
//! - [`LogRecord`] - Structured, immutable log record keyed by sequence number
//! - [`DetectedError`] - A record that matched a pattern rule
//! - [`ContextBundle`] - The sealed before/trigger/after set handed to analysis
//! - [`Severity`] and [`Category`] - Taxonomy hints carried by rules

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a detected error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ErrorId(pub u64);

impl fmt::Display for ErrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "err-{:06}", self.0)
    }
}

/// Log severity levels.
///
/// `Unknown` sorts lowest so that level thresholds never match lines whose
/// level could not be determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Level could not be determined
    Unknown = 0,
    /// Debugging information
    Debug = 1,
    /// General information
    Info = 2,
    /// Warning conditions
    Warn = 3,
    /// Error conditions
    Error = 4,
    /// Unrecoverable conditions
    Fatal = 5,
}

impl LogLevel {
    /// All levels, in ascending order.
    pub const ALL: [Self; 6] = [
        Self::Unknown,
        Self::Debug,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Fatal,
    ];

    /// Parses a level keyword such as `WARN`, `err` or `CRITICAL`.
    #[must_use]
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.trim().to_ascii_uppercase().as_str() {
            "TRACE" | "TRC" | "DEBUG" | "DBG" => Some(Self::Debug),
            "INFO" | "INF" => Some(Self::Info),
            "WARN" | "WARNING" | "WRN" => Some(Self::Warn),
            "ERROR" | "ERR" => Some(Self::Error),
            "FATAL" | "CRITICAL" | "CRIT" => Some(Self::Fatal),
            _ => None,
        }
    }

    /// Returns true if this level is at least as severe as the given level.
    #[must_use]
    pub fn is_at_least(&self, level: Self) -> bool {
        *self >= level
    }

    /// Returns the string representation of this level.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw line produced by the line source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    /// Line content without its terminator
    pub text: String,
    /// True if the line was emitted before a terminator was seen
    pub incomplete: bool,
}

impl RawLine {
    /// Creates a terminated line.
    #[must_use]
    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            incomplete: false,
        }
    }

    /// Creates a best-effort line flushed without a terminator.
    #[must_use]
    pub fn incomplete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            incomplete: true,
        }
    }
}

/// A structured log record.
///
/// Records are immutable once created and shared as `Arc<LogRecord>` between
/// the buffer, the detector and any number of context bundles. The sequence
/// number is the only ordering key; `timestamp` comes from the log text and is
/// not trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Monotonic sequence number assigned at ingestion
    pub sequence_no: u64,
    /// Timestamp parsed from the line, if any
    pub timestamp: Option<DateTime<Utc>>,
    /// Wall-clock time the record was ingested
    pub ingested_at: DateTime<Utc>,
    /// Parsed level
    pub level: LogLevel,
    /// The original line
    pub raw_text: String,
    /// The message portion of the line
    pub message: String,
    /// Emitting node or component, when the format carries one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// `key=value` pairs and structured fields
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// True if the source line had no terminator
    #[serde(default)]
    pub incomplete: bool,
}

impl LogRecord {
    /// Creates a record with the raw text equal to the message.
    #[must_use]
    pub fn new(sequence_no: u64, level: LogLevel, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            sequence_no,
            timestamp: None,
            ingested_at: Utc::now(),
            level,
            raw_text: message.clone(),
            message,
            node: None,
            metadata: HashMap::new(),
            incomplete: false,
        }
    }

    /// Adds a metadata pair.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the emitting node.
    #[must_use]
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Sets the ingestion time.
    #[must_use]
    pub const fn with_ingested_at(mut self, ingested_at: DateTime<Utc>) -> Self {
        self.ingested_at = ingested_at;
        self
    }

    /// Returns true for `ERROR` and `FATAL` records.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.level.is_at_least(LogLevel::Error)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node {
            Some(node) => write!(f, "#{} [{}] [{}] {}", self.sequence_no, self.level, node, self.message),
            None => write!(f, "#{} [{}] {}", self.sequence_no, self.level, self.message),
        }
    }
}

/// Severity hint attached by a rule or produced by an analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Minor issue
    Low,
    /// Needs attention
    Medium,
    /// Functional failure
    High,
    /// Safety or availability impact
    Critical,
}

impl Severity {
    /// Returns the string representation of this severity.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Taxonomy category hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// Hosts, networks, transforms, hardware links
    Infrastructure,
    /// Message queues and buffers
    Queue,
    /// Authentication and authorization
    Auth,
    /// Latency and resource saturation
    Performance,
    /// Sensors and third-party dependencies
    External,
    /// Application logic
    Application,
}

impl Category {
    /// Returns the string representation of this category.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Infrastructure => "INFRASTRUCTURE",
            Self::Queue => "QUEUE",
            Self::Auth => "AUTH",
            Self::Performance => "PERFORMANCE",
            Self::External => "EXTERNAL",
            Self::Application => "APPLICATION",
        }
    }
}

/// A record that matched an error pattern rule.
#[derive(Debug, Clone)]
pub struct DetectedError {
    /// Unique, monotonic identifier
    pub error_id: ErrorId,
    /// The record that matched
    pub triggering_record: Arc<LogRecord>,
    /// Name of the first matching rule
    pub matched_rule: String,
    /// Category hint of the matching rule
    pub category_hint: Category,
    /// Severity hint of the matching rule
    pub severity_hint: Severity,
    /// Monotonic detection time
    pub detected_at: Instant,
}

/// Whether a bundle captured all requested after-context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Completeness {
    /// Every requested after-record was observed within the grace period
    Full,
    /// The grace period expired, the lease was forced, or monitoring stopped
    PartialTimeout,
}

/// The sealed context around a detected error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBundle {
    /// Identifier of the detected error
    pub error_id: ErrorId,
    /// Rule that triggered the bundle
    pub rule: String,
    /// Category hint of the rule
    pub category_hint: Category,
    /// Severity hint of the rule
    pub severity_hint: Severity,
    /// Records preceding the trigger, oldest first
    pub before: Vec<Arc<LogRecord>>,
    /// The triggering record
    pub trigger: Arc<LogRecord>,
    /// Records following the trigger, oldest first
    pub after: Vec<Arc<LogRecord>>,
    /// Whether the after-context is complete
    pub completeness: Completeness,
    /// True if some requested records had already been evicted
    pub gap: bool,
    /// When the bundle was sealed
    pub sealed_at: DateTime<Utc>,
}

impl ContextBundle {
    /// Iterates all records in sequence order.
    pub fn records(&self) -> impl Iterator<Item = &Arc<LogRecord>> {
        self.before
            .iter()
            .chain(std::iter::once(&self.trigger))
            .chain(self.after.iter())
    }

    /// Total number of records in the bundle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.before.len() + 1 + self.after.len()
    }

    /// Bundles always contain their trigger.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Returns true if the bundle sealed with full after-context.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.completeness == Completeness::Full
    }

    /// Distinct nodes mentioned in the bundle, in first-seen order.
    #[must_use]
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = Vec::new();
        for record in self.records() {
            if let Some(node) = &record.node {
                if !nodes.contains(node) {
                    nodes.push(node.clone());
                }
            }
        }
        nodes
    }
}
