//! Pipeline configuration.
//!
//! Configuration for the log watch pipeline, including:
//! - Line source polling, partial-line and backoff settings
//! - Context buffer capacity and hard ceiling
//! - Context assembly spans and grace period
//! - Dispatch queue and analyzer limits
//! - The ordered pattern rule set
//!
//! Durations are stored as milliseconds so the JSON file stays flat.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LogwatchError, Result};
use crate::rules::{default_rule_specs, RuleSpec};

/// Where the line source starts reading the first time it opens the file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Read existing content first
    #[default]
    Beginning,
    /// Only read content appended after startup
    End,
}

/// Line source settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Where to start on first open.
    pub start_position: StartPosition,
    /// Wait between reads when the file has no new bytes.
    pub idle_poll_ms: u64,
    /// How long an unterminated line is held before it is flushed.
    pub partial_line_timeout_ms: u64,
    /// Unterminated content longer than this is flushed early.
    pub max_line_bytes: usize,
    /// First retry delay while the file is missing.
    pub initial_backoff_ms: u64,
    /// Retry delay cap while the file is missing.
    pub max_backoff_ms: u64,
    /// Size of a single read.
    pub read_chunk_bytes: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            start_position: StartPosition::Beginning,
            idle_poll_ms: 200,
            partial_line_timeout_ms: 2_000,
            max_line_bytes: 64 * 1024,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            read_chunk_bytes: 16 * 1024,
        }
    }
}

impl SourceConfig {
    /// Idle poll interval.
    #[must_use]
    pub const fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Partial line timeout.
    #[must_use]
    pub const fn partial_line_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_line_timeout_ms)
    }

    /// Initial backoff.
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Backoff cap.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Context buffer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Nominal number of resident records.
    pub capacity: usize,
    /// Hard limit reached only while leases hold records past capacity.
    pub ceiling: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            ceiling: 500,
        }
    }
}

impl BufferConfig {
    /// Sizes the buffer for the given spans plus slack; the ceiling is ten
    /// times the capacity.
    #[must_use]
    pub const fn for_spans(before_span: usize, after_span: usize, slack: usize) -> Self {
        let capacity = before_span + after_span + 1 + slack;
        Self {
            capacity,
            ceiling: capacity * 10,
        }
    }
}

/// Context assembly settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// Maximum records before the trigger.
    pub before_span: usize,
    /// Maximum records after the trigger.
    pub after_span: usize,
    /// How long to wait for after-context.
    pub grace_period_ms: u64,
    /// Optional age limit for before-context, relative to the trigger.
    pub before_window_ms: Option<u64>,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            before_span: 20,
            after_span: 5,
            grace_period_ms: 5_000,
            before_window_ms: None,
        }
    }
}

impl AssemblyConfig {
    /// Grace period.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Age limit for before-context.
    #[must_use]
    pub fn before_window(&self) -> Option<Duration> {
        self.before_window_ms.map(Duration::from_millis)
    }
}

/// Dispatch settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bundles held before the oldest is dropped.
    pub queue_capacity: usize,
    /// Upper bound on a single analyzer call.
    pub analysis_timeout_ms: u64,
    /// Analyzer calls allowed in flight.
    pub max_concurrent_analyses: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            analysis_timeout_ms: 30_000,
            max_concurrent_analyses: 5,
        }
    }
}

impl DispatchConfig {
    /// Analyzer timeout.
    #[must_use]
    pub const fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }
}

fn default_log_file() -> PathBuf {
    PathBuf::from("./logs/robot.log")
}

const fn default_stats_interval() -> u64 {
    30
}

/// Main configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogwatchConfig {
    /// File to monitor.
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    /// Line source settings.
    #[serde(default)]
    pub source: SourceConfig,
    /// Context buffer settings.
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Context assembly settings.
    #[serde(default)]
    pub assembly: AssemblyConfig,
    /// Dispatch settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Ordered pattern rules; first match wins.
    #[serde(default = "default_rule_specs")]
    pub rules: Vec<RuleSpec>,
    /// How often the CLI logs a stats snapshot.
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for LogwatchConfig {
    fn default() -> Self {
        Self {
            log_file: default_log_file(),
            source: SourceConfig::default(),
            buffer: BufferConfig::default(),
            assembly: AssemblyConfig::default(),
            dispatch: DispatchConfig::default(),
            rules: default_rule_specs(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl LogwatchConfig {
    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            LogwatchError::Config(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| LogwatchError::Config(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.log_file.as_os_str().is_empty() {
            return Err(LogwatchError::Config("log_file cannot be empty".to_string()));
        }

        if self.source.idle_poll_ms == 0 {
            return Err(LogwatchError::Config(
                "source.idle_poll_ms must be greater than 0".to_string(),
            ));
        }

        if self.source.initial_backoff_ms == 0 {
            return Err(LogwatchError::Config(
                "source.initial_backoff_ms must be greater than 0".to_string(),
            ));
        }

        if self.source.max_backoff_ms < self.source.initial_backoff_ms {
            return Err(LogwatchError::Config(
                "source.max_backoff_ms must be at least source.initial_backoff_ms".to_string(),
            ));
        }

        if self.source.read_chunk_bytes == 0 || self.source.max_line_bytes == 0 {
            return Err(LogwatchError::Config(
                "source read sizes must be greater than 0".to_string(),
            ));
        }

        if self.buffer.capacity == 0 {
            return Err(LogwatchError::Config(
                "buffer.capacity must be greater than 0".to_string(),
            ));
        }

        if self.buffer.ceiling < self.buffer.capacity {
            return Err(LogwatchError::Config(
                "buffer.ceiling must be at least buffer.capacity".to_string(),
            ));
        }

        if self.assembly.grace_period_ms == 0 {
            return Err(LogwatchError::Config(
                "assembly.grace_period_ms must be greater than 0".to_string(),
            ));
        }

        if self.dispatch.queue_capacity == 0 {
            return Err(LogwatchError::Config(
                "dispatch.queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.dispatch.max_concurrent_analyses == 0 {
            return Err(LogwatchError::Config(
                "dispatch.max_concurrent_analyses must be greater than 0".to_string(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for rule in &self.rules {
            if !names.insert(rule.name.as_str()) {
                return Err(LogwatchError::Config(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("failed to write temp file");
        file
    }

    #[test]
    fn test_parse_minimal_config() {
        let config = LogwatchConfig::from_json(r#"{"log_file": "/var/log/robot.log"}"#)
            .expect("should parse minimal config");

        assert_eq!(config.log_file, PathBuf::from("/var/log/robot.log"));
        assert_eq!(config.buffer.capacity, 50);
        assert_eq!(config.assembly.before_span, 20);
        assert_eq!(config.source.max_backoff(), Duration::from_secs(5));
        assert!(!config.rules.is_empty());
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = LogwatchConfig::from_json(
            r#"{"log_file": "a.log", "assembly": {"after_span": 2}, "source": {"start_position": "end"}}"#,
        )
        .expect("should parse partial config");

        assert_eq!(config.assembly.after_span, 2);
        assert_eq!(config.assembly.grace_period(), Duration::from_secs(5));
        assert_eq!(config.source.start_position, StartPosition::End);
        assert_eq!(config.source.idle_poll(), Duration::from_millis(200));
    }

    #[test]
    fn test_rejects_ceiling_below_capacity() {
        let result = LogwatchConfig::from_json(
            r#"{"log_file": "a.log", "buffer": {"capacity": 10, "ceiling": 5}}"#,
        );
        assert!(matches!(result, Err(LogwatchError::Config(msg)) if msg.contains("ceiling")));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = LogwatchConfig::default();
        config.source.initial_backoff_ms = 500;
        config.source.max_backoff_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_rule_names() {
        let mut config = LogwatchConfig::default();
        let first = config.rules[0].clone();
        config.rules.push(first);
        assert!(matches!(config.validate(), Err(LogwatchError::Config(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_rejects_invalid_json() {
        let result = LogwatchConfig::from_json("{ not json");
        assert!(matches!(result, Err(LogwatchError::Config(msg)) if msg.contains("invalid JSON")));
    }

    #[test]
    fn test_load_from_file_and_save_roundtrip() {
        let file = create_temp_config(r#"{"log_file": "/tmp/x.log", "dispatch": {"queue_capacity": 7}}"#);
        let config = LogwatchConfig::from_file(file.path()).expect("should load config");
        assert_eq!(config.dispatch.queue_capacity, 7);

        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("nested").join("config.json");
        config.save(&out).expect("should save config");
        let reloaded = LogwatchConfig::from_file(&out).expect("should reload config");
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = LogwatchConfig::from_file("/nonexistent/logwatch.json");
        assert!(matches!(result, Err(LogwatchError::Config(_))));
    }

    #[test]
    fn test_buffer_for_spans() {
        let buffer = BufferConfig::for_spans(2, 2, 0);
        assert_eq!(buffer.capacity, 5);
        assert_eq!(buffer.ceiling, 50);
    }
}
