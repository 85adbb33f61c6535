//! Conversion of raw lines into structured log records.
//!
//! This module provides:
//! - [`LogParser`] - Sequence-numbering parser used on the producer path
//! - [`ParsedLine`] - The stateless extraction result
//! - [`LineFormat`] - Which line shape was recognized
//!
//! Parsing never fails: a line that matches no known shape becomes an
//! `UNKNOWN` record whose message is the whole line.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::{LogLevel, LogRecord, RawLine};

/// `[LEVEL] [2024-01-15 10:30:45.123456] [/node]: message`, node optional.
static ROS_FULL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\[(\w+)\]\s+\[(\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}(?:\.\d+)?)\](?:\s+\[([^\]]+)\])?\s*:\s*(.+)$",
    )
    .unwrap_or_else(|_| unreachable!())
});

/// `[LEVEL] [node-or-timestamp]: message`.
static ROS_SHORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(\w+)\]\s*\[([^\]]+)\]\s*:\s*(.+)$").unwrap_or_else(|_| unreachable!())
});

/// Leading ISO-ish timestamp followed by the rest of the line.
static LEADING_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\s+(.+)$",
    )
    .unwrap_or_else(|_| unreachable!())
});

/// `key=value` or `key="quoted value"`.
static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:^|[\s,;(\[])([A-Za-z_][A-Za-z0-9_.\-]*)=("(?:[^"\\]|\\.)*"|[^\s,;)\]=][^\s,;)\]]*)"#)
        .unwrap_or_else(|_| unreachable!())
});

const JSON_LEVEL_KEYS: [&str; 3] = ["level", "lvl", "severity"];
const JSON_MESSAGE_KEYS: [&str; 3] = ["msg", "message", "text"];
const JSON_TIME_KEYS: [&str; 3] = ["timestamp", "time", "ts"];
const JSON_NODE_KEYS: [&str; 3] = ["node", "component", "logger"];

/// The line shape that was recognized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineFormat {
    /// `[LEVEL] [timestamp] [node]: message`
    Ros,
    /// `[LEVEL] [node]: message`
    RosShort,
    /// A JSON object
    Json,
    /// A level keyword prefix, optionally after a timestamp
    Plain,
    /// Nothing recognized
    Unstructured,
}

/// A parsed log line before it is assigned a sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    /// Parsed level, `Unknown` when none was found
    pub level: LogLevel,
    /// Message content
    pub message: String,
    /// Timestamp found in the line
    pub timestamp: Option<DateTime<Utc>>,
    /// Node or component found in the line
    pub node: Option<String>,
    /// Extracted fields
    pub metadata: HashMap<String, String>,
    /// Recognized shape
    pub format: LineFormat,
}

impl ParsedLine {
    fn unstructured(line: &str) -> Self {
        Self {
            level: LogLevel::Unknown,
            message: line.to_string(),
            timestamp: None,
            node: None,
            metadata: HashMap::new(),
            format: LineFormat::Unstructured,
        }
    }
}

/// Parser for log lines.
///
/// Holds the next sequence number; it must only be driven by the single
/// producer of a monitored file.
#[derive(Debug)]
pub struct LogParser {
    next_seq: u64,
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogParser {
    /// Creates a parser whose first record gets sequence number 1.
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a parser continuing from the given sequence number.
    #[must_use]
    pub const fn starting_at(next_seq: u64) -> Self {
        Self { next_seq }
    }

    /// The sequence number the next record will receive.
    #[must_use]
    pub const fn next_sequence(&self) -> u64 {
        self.next_seq
    }

    /// Parses a raw line into a record with the next sequence number.
    pub fn parse(&mut self, line: &RawLine) -> LogRecord {
        let parsed = self.parse_fields(&line.text);
        let sequence_no = self.next_seq;
        self.next_seq += 1;

        LogRecord {
            sequence_no,
            timestamp: parsed.timestamp,
            ingested_at: Utc::now(),
            level: parsed.level,
            raw_text: line.text.clone(),
            message: parsed.message,
            node: parsed.node,
            metadata: parsed.metadata,
            incomplete: line.incomplete,
        }
    }

    /// Extracts level, message, timestamp, node and metadata from a line.
    #[must_use]
    pub fn parse_fields(&self, line: &str) -> ParsedLine {
        let trimmed = line.trim();

        let mut parsed = Self::parse_ros(trimmed)
            .or_else(|| Self::parse_json(trimmed))
            .or_else(|| Self::parse_plain(trimmed))
            .unwrap_or_else(|| ParsedLine::unstructured(line));

        for (key, value) in extract_key_values(&parsed.message) {
            parsed.metadata.entry(key).or_insert(value);
        }
        parsed
    }

    fn parse_ros(line: &str) -> Option<ParsedLine> {
        if let Some(caps) = ROS_FULL.captures(line) {
            let level = LogLevel::from_keyword(&caps[1]).unwrap_or(LogLevel::Unknown);
            return Some(ParsedLine {
                level,
                message: caps[4].trim().to_string(),
                timestamp: parse_timestamp(&caps[2]),
                node: caps.get(3).map(|m| m.as_str().trim().to_string()),
                metadata: HashMap::new(),
                format: LineFormat::Ros,
            });
        }

        let caps = ROS_SHORT.captures(line)?;
        let level = LogLevel::from_keyword(&caps[1]).unwrap_or(LogLevel::Unknown);
        let node_or_time = caps[2].trim();
        let (node, timestamp) = if node_or_time.contains('/') {
            (Some(node_or_time.to_string()), None)
        } else {
            match parse_timestamp(node_or_time) {
                Some(ts) => (None, Some(ts)),
                None => (Some(node_or_time.to_string()), None),
            }
        };

        Some(ParsedLine {
            level,
            message: caps[3].trim().to_string(),
            timestamp,
            node,
            metadata: HashMap::new(),
            format: LineFormat::RosShort,
        })
    }

    fn parse_json(line: &str) -> Option<ParsedLine> {
        if !line.starts_with('{') {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let obj = value.as_object()?;

        let level = first_str(obj, &JSON_LEVEL_KEYS)
            .and_then(LogLevel::from_keyword)
            .unwrap_or(LogLevel::Unknown);
        let message = first_str(obj, &JSON_MESSAGE_KEYS)
            .map_or_else(|| line.to_string(), ToString::to_string);
        let timestamp = first_str(obj, &JSON_TIME_KEYS).and_then(parse_timestamp);
        let node = first_str(obj, &JSON_NODE_KEYS).map(ToString::to_string);

        let reserved: Vec<&str> = JSON_LEVEL_KEYS
            .iter()
            .chain(JSON_MESSAGE_KEYS.iter())
            .copied()
            .collect();
        let metadata = obj
            .iter()
            .filter(|(key, _)| !reserved.contains(&key.to_lowercase().as_str()))
            .map(|(key, value)| {
                let value = value
                    .as_str()
                    .map_or_else(|| value.to_string(), ToString::to_string);
                (key.clone(), value)
            })
            .collect();

        Some(ParsedLine {
            level,
            message,
            timestamp,
            node,
            metadata,
            format: LineFormat::Json,
        })
    }

    fn parse_plain(line: &str) -> Option<ParsedLine> {
        let (timestamp, rest) = match LEADING_TIMESTAMP.captures(line) {
            Some(caps) => (
                parse_timestamp(&caps[1]),
                caps.get(2).map_or("", |m| m.as_str()),
            ),
            None => (None, line),
        };

        let (level, message) = split_level_prefix(rest)?;
        Some(ParsedLine {
            level,
            message: message.to_string(),
            timestamp,
            node: None,
            metadata: HashMap::new(),
            format: LineFormat::Plain,
        })
    }
}

/// Splits `ERROR: msg`, `WARN msg`, `INFO| msg` or `[DEBUG] msg`.
fn split_level_prefix(line: &str) -> Option<(LogLevel, &str)> {
    if let Some(inner) = line.strip_prefix('[') {
        let end = inner.find(']')?;
        let level = LogLevel::from_keyword(&inner[..end])?;
        let message = inner[end + 1..].trim_start_matches([':', ' ', '|', '-']);
        return Some((level, message.trim_end()));
    }

    let end = line.find([':', ' ', '|'])?;
    let level = LogLevel::from_keyword(&line[..end])?;
    let message = line[end..].trim_start_matches([':', ' ', '|', '-']);
    Some((level, message.trim_end()))
}

fn first_str<'a>(
    obj: &'a serde_json::Map<String, serde_json::Value>,
    keys: &[&str],
) -> Option<&'a str> {
    keys.iter().find_map(|key| obj.get(*key).and_then(|v| v.as_str()))
}

/// Parses the timestamp shapes seen in robot and service logs.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }

    let normalized = text.replacen('T', " ", 1);
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(&normalized, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Extracts `key=value` pairs from free text; quoted values are unquoted.
#[must_use]
pub fn extract_key_values(text: &str) -> Vec<(String, String)> {
    KEY_VALUE
        .captures_iter(text)
        .map(|caps| {
            let raw = &caps[2];
            let value = raw
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(raw);
            (caps[1].to_string(), value.replace("\\\"", "\""))
        })
        .collect()
}
