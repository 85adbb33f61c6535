//! Error detection.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::rules::RuleSet;
use crate::types::{DetectedError, ErrorId, LogRecord};

/// Evaluates each record against an ordered rule set.
///
/// Error ids come from a counter owned by the detector, so replaying the same
/// records through a fresh detector yields the same ids and rule names.
#[derive(Debug, Clone)]
pub struct ErrorDetector {
    rules: RuleSet,
    next_error_id: u64,
}

impl ErrorDetector {
    /// Creates a detector whose first error id is 1.
    #[must_use]
    pub const fn new(rules: RuleSet) -> Self {
        Self::starting_at(rules, 1)
    }

    /// Creates a detector with an explicit first error id.
    #[must_use]
    pub const fn starting_at(rules: RuleSet, next_error_id: u64) -> Self {
        Self {
            rules,
            next_error_id,
        }
    }

    /// The rules in evaluation order.
    #[must_use]
    pub const fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// The id the next detection will receive.
    #[must_use]
    pub const fn next_error_id(&self) -> u64 {
        self.next_error_id
    }

    /// Returns a detection if any rule matches; the first match wins.
    pub fn inspect(&mut self, record: &Arc<LogRecord>) -> Option<DetectedError> {
        let rule = self.rules.first_match(record)?;

        let error_id = ErrorId(self.next_error_id);
        self.next_error_id += 1;

        debug!(
            error_id = %error_id,
            rule = %rule.name,
            sequence_no = record.sequence_no,
            "error detected"
        );

        Some(DetectedError {
            error_id,
            triggering_record: Arc::clone(record),
            matched_rule: rule.name.clone(),
            category_hint: rule.category_hint,
            severity_hint: rule.severity_hint,
            detected_at: Instant::now(),
        })
    }
}
