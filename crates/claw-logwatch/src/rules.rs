//! Error pattern rules.
//!
//! Rules are data: a [`RuleSpec`] is the serializable form loaded from
//! configuration, and [`RuleSet::compile`] turns an ordered list of specs into
//! [`PatternRule`]s with compiled regexes. Matchers are pure predicates over a
//! single record, so evaluation is O(1) per record and adding a rule never
//! changes how other rules behave.

use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{LogwatchError, Result};
use crate::types::{Category, LogLevel, LogRecord, Severity};

const fn default_true() -> bool {
    true
}

/// Serializable predicate over a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatcherSpec {
    /// Level at or above the given level
    LevelAtLeast {
        /// Minimum level
        level: LogLevel,
    },
    /// Level is one of the given levels
    LevelIn {
        /// Accepted levels
        levels: Vec<LogLevel>,
    },
    /// Message contains a substring
    MessageContains {
        /// Substring to look for
        text: String,
        /// Ignore ASCII case
        #[serde(default = "default_true")]
        case_insensitive: bool,
    },
    /// Message matches a regular expression
    MessageRegex {
        /// Regex source
        pattern: String,
        /// Compile case-insensitively
        #[serde(default = "default_true")]
        case_insensitive: bool,
    },
    /// Metadata contains a key
    MetadataKey {
        /// Key to look for
        key: String,
    },
    /// Metadata key has exactly the given value
    MetadataEquals {
        /// Key to look up
        key: String,
        /// Expected value
        value: String,
    },
    /// Record was emitted by the given node
    NodeEquals {
        /// Node name
        node: String,
    },
    /// Every inner matcher matches
    All {
        /// Inner matchers
        matchers: Vec<MatcherSpec>,
    },
    /// At least one inner matcher matches
    Any {
        /// Inner matchers
        matchers: Vec<MatcherSpec>,
    },
    /// The inner matcher does not match
    Not {
        /// Inner matcher
        matcher: Box<MatcherSpec>,
    },
}

impl MatcherSpec {
    /// Shorthand for a case-insensitive message regex.
    #[must_use]
    pub fn regex(pattern: impl Into<String>) -> Self {
        Self::MessageRegex {
            pattern: pattern.into(),
            case_insensitive: true,
        }
    }

    /// Shorthand for a level threshold.
    #[must_use]
    pub const fn level_at_least(level: LogLevel) -> Self {
        Self::LevelAtLeast { level }
    }
}

/// Serializable pattern rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    /// Unique rule name, reported with every detection
    pub name: String,
    /// Predicate
    pub matcher: MatcherSpec,
    /// Category hint for the analyzer
    pub category: Category,
    /// Severity hint for the analyzer
    pub severity: Severity,
}

impl RuleSpec {
    /// Creates a rule spec.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        matcher: MatcherSpec,
        category: Category,
        severity: Severity,
    ) -> Self {
        Self {
            name: name.into(),
            matcher,
            category,
            severity,
        }
    }
}

/// Compiled predicate.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Level at or above
    LevelAtLeast(LogLevel),
    /// Level in set
    LevelIn(Vec<LogLevel>),
    /// Substring; the needle is lowercased when case-insensitive
    MessageContains {
        /// Needle
        needle: String,
        /// Ignore ASCII case
        case_insensitive: bool,
    },
    /// Compiled regex
    MessageRegex(Regex),
    /// Metadata key present
    MetadataKey(String),
    /// Metadata key equals value
    MetadataEquals(String, String),
    /// Node equals
    NodeEquals(String),
    /// Conjunction
    All(Vec<Matcher>),
    /// Disjunction
    Any(Vec<Matcher>),
    /// Negation
    Not(Box<Matcher>),
}

impl Matcher {
    fn compile(spec: &MatcherSpec, rule: &str) -> Result<Self> {
        let invalid = |reason: String| LogwatchError::InvalidRule {
            name: rule.to_string(),
            reason,
        };

        Ok(match spec {
            MatcherSpec::LevelAtLeast { level } => Self::LevelAtLeast(*level),
            MatcherSpec::LevelIn { levels } => {
                if levels.is_empty() {
                    return Err(invalid("level_in needs at least one level".to_string()));
                }
                Self::LevelIn(levels.clone())
            }
            MatcherSpec::MessageContains {
                text,
                case_insensitive,
            } => {
                if text.is_empty() {
                    return Err(invalid("message_contains needs non-empty text".to_string()));
                }
                let needle = if *case_insensitive {
                    text.to_lowercase()
                } else {
                    text.clone()
                };
                Self::MessageContains {
                    needle,
                    case_insensitive: *case_insensitive,
                }
            }
            MatcherSpec::MessageRegex {
                pattern,
                case_insensitive,
            } => {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(*case_insensitive)
                    .build()
                    .map_err(|e| invalid(e.to_string()))?;
                Self::MessageRegex(regex)
            }
            MatcherSpec::MetadataKey { key } => Self::MetadataKey(key.clone()),
            MatcherSpec::MetadataEquals { key, value } => {
                Self::MetadataEquals(key.clone(), value.clone())
            }
            MatcherSpec::NodeEquals { node } => Self::NodeEquals(node.clone()),
            MatcherSpec::All { matchers } | MatcherSpec::Any { matchers } => {
                if matchers.is_empty() {
                    return Err(invalid("all/any needs at least one matcher".to_string()));
                }
                let inner = matchers
                    .iter()
                    .map(|m| Self::compile(m, rule))
                    .collect::<Result<Vec<_>>>()?;
                if matches!(spec, MatcherSpec::All { .. }) {
                    Self::All(inner)
                } else {
                    Self::Any(inner)
                }
            }
            MatcherSpec::Not { matcher } => Self::Not(Box::new(Self::compile(matcher, rule)?)),
        })
    }

    /// Evaluates the predicate against a record.
    #[must_use]
    pub fn matches(&self, record: &LogRecord) -> bool {
        match self {
            Self::LevelAtLeast(level) => record.level.is_at_least(*level),
            Self::LevelIn(levels) => levels.contains(&record.level),
            Self::MessageContains {
                needle,
                case_insensitive,
            } => {
                if *case_insensitive {
                    record.message.to_lowercase().contains(needle.as_str())
                } else {
                    record.message.contains(needle.as_str())
                }
            }
            Self::MessageRegex(regex) => regex.is_match(&record.message),
            Self::MetadataKey(key) => record.metadata.contains_key(key),
            Self::MetadataEquals(key, value) => record.metadata.get(key) == Some(value),
            Self::NodeEquals(node) => record.node.as_deref() == Some(node.as_str()),
            Self::All(inner) => inner.iter().all(|m| m.matches(record)),
            Self::Any(inner) => inner.iter().any(|m| m.matches(record)),
            Self::Not(inner) => !inner.matches(record),
        }
    }
}

/// A compiled, named pattern rule.
#[derive(Debug, Clone)]
pub struct PatternRule {
    /// Rule name
    pub name: String,
    /// Compiled predicate
    pub matcher: Matcher,
    /// Category hint
    pub category_hint: Category,
    /// Severity hint
    pub severity_hint: Severity,
}

impl PatternRule {
    /// Compiles a rule spec.
    ///
    /// # Errors
    ///
    /// Returns `LogwatchError::InvalidRule` if the name is empty or a matcher
    /// cannot be compiled.
    pub fn compile(spec: &RuleSpec) -> Result<Self> {
        if spec.name.trim().is_empty() {
            return Err(LogwatchError::InvalidRule {
                name: spec.name.clone(),
                reason: "rule name cannot be empty".to_string(),
            });
        }

        Ok(Self {
            name: spec.name.clone(),
            matcher: Matcher::compile(&spec.matcher, &spec.name)?,
            category_hint: spec.category,
            severity_hint: spec.severity,
        })
    }

    /// Evaluates the rule against a record.
    #[must_use]
    pub fn matches(&self, record: &LogRecord) -> bool {
        self.matcher.matches(record)
    }
}

/// An ordered, immutable set of compiled rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Arc<[PatternRule]>,
}

impl RuleSet {
    /// Compiles rule specs, preserving declaration order.
    ///
    /// # Errors
    ///
    /// Returns the first compilation error.
    pub fn compile(specs: &[RuleSpec]) -> Result<Self> {
        let rules = specs
            .iter()
            .map(PatternRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            rules: rules.into(),
        })
    }

    /// The built-in rule set.
    ///
    /// # Errors
    ///
    /// Never fails in practice; the built-in patterns are valid.
    pub fn defaults() -> Result<Self> {
        Self::compile(&default_rule_specs())
    }

    /// Returns the first rule matching the record, in declaration order.
    #[must_use]
    pub fn first_match(&self, record: &LogRecord) -> Option<&PatternRule> {
        self.rules.iter().find(|rule| rule.matches(record))
    }

    /// Iterates rules in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &PatternRule> {
        self.rules.iter()
    }

    /// Number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if there are no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

const FAILURE_KEYWORDS: &str =
    r"exception|fail(ed|ure)?|unable|cannot|can't|refused|timed out|timeout";

fn error_signal() -> MatcherSpec {
    MatcherSpec::Any {
        matchers: vec![
            MatcherSpec::level_at_least(LogLevel::Error),
            MatcherSpec::regex(FAILURE_KEYWORDS),
        ],
    }
}

fn typed(name: &str, pattern: &str, category: Category, severity: Severity) -> RuleSpec {
    RuleSpec::new(
        name,
        MatcherSpec::All {
            matchers: vec![error_signal(), MatcherSpec::regex(pattern)],
        },
        category,
        severity,
    )
}

fn at_warn_or_above(name: &str, pattern: &str, category: Category, severity: Severity) -> RuleSpec {
    RuleSpec::new(
        name,
        MatcherSpec::All {
            matchers: vec![
                MatcherSpec::level_at_least(LogLevel::Warn),
                MatcherSpec::regex(pattern),
            ],
        },
        category,
        severity,
    )
}

/// The built-in taxonomy: specific error types first, generic fallbacks last.
#[must_use]
pub fn default_rule_specs() -> Vec<RuleSpec> {
    vec![
        at_warn_or_above(
            "emergency_stop",
            r"emergency[ _]stop|power failure|hardware failure|safety.*violated",
            Category::Infrastructure,
            Severity::Critical,
        ),
        at_warn_or_above(
            "collision",
            r"collision|obstacle.*detected|contact.*detected",
            Category::Application,
            Severity::Critical,
        ),
        typed(
            "transform_timeout",
            r"transform.*timeout|lookup.*transform|can.?t.*lookup|no.*transform",
            Category::Infrastructure,
            Severity::High,
        ),
        typed(
            "database_timeout",
            r"db_timeout|database.*(timeout|timed out)|connection pool.*exhausted",
            Category::Infrastructure,
            Severity::High,
        ),
        typed(
            "sensor_timeout",
            r"sensor.*timeout|laser.*timeout|camera.*timeout|no.*data.*received|(sensor|laser).*not.*respond|not receiving data",
            Category::External,
            Severity::High,
        ),
        typed(
            "hardware_connection",
            r"connection.*refused|unable.*connect|hardware.*disconnected|communication.*error",
            Category::Infrastructure,
            Severity::High,
        ),
        typed(
            "planning_failure",
            r"plan.*fail|no.*valid.*path|goal.*unreachable|planning.*error",
            Category::Application,
            Severity::High,
        ),
        typed(
            "navigation_failure",
            r"navigation.*fail|move_base.*fail|abort.*navigation",
            Category::Application,
            Severity::High,
        ),
        typed(
            "joint_limit",
            r"joint.*limit|limit.*exceeded|out.*of.*range|position.*limit",
            Category::Application,
            Severity::High,
        ),
        typed(
            "controller_error",
            r"controller.*error|control.*fail|tracking.*error",
            Category::Application,
            Severity::High,
        ),
        typed(
            "slam_error",
            r"slam.*error|localization.*fail|amcl.*error",
            Category::Application,
            Severity::High,
        ),
        typed(
            "auth_failure",
            r"unauthori[sz]ed|forbidden|authentication.*fail|invalid.*token|permission denied",
            Category::Auth,
            Severity::High,
        ),
        typed(
            "resource_exhaustion",
            r"out of memory|\boom\b|disk.*full|too many open files",
            Category::Performance,
            Severity::High,
        ),
        at_warn_or_above(
            "queue_overflow",
            r"queue.*(overflow|full)|buffer.*overflow|dropp(ed|ing).*messages",
            Category::Queue,
            Severity::Medium,
        ),
        RuleSpec::new(
            "fatal_level",
            MatcherSpec::level_at_least(LogLevel::Fatal),
            Category::Application,
            Severity::Critical,
        ),
        RuleSpec::new(
            "error_level",
            MatcherSpec::LevelIn {
                levels: vec![LogLevel::Error],
            },
            Category::Application,
            Severity::High,
        ),
        at_warn_or_above(
            "failure_keyword",
            FAILURE_KEYWORDS,
            Category::Application,
            Severity::Medium,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn record(level: LogLevel, message: &str) -> LogRecord {
        LogRecord::new(1, level, message)
    }

    fn defaults() -> RuleSet {
        RuleSet::defaults().expect("built-in rules compile")
    }

    #[test]
    fn default_rules_compile_with_unique_names() {
        let rules = defaults();
        let mut names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test_case(LogLevel::Error, "Failed to get robot pose: Transform timeout", Some("transform_timeout") ; "transform")]
    #[test_case(LogLevel::Error, "DB_TIMEOUT on dependency=payment-db", Some("database_timeout") ; "database")]
    #[test_case(LogLevel::Error, "Navigation failed: Goal unreachable", Some("planning_failure") ; "planning before navigation")]
    #[test_case(LogLevel::Warn, "Laser scan timeout: not receiving data", Some("sensor_timeout") ; "sensor")]
    #[test_case(LogLevel::Fatal, "Emergency stop triggered", Some("emergency_stop") ; "emergency")]
    #[test_case(LogLevel::Fatal, "segfault in driver", Some("fatal_level") ; "fatal fallback")]
    #[test_case(LogLevel::Error, "something odd", Some("error_level") ; "error fallback")]
    #[test_case(LogLevel::Warn, "retry failed", Some("failure_keyword") ; "keyword fallback")]
    #[test_case(LogLevel::Info, "Transform published: base_link -> laser", None ; "normal info")]
    #[test_case(LogLevel::Warn, "Battery level below 30%", None ; "plain warning")]
    #[test_case(LogLevel::Unknown, "java.lang.RuntimeException", None ; "unknown level keyword")]
    fn default_rules_classify(level: LogLevel, message: &str, expected: Option<&str>) {
        let rules = defaults();
        let matched = rules.first_match(&record(level, message)).map(|r| r.name.as_str());
        assert_eq!(matched, expected);
    }

    #[test]
    fn first_match_follows_declaration_order() {
        let specs = vec![
            RuleSpec::new(
                "second_wins_never",
                MatcherSpec::level_at_least(LogLevel::Error),
                Category::Application,
                Severity::High,
            ),
            RuleSpec::new(
                "db",
                MatcherSpec::MessageContains {
                    text: "db".to_string(),
                    case_insensitive: true,
                },
                Category::Infrastructure,
                Severity::Critical,
            ),
        ];
        let rules = RuleSet::compile(&specs).expect("compile");
        let matched = rules.first_match(&record(LogLevel::Error, "DB down"));
        assert_eq!(matched.map(|r| r.name.as_str()), Some("second_wins_never"));
    }

    #[test]
    fn metadata_and_node_matchers() {
        let spec = RuleSpec::new(
            "payment_db",
            MatcherSpec::All {
                matchers: vec![
                    MatcherSpec::MetadataEquals {
                        key: "dependency".to_string(),
                        value: "payment-db".to_string(),
                    },
                    MatcherSpec::MetadataKey {
                        key: "latency_ms".to_string(),
                    },
                    MatcherSpec::Not {
                        matcher: Box::new(MatcherSpec::NodeEquals {
                            node: "/healthcheck".to_string(),
                        }),
                    },
                ],
            },
            Category::External,
            Severity::High,
        );
        let rules = RuleSet::compile(&[spec]).expect("compile");

        let hit = record(LogLevel::Info, "slow")
            .with_metadata("dependency", "payment-db")
            .with_metadata("latency_ms", "900");
        assert!(rules.first_match(&hit).is_some());

        let from_healthcheck = hit.clone().with_node("/healthcheck");
        assert!(rules.first_match(&from_healthcheck).is_none());

        let other = record(LogLevel::Info, "slow").with_metadata("dependency", "cache");
        assert!(rules.first_match(&other).is_none());
    }

    #[test]
    fn case_sensitive_contains() {
        let spec = RuleSpec::new(
            "exact",
            MatcherSpec::MessageContains {
                text: "OOM".to_string(),
                case_insensitive: false,
            },
            Category::Performance,
            Severity::High,
        );
        let rules = RuleSet::compile(&[spec]).expect("compile");
        assert!(rules.first_match(&record(LogLevel::Info, "OOM killer")).is_some());
        assert!(rules.first_match(&record(LogLevel::Info, "oom killer")).is_none());
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let spec = RuleSpec::new(
            "broken",
            MatcherSpec::regex("(unclosed"),
            Category::Application,
            Severity::Low,
        );
        let err = RuleSet::compile(&[spec]).err();
        assert!(matches!(err, Some(LogwatchError::InvalidRule { name, .. }) if name == "broken"));
    }

    #[test]
    fn empty_combinator_is_rejected() {
        let spec = RuleSpec::new(
            "empty",
            MatcherSpec::Any { matchers: vec![] },
            Category::Application,
            Severity::Low,
        );
        assert!(RuleSet::compile(&[spec]).is_err());
    }

    #[test]
    fn rule_spec_json_shape() {
        let json = r#"{
            "name": "db",
            "matcher": {"type": "message_regex", "pattern": "db_timeout"},
            "category": "INFRASTRUCTURE",
            "severity": "high"
        }"#;
        let spec: RuleSpec = serde_json::from_str(json).expect("parse rule");
        assert_eq!(
            spec.matcher,
            MatcherSpec::MessageRegex {
                pattern: "db_timeout".to_string(),
                case_insensitive: true
            }
        );
        assert_eq!(spec.category, Category::Infrastructure);
    }
}
