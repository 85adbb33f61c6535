//! Analyzer interface and the built-in heuristic analyzer.
//!
//! The dispatcher is the only caller of [`Analyzer::analyze`]; it bounds each
//! call with a timeout and a concurrency limit, so implementations do not need
//! to guard themselves.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Category, ContextBundle, ErrorId, LogLevel, Severity};

/// Explanation produced for one bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Error the result explains
    pub error_id: ErrorId,
    /// Assessed severity
    pub severity: Severity,
    /// Taxonomy category
    pub category: Category,
    /// Taxonomy event code, e.g. `CONNECTION_TIMEOUT`
    pub event: String,
    /// Short human-readable classification
    pub error_type: String,
    /// Explanation of the likely cause
    pub root_cause: String,
    /// Nodes or dependencies involved
    pub affected_systems: Vec<String>,
    /// Suggested remediation steps
    pub corrective_actions: Vec<String>,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
}

/// Why an analysis produced no result.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisFailure {
    /// The call exceeded the configured timeout.
    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),

    /// The backing service could not be reached.
    #[error("analyzer unavailable: {0}")]
    Unavailable(String),

    /// The backing service answered with something unusable.
    #[error("invalid analyzer response: {0}")]
    InvalidResponse(String),
}

/// Explains context bundles.
pub trait Analyzer: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Analyzes one sealed bundle.
    fn analyze(
        &self,
        bundle: &ContextBundle,
    ) -> impl Future<Output = Result<AnalysisResult, AnalysisFailure>> + Send;
}

struct Profile {
    keywords: &'static [&'static str],
    error_type: &'static str,
    root_cause: &'static str,
    actions: &'static [&'static str],
    category: Category,
    event: &'static str,
}

const PROFILES: &[Profile] = &[
    Profile {
        keywords: &["collision", "obstacle", "emergency"],
        error_type: "Collision Detected",
        root_cause: "Robot contacted or nearly contacted an obstacle and safety systems engaged",
        actions: &[
            "Inspect the robot and surroundings before resuming",
            "Check costmap inflation and obstacle layers",
            "Review recent velocity commands",
        ],
        category: Category::Application,
        event: "COLLISION_DETECTED",
    },
    Profile {
        keywords: &["transform", "tf "],
        error_type: "Transform Timeout",
        root_cause: "TF tree not properly initialized or transform lookup timeout",
        actions: &[
            "Check TF tree with 'rosrun tf view_frames'",
            "Restart static transform publisher",
            "Verify frame IDs in configuration",
        ],
        category: Category::Infrastructure,
        event: "CONNECTION_TIMEOUT",
    },
    Profile {
        keywords: &["db_timeout", "database", "connection pool"],
        error_type: "Database Timeout",
        root_cause: "Database dependency did not answer within its deadline",
        actions: &[
            "Check database health and connection pool usage",
            "Look for slow queries or lock contention",
            "Verify network path to the database",
        ],
        category: Category::Infrastructure,
        event: "DB_TIMEOUT",
    },
    Profile {
        keywords: &["plan", "path", "goal"],
        error_type: "Planning Failure",
        root_cause: "Navigation planner unable to find valid path to goal",
        actions: &[
            "Check costmap for obstacles",
            "Verify goal is reachable",
            "Adjust planner parameters",
        ],
        category: Category::Application,
        event: "PLANNING_FAILURE",
    },
    Profile {
        keywords: &["sensor", "laser", "camera", "lidar"],
        error_type: "Sensor Timeout",
        root_cause: "Sensor driver not publishing data or connection lost",
        actions: &[
            "Check sensor connections",
            "Restart sensor driver node",
            "Verify topic is being published",
        ],
        category: Category::External,
        event: "SENSOR_TIMEOUT",
    },
    Profile {
        keywords: &["joint", "limit"],
        error_type: "Joint Limit",
        root_cause: "Commanded motion exceeds a configured joint or position limit",
        actions: &[
            "Review the commanded trajectory",
            "Verify joint limit configuration",
            "Recalibrate joint encoders",
        ],
        category: Category::Application,
        event: "JOINT_LIMIT",
    },
    Profile {
        keywords: &["navigation", "move_base"],
        error_type: "Navigation Failure",
        root_cause: "Navigation stack aborted the current goal",
        actions: &[
            "Check recovery behavior logs",
            "Verify localization quality",
            "Resend the goal after clearing costmaps",
        ],
        category: Category::Application,
        event: "PLANNING_FAILURE",
    },
    Profile {
        keywords: &["connection", "hardware", "communication"],
        error_type: "Hardware Connection",
        root_cause: "Link to a hardware device or driver was lost",
        actions: &[
            "Check cables and power to the device",
            "Restart the hardware driver",
            "Inspect dmesg for USB or CAN errors",
        ],
        category: Category::Infrastructure,
        event: "CONNECTION_TIMEOUT",
    },
    Profile {
        keywords: &["controller", "tracking"],
        error_type: "Controller Error",
        root_cause: "Controller failed to track the commanded trajectory",
        actions: &[
            "Check controller gains",
            "Verify actuator feedback",
            "Restart the controller manager",
        ],
        category: Category::Application,
        event: "CONTROLLER_ERROR",
    },
    Profile {
        keywords: &["slam", "localization", "amcl"],
        error_type: "SLAM Error",
        root_cause: "Localization lost confidence in the robot pose",
        actions: &[
            "Reinitialize the pose estimate",
            "Check map and sensor alignment",
            "Drive to a feature-rich area",
        ],
        category: Category::Application,
        event: "LOCALIZATION_FAILURE",
    },
    Profile {
        keywords: &["queue", "overflow", "dropped"],
        error_type: "Queue Overflow",
        root_cause: "A consumer is not keeping up and messages are being dropped",
        actions: &[
            "Check consumer throughput",
            "Increase queue size or add consumers",
            "Reduce publish rate",
        ],
        category: Category::Queue,
        event: "QUEUE_OVERFLOW",
    },
    Profile {
        keywords: &["unauthorized", "forbidden", "authentication", "token", "permission"],
        error_type: "Authentication Failure",
        root_cause: "A request was rejected because of missing or invalid credentials",
        actions: &[
            "Verify credentials and token expiry",
            "Check role and permission configuration",
        ],
        category: Category::Auth,
        event: "AUTH_FAILURE",
    },
    Profile {
        keywords: &["memory", "oom", "cpu", "disk", "latency", "slow"],
        error_type: "Resource Exhaustion",
        root_cause: "A host or process ran out of a resource it depends on",
        actions: &[
            "Check memory, CPU and disk usage",
            "Look for leaks or runaway processes",
        ],
        category: Category::Performance,
        event: "RESOURCE_EXHAUSTION",
    },
];

/// Keyword-driven analyzer used when no model-backed analyzer is configured.
///
/// The trigger message picks a profile; the rule's hints fill in severity and
/// category when nothing matches.
#[derive(Debug, Clone, Default)]
pub struct HeuristicAnalyzer;

impl HeuristicAnalyzer {
    /// Creates the analyzer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Produces the analysis synchronously.
    #[must_use]
    pub fn explain(&self, bundle: &ContextBundle) -> AnalysisResult {
        let trigger = &bundle.trigger;
        let message = trigger.message.to_lowercase();
        let profile = PROFILES
            .iter()
            .find(|p| p.keywords.iter().any(|k| message.contains(k)));

        let severity = match trigger.level {
            LogLevel::Fatal => Severity::Critical,
            LogLevel::Error => bundle.severity_hint.max(Severity::High),
            _ => bundle.severity_hint,
        };

        let mut affected_systems = bundle.nodes();
        for key in ["dependency", "component", "service"] {
            if let Some(value) = trigger.metadata.get(key) {
                if !affected_systems.contains(value) {
                    affected_systems.push(value.clone());
                }
            }
        }

        let (result_type, root_cause, actions, category, event, mut confidence) = match profile {
            Some(p) => (
                p.error_type.to_string(),
                p.root_cause.to_string(),
                p.actions.iter().map(|a| (*a).to_string()).collect::<Vec<_>>(),
                p.category,
                p.event.to_string(),
                0.75,
            ),
            None => {
                let origin = trigger.node.as_deref().unwrap_or("unknown node");
                (
                    "System Error".to_string(),
                    format!("Error detected in {origin}: {}", trigger.message),
                    vec![
                        format!("Review {origin} logs"),
                        "Check node status with 'rosnode info'".to_string(),
                        "Restart the affected node".to_string(),
                    ],
                    bundle.category_hint,
                    "APPLICATION_ERROR".to_string(),
                    0.5,
                )
            }
        };

        if !bundle.is_full() {
            confidence -= 0.15;
        }
        if bundle.gap {
            confidence -= 0.1;
        }

        AnalysisResult {
            error_id: bundle.error_id,
            severity,
            category,
            event,
            error_type: result_type,
            root_cause,
            affected_systems,
            corrective_actions: actions,
            confidence,
        }
    }
}

impl Analyzer for HeuristicAnalyzer {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn analyze(&self, bundle: &ContextBundle) -> Result<AnalysisResult, AnalysisFailure> {
        Ok(self.explain(bundle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Completeness, LogRecord};
    use chrono::Utc;
    use std::sync::Arc;
    use test_case::test_case;

    fn bundle(level: LogLevel, message: &str, completeness: Completeness) -> ContextBundle {
        ContextBundle {
            error_id: ErrorId(3),
            rule: "error_level".to_string(),
            category_hint: Category::Application,
            severity_hint: Severity::Medium,
            before: vec![Arc::new(
                LogRecord::new(1, LogLevel::Info, "Received goal").with_node("/move_base"),
            )],
            trigger: Arc::new(LogRecord::new(2, level, message).with_node("/amcl")),
            after: Vec::new(),
            completeness,
            gap: false,
            sealed_at: Utc::now(),
        }
    }

    #[test_case("Failed to get robot pose: Transform timeout", "Transform Timeout", Category::Infrastructure ; "transform")]
    #[test_case("Global planner failed to find a path", "Planning Failure", Category::Application ; "planning")]
    #[test_case("Laser scan timeout", "Sensor Timeout", Category::External ; "sensor")]
    #[test_case("Joint 3 exceeded position limit", "Joint Limit", Category::Application ; "joint")]
    #[test_case("DB_TIMEOUT on dependency=payment-db", "Database Timeout", Category::Infrastructure ; "database")]
    #[test_case("request unauthorized", "Authentication Failure", Category::Auth ; "auth")]
    fn profiles_from_trigger_message(message: &str, error_type: &str, category: Category) {
        let result = HeuristicAnalyzer::new().explain(&bundle(LogLevel::Error, message, Completeness::Full));
        assert_eq!(result.error_type, error_type);
        assert_eq!(result.category, category);
        assert!((result.confidence - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_message_falls_back_to_rule_hints() {
        let result = HeuristicAnalyzer::new().explain(&bundle(LogLevel::Warn, "weird state", Completeness::Full));
        assert_eq!(result.error_type, "System Error");
        assert_eq!(result.category, Category::Application);
        assert_eq!(result.event, "APPLICATION_ERROR");
        assert_eq!(result.severity, Severity::Medium);
        assert!(result.root_cause.contains("/amcl"));
    }

    #[test]
    fn severity_follows_trigger_level() {
        let analyzer = HeuristicAnalyzer::new();
        let fatal = analyzer.explain(&bundle(LogLevel::Fatal, "Emergency stop", Completeness::Full));
        assert_eq!(fatal.severity, Severity::Critical);
        let error = analyzer.explain(&bundle(LogLevel::Error, "weird state", Completeness::Full));
        assert_eq!(error.severity, Severity::High);
    }

    #[test]
    fn partial_bundles_lower_confidence() {
        let result = HeuristicAnalyzer::new().explain(&bundle(
            LogLevel::Error,
            "Laser scan timeout",
            Completeness::PartialTimeout,
        ));
        assert!(result.confidence < 0.75);
    }

    #[test]
    fn affected_systems_include_nodes_and_dependency() {
        let mut b = bundle(LogLevel::Error, "DB_TIMEOUT", Completeness::Full);
        b.trigger = Arc::new(
            LogRecord::new(2, LogLevel::Error, "DB_TIMEOUT")
                .with_node("/api")
                .with_metadata("dependency", "payment-db"),
        );
        let result = HeuristicAnalyzer::new().explain(&b);
        assert_eq!(
            result.affected_systems,
            vec!["/move_base".to_string(), "/api".to_string(), "payment-db".to_string()]
        );
    }

    #[tokio::test]
    async fn analyze_wraps_explain() {
        let analyzer = HeuristicAnalyzer::new();
        let b = bundle(LogLevel::Error, "Laser scan timeout", Completeness::Full);
        let result = analyzer.analyze(&b).await.expect("heuristic never fails");
        assert_eq!(result, analyzer.explain(&b));
        assert_eq!(analyzer.name(), "heuristic");
    }
}
