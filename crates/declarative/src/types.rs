//! Core types shared by the planner and executor

use crate::planner::Action;
use serde::{Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Concrete property mapping, as sent to providers and stored in state
pub type Properties = BTreeMap<String, Value>;

/// Property mapping that may still contain values known only after apply
pub type ResolvedProperties = BTreeMap<String, PropertyValue>;

/// A resolved property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Known(Value),
    /// Depends on an attribute of a resource that has not been created yet
    Unknown,
}

impl PropertyValue {
    pub fn as_known(&self) -> Option<&Value> {
        match self {
            Self::Known(v) => Some(v),
            Self::Unknown => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(Value::String(s)) => write!(f, "\"{s}\""),
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Known(v) => v.serialize(serializer),
            Self::Unknown => serializer.serialize_str("(known after apply)"),
        }
    }
}

/// Lift concrete properties into resolved ones
pub fn known(properties: &Properties) -> ResolvedProperties {
    properties
        .iter()
        .map(|(k, v)| (k.clone(), PropertyValue::Known(v.clone())))
        .collect()
}

/// Status of one entry after apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Nothing to do
    Unchanged,
    Succeeded,
    /// The provider call (or resolving its inputs) failed
    Failed { error: String },
    /// Not attempted: a dependency failed or the run was cancelled
    Skipped { reason: String },
}

impl OutcomeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Unchanged)
    }
}

/// Result of applying one plan entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyOutcome {
    pub logical_id: String,
    pub action: Action,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

/// Aggregate counts over all outcomes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unchanged: usize,
}

impl ApplySummary {
    /// Check if every attempted change succeeded and none were skipped
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Total number of entries accounted for
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.unchanged
    }

    /// Add an outcome to the summary
    pub fn add_outcome(&mut self, outcome: &ApplyOutcome) {
        match outcome.status {
            OutcomeStatus::Unchanged => self.unchanged += 1,
            OutcomeStatus::Succeeded => self.succeeded += 1,
            OutcomeStatus::Failed { .. } => self.failed += 1,
            OutcomeStatus::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Aggregate result of an apply
#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyReport {
    /// Outcomes in completion order
    pub outcomes: Vec<ApplyOutcome>,
    pub summary: ApplySummary,
    /// Whether the run stopped early on cancellation
    pub cancelled: bool,
    /// Outputs evaluated after the change-set
    pub outputs: BTreeMap<String, Value>,
}

impl ApplyReport {
    pub fn record(&mut self, outcome: ApplyOutcome) {
        self.summary.add_outcome(&outcome);
        self.outcomes.push(outcome);
    }

    pub fn outcome(&self, logical_id: &str) -> Option<&ApplyOutcome> {
        self.outcomes.iter().find(|o| o.logical_id == logical_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(id: &str, status: OutcomeStatus) -> ApplyOutcome {
        ApplyOutcome {
            logical_id: id.to_string(),
            action: Action::Create,
            status,
        }
    }

    #[test]
    fn test_summary_counts() {
        let mut report = ApplyReport::default();
        report.record(outcome("A", OutcomeStatus::Succeeded));
        report.record(outcome(
            "B",
            OutcomeStatus::Failed {
                error: "boom".into(),
            },
        ));
        report.record(outcome(
            "C",
            OutcomeStatus::Skipped {
                reason: "dependency 'B' failed".into(),
            },
        ));

        assert_eq!(report.summary.succeeded, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.total(), 3);
        assert!(!report.summary.is_success());
        assert!(report.outcome("C").is_some());
    }

    #[test]
    fn test_unknown_serializes_as_marker() {
        let props = BTreeMap::from([
            ("A".to_string(), PropertyValue::Known(json!(1))),
            ("B".to_string(), PropertyValue::Unknown),
        ]);
        assert_eq!(
            serde_json::to_value(&props).unwrap(),
            json!({"A": 1, "B": "(known after apply)"})
        );
    }

    #[test]
    fn test_outcome_serialization() {
        let value = serde_json::to_value(outcome(
            "B",
            OutcomeStatus::Failed {
                error: "boom".into(),
            },
        ))
        .unwrap();
        assert_eq!(value["status"], json!("failed"));
        assert_eq!(value["error"], json!("boom"));
        assert_eq!(value["action"], json!("create"));
    }
}
