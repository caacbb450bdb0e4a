//! Property diffs and drift detection

use crate::error::{Error, Result, ValidationError};
use crate::resource::ProviderRegistry;
use crate::types::{Properties, PropertyValue, ResolvedProperties};
use serde::Serialize;
use serde_json::Value;
use statestore::StateSnapshot;
use std::collections::BTreeSet;

/// A change to one top-level property
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    pub property: String,
    /// Previous value, `None` if the property is being added
    pub before: Option<Value>,
    /// New value, `None` if the property is being removed
    pub after: Option<PropertyValue>,
    /// Whether the provider must replace the resource for this change
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub requires_replacement: bool,
}

impl PropertyChange {
    /// Check if this change adds a property
    pub fn is_addition(&self) -> bool {
        self.before.is_none()
    }

    /// Check if this change removes a property
    pub fn is_removal(&self) -> bool {
        self.after.is_none()
    }
}

/// Compare recorded properties against desired ones
///
/// Unknown desired values always count as changed. Changes come out in
/// property name order.
pub fn diff_properties(before: &Properties, after: &ResolvedProperties) -> Vec<PropertyChange> {
    let names: BTreeSet<&String> = before.keys().chain(after.keys()).collect();

    names
        .into_iter()
        .filter_map(|name| {
            let old = before.get(name);
            let new = after.get(name);
            let changed = match (old, new) {
                (Some(old), Some(PropertyValue::Known(new))) => old != new,
                (None, None) => false,
                _ => true,
            };
            changed.then(|| PropertyChange {
                property: name.clone(),
                before: old.cloned(),
                after: new.cloned(),
                requires_replacement: false,
            })
        })
        .collect()
}

/// Drift status of one resource
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftStatus {
    InSync,
    /// Actual properties differ from the last applied ones
    Modified { changes: Vec<PropertyChange> },
    /// The physical resource no longer exists
    Deleted,
}

/// Drift of one recorded resource
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEntry {
    pub logical_id: String,
    pub resource_type: String,
    pub physical_id: String,
    pub status: DriftStatus,
    /// Properties as read back, if the resource still exists
    #[serde(skip)]
    pub actual: Option<Properties>,
}

/// Read-back comparison of every recorded resource
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriftReport {
    pub entries: Vec<DriftEntry>,
}

impl DriftReport {
    pub fn get(&self, logical_id: &str) -> Option<&DriftEntry> {
        self.entries.iter().find(|e| e.logical_id == logical_id)
    }

    /// Entries that are not in sync
    pub fn drifted(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries
            .iter()
            .filter(|e| e.status != DriftStatus::InSync)
    }

    pub fn has_drift(&self) -> bool {
        self.drifted().next().is_some()
    }
}

/// Describe every recorded resource and compare with its last-applied properties
pub fn detect_drift(snapshot: &StateSnapshot, providers: &ProviderRegistry) -> Result<DriftReport> {
    let mut report = DriftReport::default();

    for record in snapshot.records() {
        let provider = providers.get(&record.resource_type).ok_or_else(|| {
            ValidationError::UnknownResourceType {
                logical_id: record.logical_id.clone(),
                resource_type: record.resource_type.clone(),
            }
        })?;

        let (status, actual) = match provider.describe(&record.physical_id) {
            Ok(actual) => {
                let changes = diff_properties(&record.properties, &crate::types::known(&actual));
                if changes.is_empty() {
                    (DriftStatus::InSync, Some(actual))
                } else {
                    log::warn!(
                        "Drift on {}: {} property change(s)",
                        record.logical_id,
                        changes.len()
                    );
                    (DriftStatus::Modified { changes }, Some(actual))
                }
            }
            Err(e) if e.is_not_found() => {
                log::warn!(
                    "Drift on {}: {} no longer exists",
                    record.logical_id,
                    record.physical_id
                );
                (DriftStatus::Deleted, None)
            }
            Err(source) => {
                return Err(Error::Provider {
                    logical_id: record.logical_id.clone(),
                    source,
                });
            }
        };

        report.entries.push(DriftEntry {
            logical_id: record.logical_id.clone(),
            resource_type: record.resource_type.clone(),
            physical_id: record.physical_id.clone(),
            status,
            actual,
        });
    }

    Ok(report)
}
