//! Plan engine - diffs the desired graph against recorded state
//!
//! Each included resource is classified in dependency order; resources
//! recorded in state but no longer in the graph are deleted afterwards, in
//! reverse dependency order. The result is a flat list the executor can
//! schedule from each entry's dependencies alone.

use crate::diff::{DriftReport, DriftStatus, PropertyChange, detect_drift, diff_properties};
use crate::error::{Result, ValidationError};
use crate::expr::{AttributeSource, Lookup};
use crate::graph::StackDefinition;
use crate::resource::{ProviderRegistry, UpdatePolicy};
use crate::types::{Properties, ResolvedProperties};
use serde::{Serialize, Serializer};
use serde_json::Value;
use statestore::{DeletionPolicy, StateSnapshot};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What the executor will do with one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    NoOp,
    Create,
    Update,
    /// Delete the old resource, then create a new one
    Replace,
    /// Remove from the stack; with `retained` the physical resource is kept
    Delete { retained: bool },
}

impl Action {
    /// Check if the action changes anything
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Single-character marker for display
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::NoOp => " ",
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "±",
            Self::Delete { retained: false } => "-",
            Self::Delete { retained: true } => "⊘",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => write!(f, "no-op"),
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Replace => write!(f, "replace"),
            Self::Delete { retained: false } => write!(f, "delete"),
            Self::Delete { retained: true } => write!(f, "delete(retained)"),
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// One resource's planned change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanEntry {
    pub logical_id: String,
    pub resource_type: String,
    pub action: Action,
    /// Property changes against recorded (or, with refresh, actual) state
    pub changes: Vec<PropertyChange>,
    /// Entries that must complete before this one
    pub dependencies: BTreeSet<String>,
    pub deletion_policy: DeletionPolicy,
    /// Desired properties as far as they are known at plan time
    pub properties: ResolvedProperties,
    /// Why the action was chosen, when it is not a property change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Counts per action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub delete: usize,
    pub retain: usize,
    pub no_op: usize,
}

impl PlanSummary {
    pub fn add(&mut self, action: Action) {
        match action {
            Action::NoOp => self.no_op += 1,
            Action::Create => self.create += 1,
            Action::Update => self.update += 1,
            Action::Replace => self.replace += 1,
            Action::Delete { retained: false } => self.delete += 1,
            Action::Delete { retained: true } => self.retain += 1,
        }
    }

    /// Total number of changes
    pub fn total_changes(&self) -> usize {
        self.create + self.update + self.replace + self.delete + self.retain
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total_changes() > 0
    }
}

/// An ordered change-set for one stack
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub stack: String,
    /// Digest of the template and parameters being planned
    pub digest: String,
    pub entries: Vec<PlanEntry>,
    pub summary: PlanSummary,
    /// Read-back results, when planned with refresh
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
}

impl Plan {
    pub fn get(&self, logical_id: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.logical_id == logical_id)
    }

    /// Entries that change something
    pub fn changes(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.action.is_change())
    }

    pub fn has_changes(&self) -> bool {
        self.summary.has_changes()
    }

    /// Position of an entry in the plan
    pub fn position(&self, logical_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.logical_id == logical_id)
    }
}

/// Options for planning
#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Read every recorded resource back through its provider first
    pub refresh: bool,
}

/// Answers attribute lookups from recorded state while planning
///
/// Resources planned for create or replace have no usable identifiers yet,
/// so lookups on them are unknown. Resources planned for an in-place update
/// keep their identifier, but an update may refresh their attributes.
struct PlanningSource<'a> {
    definition: &'a StackDefinition,
    snapshot: &'a StateSnapshot,
    pending: &'a BTreeSet<String>,
    updating: &'a BTreeSet<String>,
}

impl AttributeSource for PlanningSource<'_> {
    fn physical_id(&self, logical_id: &str) -> Lookup {
        if !self.definition.graph.contains(logical_id) {
            return Lookup::Missing;
        }
        if self.pending.contains(logical_id) {
            return Lookup::Unknown;
        }
        match self.snapshot.get(logical_id) {
            Some(record) => Lookup::Known(Value::String(record.physical_id.clone())),
            None => Lookup::Unknown,
        }
    }

    fn attribute(&self, logical_id: &str, attribute: &str) -> Lookup {
        match self.physical_id(logical_id) {
            Lookup::Known(_) => {}
            other => return other,
        }
        if self.updating.contains(logical_id) {
            return Lookup::Unknown;
        }
        self.snapshot
            .get(logical_id)
            .and_then(|record| record.attributes.get(attribute))
            .map_or(Lookup::Missing, |value| Lookup::Known(value.clone()))
    }
}

/// Compute the change-set that takes `snapshot` to `definition`
pub fn plan(
    definition: &StackDefinition,
    snapshot: &StateSnapshot,
    providers: &ProviderRegistry,
    options: &PlanOptions,
) -> Result<Plan> {
    let drift = if options.refresh {
        Some(detect_drift(snapshot, providers)?)
    } else {
        None
    };

    let mut entries = Vec::with_capacity(definition.graph.len() + snapshot.len());
    let mut pending = BTreeSet::new();
    let mut updating = BTreeSet::new();

    for node in definition.graph.nodes() {
        let provider = providers.get(&node.resource_type).ok_or_else(|| {
            ValidationError::UnknownResourceType {
                logical_id: node.logical_id.clone(),
                resource_type: node.resource_type.clone(),
            }
        })?;

        let source = PlanningSource {
            definition,
            snapshot,
            pending: &pending,
            updating: &updating,
        };
        let desired = definition.resolve_properties(&node.logical_id, &source)?;

        let drift_entry = drift.as_ref().and_then(|d| d.get(&node.logical_id));
        let recorded = snapshot.get(&node.logical_id);
        let gone = drift_entry.is_some_and(|e| e.status == DriftStatus::Deleted);

        let (action, changes, reason) = match recorded {
            None => (Action::Create, diff_properties(&Properties::new(), &desired), None),
            Some(_) if gone => (
                Action::Create,
                diff_properties(&Properties::new(), &desired),
                Some("resource no longer exists".to_string()),
            ),
            Some(record) => {
                let before = drift_entry
                    .and_then(|e| e.actual.as_ref())
                    .unwrap_or(&record.properties);
                let mut changes = diff_properties(before, &desired);
                for change in &mut changes {
                    change.requires_replacement =
                        provider.update_policy(&change.property) == UpdatePolicy::Replace;
                }

                if record.resource_type != node.resource_type {
                    (
                        Action::Replace,
                        changes,
                        Some(format!("type changes from {}", record.resource_type)),
                    )
                } else if changes.iter().any(|c| c.requires_replacement) {
                    (Action::Replace, changes, None)
                } else if !changes.is_empty() {
                    (Action::Update, changes, None)
                } else if record.deletion_policy != node.deletion_policy {
                    (
                        Action::Update,
                        changes,
                        Some(format!("deletion policy changes to {:?}", node.deletion_policy)),
                    )
                } else {
                    (Action::NoOp, changes, None)
                }
            }
        };

        match action {
            Action::Create | Action::Replace => {
                pending.insert(node.logical_id.clone());
            }
            Action::Update if !changes.is_empty() => {
                updating.insert(node.logical_id.clone());
            }
            _ => {}
        }
        log::debug!("Planned {} for {}", action, node.logical_id);

        entries.push(PlanEntry {
            logical_id: node.logical_id.clone(),
            resource_type: node.resource_type.clone(),
            action,
            changes,
            dependencies: node.dependencies.clone(),
            deletion_policy: node.deletion_policy,
            properties: desired,
            reason,
        });
    }

    entries.extend(plan_deletes(definition, snapshot));

    let mut summary = PlanSummary::default();
    for entry in &entries {
        summary.add(entry.action);
    }

    Ok(Plan {
        stack: definition.name.clone(),
        digest: definition.digest.clone(),
        entries,
        summary,
        drift,
    })
}

/// Delete entries for recorded resources that left the graph
///
/// A resource is deleted only after every resource that depended on it
/// when last applied has been deleted or updated away from it.
fn plan_deletes(definition: &StackDefinition, snapshot: &StateSnapshot) -> Vec<PlanEntry> {
    let removed: BTreeSet<&str> = snapshot
        .logical_ids()
        .filter(|id| !definition.graph.contains(id))
        .collect();

    // For each removed resource, the recorded resources that used it.
    let mut users: BTreeMap<&str, BTreeSet<String>> = removed
        .iter()
        .map(|id| (*id, BTreeSet::new()))
        .collect();
    for record in snapshot.records() {
        for dependency in &record.dependencies {
            if let Some(set) = users.get_mut(dependency.as_str())
                && record.logical_id != *dependency
            {
                set.insert(record.logical_id.clone());
            }
        }
    }

    let mut waiting: BTreeMap<&str, usize> = users
        .iter()
        .map(|(id, set)| {
            let count = set.iter().filter(|u| removed.contains(u.as_str())).count();
            (*id, count)
        })
        .collect();
    let mut ready: BTreeSet<&str> = waiting
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(removed.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        waiting.remove(id);
        if let Some(record) = snapshot.get(id) {
            for dependency in &record.dependencies {
                if let Some(count) = waiting.get_mut(dependency.as_str()) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        ready.insert(dependency.as_str());
                    }
                }
            }
        }
    }
    // Recorded dependencies should never loop, but a corrupted record must
    // not make resources disappear from the plan.
    order.extend(waiting.keys().copied());

    order
        .into_iter()
        .filter_map(|id| snapshot.get(id))
        .map(|record| {
            let retained = record.deletion_policy == DeletionPolicy::Retain;
            PlanEntry {
                logical_id: record.logical_id.clone(),
                resource_type: record.resource_type.clone(),
                action: Action::Delete { retained },
                changes: Vec::new(),
                dependencies: users.remove(record.logical_id.as_str()).unwrap_or_default(),
                deletion_policy: record.deletion_policy,
                properties: ResolvedProperties::new(),
                reason: retained.then(|| "physical resource is retained".to_string()),
            }
        })
        .collect()
}
