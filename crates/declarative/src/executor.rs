//! Execution engine - applies a plan with bounded parallelism
//!
//! One coordinating thread owns the snapshot and the lock guard. Provider
//! calls run on a rayon pool and report back over a channel, and each
//! result is persisted before anything that depends on it is dispatched.

use crate::context::{ApplyOptions, ProgressCallback};
use crate::diff::diff_properties;
use crate::error::{Error, Result};
use crate::expr::{AttributeSource, Lookup};
use crate::graph::StackDefinition;
use crate::planner::{Action, Plan, PlanEntry};
use crate::resource::{ProviderRegistry, ResourceProvider, UpdatePolicy};
use crate::types::{ApplyOutcome, ApplyReport, OutcomeStatus, Properties, known};
use chrono::Utc;
use serde_json::Value;
use statestore::{
    DeletionPolicy, LockGuard, LockManager, ResourceRecord, StackMeta, StateSnapshot, StateStore,
};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

/// How often the coordinator wakes to check the lock and cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stores and providers the executor works through
pub struct ExecutionContext<'a> {
    pub definition: &'a StackDefinition,
    pub store: &'a StateStore,
    pub locks: &'a LockManager,
    pub providers: &'a ProviderRegistry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

/// Answers lookups from what has actually been applied so far
struct LiveSource<'a> {
    definition: &'a StackDefinition,
    snapshot: &'a StateSnapshot,
}

impl AttributeSource for LiveSource<'_> {
    fn physical_id(&self, logical_id: &str) -> Lookup {
        match self.snapshot.get(logical_id) {
            Some(record) => Lookup::Known(Value::String(record.physical_id.clone())),
            None if self.definition.graph.contains(logical_id) => Lookup::Unknown,
            None => Lookup::Missing,
        }
    }

    fn attribute(&self, logical_id: &str, attribute: &str) -> Lookup {
        match self.snapshot.get(logical_id) {
            Some(record) => record
                .attributes
                .get(attribute)
                .map_or(Lookup::Missing, |value| Lookup::Known(value.clone())),
            None if self.definition.graph.contains(logical_id) => Lookup::Unknown,
            None => Lookup::Missing,
        }
    }
}

/// Fields of the record a worker writes back
struct Identity {
    logical_id: String,
    resource_type: String,
    dependencies: BTreeSet<String>,
    deletion_policy: DeletionPolicy,
}

impl Identity {
    fn record(self, physical_id: String, properties: Properties, attributes: Properties) -> ResourceRecord {
        ResourceRecord {
            logical_id: self.logical_id,
            resource_type: self.resource_type,
            physical_id,
            properties,
            attributes,
            dependencies: self.dependencies,
            deletion_policy: self.deletion_policy,
            updated_at: Utc::now(),
        }
    }
}

/// A provider call prepared on the coordinator, owned by a worker
enum Job {
    Create {
        provider: Arc<dyn ResourceProvider>,
        properties: Properties,
    },
    Update {
        provider: Arc<dyn ResourceProvider>,
        previous: ResourceRecord,
        /// What the resource looks like now: read back when the plan was
        /// refreshed, otherwise as last applied
        base: Properties,
        properties: Properties,
    },
    Replace {
        provider: Arc<dyn ResourceProvider>,
        previous: ResourceRecord,
        previous_provider: Arc<dyn ResourceProvider>,
        properties: Properties,
    },
    Delete {
        provider: Arc<dyn ResourceProvider>,
        physical_id: String,
    },
}

struct Work {
    identity: Identity,
    job: Job,
}

/// What a finished job asks the coordinator to persist
enum Change {
    Put(ResourceRecord),
    Removed,
}

type JobResult = std::result::Result<Change, String>;

impl Work {
    fn run(self) -> JobResult {
        let Work { identity, job } = self;
        match job {
            Job::Create {
                provider,
                properties,
            } => {
                let created = provider
                    .create(&identity.logical_id, &properties)
                    .map_err(|e| e.to_string())?;
                Ok(Change::Put(identity.record(
                    created.physical_id,
                    properties,
                    created.attributes,
                )))
            }
            Job::Update {
                provider,
                previous,
                base,
                properties,
            } => {
                let mut changes = diff_properties(&base, &known(&properties));
                if changes.is_empty() {
                    // Unknowns resolved to what is already there
                    log::debug!("{} needs no provider call", identity.logical_id);
                    return Ok(Change::Put(identity.record(
                        previous.physical_id,
                        properties,
                        previous.attributes,
                    )));
                }
                for change in &mut changes {
                    change.requires_replacement =
                        provider.update_policy(&change.property) == UpdatePolicy::Replace;
                }
                let refreshed = provider
                    .update(&previous.physical_id, &changes, &properties)
                    .map_err(|e| e.to_string())?;
                let mut attributes = previous.attributes;
                attributes.extend(refreshed);
                Ok(Change::Put(identity.record(
                    previous.physical_id,
                    properties,
                    attributes,
                )))
            }
            Job::Replace {
                provider,
                previous,
                previous_provider,
                properties,
            } => {
                if previous.deletion_policy == DeletionPolicy::Retain {
                    log::info!(
                        "Retaining {} ({}) while replacing it",
                        identity.logical_id,
                        previous.physical_id
                    );
                } else {
                    delete_physical(previous_provider.as_ref(), &previous.physical_id)?;
                }
                let created = provider
                    .create(&identity.logical_id, &properties)
                    .map_err(|e| e.to_string())?;
                Ok(Change::Put(identity.record(
                    created.physical_id,
                    properties,
                    created.attributes,
                )))
            }
            Job::Delete {
                provider,
                physical_id,
            } => {
                delete_physical(provider.as_ref(), &physical_id)?;
                Ok(Change::Removed)
            }
        }
    }
}

/// Delete a physical resource, treating "already gone" as success
fn delete_physical(provider: &dyn ResourceProvider, physical_id: &str) -> std::result::Result<(), String> {
    match provider.delete(physical_id) {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            log::debug!("{physical_id} was already gone");
            Ok(())
        }
        Err(e) => Err(e.to_string()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .map_or_else(
            || "provider panicked".to_string(),
            |message| format!("provider panicked: {message}"),
        )
}

enum Readiness {
    Ready,
    Waiting,
    /// A dependency failed or was skipped
    Blocked(String),
}

/// What the coordinator does with a dispatchable entry
enum Prepared {
    Work(Work),
    /// Drop the record from state without calling a provider
    Forget,
}

struct Coordinator<'a, P: ?Sized> {
    plan: &'a Plan,
    ctx: &'a ExecutionContext<'a>,
    snapshot: &'a mut StateSnapshot,
    guard: &'a mut LockGuard,
    progress: &'a mut P,
    index: BTreeMap<&'a str, usize>,
    states: Vec<EntryState>,
    report: ApplyReport,
    fatal: Option<Error>,
}

impl<P: ProgressCallback + ?Sized> Coordinator<'_, P> {
    fn settle(&mut self, i: usize, state: EntryState, status: OutcomeStatus) {
        let entry = &self.plan.entries[i];
        self.states[i] = state;
        let outcome = ApplyOutcome {
            logical_id: entry.logical_id.clone(),
            action: entry.action,
            status,
        };
        self.progress.on_resource_complete(&outcome);
        self.report.record(outcome);
    }

    fn fail(&mut self, i: usize, error: String) {
        log::error!("{} failed: {}", self.plan.entries[i].logical_id, error);
        self.settle(i, EntryState::Failed, OutcomeStatus::Failed { error });
    }

    fn skip(&mut self, i: usize, reason: String) {
        log::debug!("Skipping {}: {}", self.plan.entries[i].logical_id, reason);
        self.settle(i, EntryState::Skipped, OutcomeStatus::Skipped { reason });
    }

    fn readiness(&self, entry: &PlanEntry) -> Readiness {
        let mut waiting = false;
        for dependency in &entry.dependencies {
            // Dependencies outside the plan are already satisfied.
            let Some(&j) = self.index.get(dependency.as_str()) else {
                continue;
            };
            match self.states[j] {
                EntryState::Done => {}
                EntryState::Failed | EntryState::Skipped => {
                    return Readiness::Blocked(dependency.clone());
                }
                EntryState::Pending | EntryState::Running => waiting = true,
            }
        }
        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    fn provider(&self, resource_type: &str) -> std::result::Result<Arc<dyn ResourceProvider>, String> {
        self.ctx
            .providers
            .get(resource_type)
            .ok_or_else(|| format!("no provider registered for type '{resource_type}'"))
    }

    fn prepare(&self, entry: &PlanEntry) -> std::result::Result<Prepared, String> {
        let identity = Identity {
            logical_id: entry.logical_id.clone(),
            resource_type: entry.resource_type.clone(),
            dependencies: entry.dependencies.clone(),
            deletion_policy: entry.deletion_policy,
        };
        let source = LiveSource {
            definition: self.ctx.definition,
            snapshot: &*self.snapshot,
        };
        let previous = || {
            self.snapshot
                .get(&entry.logical_id)
                .cloned()
                .ok_or_else(|| format!("no recorded state for {}", entry.logical_id))
        };
        let properties = || {
            self.ctx
                .definition
                .concrete_properties(&entry.logical_id, &source)
                .map_err(|e| e.to_string())
        };

        let job = match entry.action {
            Action::NoOp => return Err("nothing to apply".to_string()),
            Action::Create => Job::Create {
                provider: self.provider(&entry.resource_type)?,
                properties: properties()?,
            },
            Action::Update => {
                let previous = previous()?;
                let base = self
                    .plan
                    .drift
                    .as_ref()
                    .and_then(|drift| drift.get(&entry.logical_id))
                    .and_then(|drift| drift.actual.clone())
                    .unwrap_or_else(|| previous.properties.clone());
                Job::Update {
                    provider: self.provider(&entry.resource_type)?,
                    previous,
                    base,
                    properties: properties()?,
                }
            }
            Action::Replace => {
                let previous = previous()?;
                Job::Replace {
                    provider: self.provider(&entry.resource_type)?,
                    previous_provider: self.provider(&previous.resource_type)?,
                    previous,
                    properties: properties()?,
                }
            }
            Action::Delete { retained: true } => return Ok(Prepared::Forget),
            Action::Delete { retained: false } => match self.snapshot.get(&entry.logical_id) {
                Some(record) => Job::Delete {
                    provider: self.provider(&record.resource_type)?,
                    physical_id: record.physical_id.clone(),
                },
                None => return Ok(Prepared::Forget),
            },
        };
        Ok(Prepared::Work(Work { identity, job }))
    }

    /// Persist a change and mark the entry done
    fn persist(&mut self, i: usize, change: Change) {
        let plan = self.plan;
        let logical_id = &plan.entries[i].logical_id;
        let written = match change {
            Change::Put(record) => self.ctx.store.put_resource(self.snapshot, record, self.guard),
            Change::Removed => self
                .ctx
                .store
                .remove_resource(self.snapshot, logical_id, self.guard)
                .map(|_| ()),
        };
        match written {
            Ok(()) => self.settle(i, EntryState::Done, OutcomeStatus::Succeeded),
            Err(e) => {
                log::error!("Could not record {logical_id}: {e}");
                self.fatal = Some(e.into());
            }
        }
    }

    /// Skip everything not yet started
    fn cancel_pending(&mut self) {
        for i in 0..self.states.len() {
            if self.states[i] == EntryState::Pending {
                self.skip(i, "cancelled".to_string());
            }
        }
    }
}

/// Apply a plan
///
/// Returns `Err` only for errors that make further progress unsafe: state
/// writes that fail or a lost lock. Provider failures are reported per
/// entry in the returned report and skip the entry's dependents.
pub fn execute<P: ProgressCallback + ?Sized>(
    plan: &Plan,
    ctx: &ExecutionContext<'_>,
    snapshot: &mut StateSnapshot,
    guard: &mut LockGuard,
    options: &ApplyOptions,
    progress: &mut P,
) -> Result<ApplyReport> {
    let jobs = options.jobs.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .thread_name(|i| format!("apply-worker-{i}"))
        .build()?;
    let (tx, rx) = mpsc::channel::<(usize, JobResult)>();

    let mut co = Coordinator {
        plan,
        ctx,
        snapshot,
        guard,
        progress,
        index: plan
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.logical_id.as_str(), i))
            .collect(),
        states: vec![EntryState::Pending; plan.entries.len()],
        report: ApplyReport::default(),
        fatal: None,
    };

    co.progress.on_apply_start(plan.summary.total_changes());
    for (i, entry) in plan.entries.iter().enumerate() {
        if !entry.action.is_change() {
            co.settle(i, EntryState::Done, OutcomeStatus::Unchanged);
        }
    }

    let mut in_flight = 0usize;
    loop {
        let mut progressed = false;

        if co.fatal.is_none() && options.cancel.is_cancelled() {
            if !co.report.cancelled {
                log::warn!("Apply cancelled; waiting for {in_flight} call(s) in flight");
                co.report.cancelled = true;
            }
            co.cancel_pending();
        } else if co.fatal.is_none() {
            for (i, entry) in plan.entries.iter().enumerate() {
                if co.states[i] != EntryState::Pending || co.fatal.is_some() {
                    continue;
                }
                match co.readiness(entry) {
                    Readiness::Waiting => continue,
                    Readiness::Blocked(dependency) => {
                        co.skip(i, format!("dependency {dependency} did not complete"));
                        progressed = true;
                        continue;
                    }
                    Readiness::Ready if in_flight >= jobs => continue,
                    Readiness::Ready => {}
                }

                progressed = true;
                co.progress.on_resource_start(entry);
                match co.prepare(entry) {
                    Err(error) => co.fail(i, error),
                    Ok(Prepared::Forget) => {
                        log::info!("Removing {} from state without deleting it", entry.logical_id);
                        co.persist(i, Change::Removed);
                    }
                    Ok(Prepared::Work(work)) => {
                        log::debug!("Dispatching {} {}", entry.action, entry.logical_id);
                        co.states[i] = EntryState::Running;
                        in_flight += 1;
                        let tx = tx.clone();
                        pool.spawn(move || {
                            let result = catch_unwind(AssertUnwindSafe(|| work.run()))
                                .unwrap_or_else(|payload| Err(panic_message(payload.as_ref())));
                            // The coordinator only stops listening once nothing is in flight.
                            let _ = tx.send((i, result));
                        });
                    }
                }
            }
        }

        if in_flight == 0 {
            if co.fatal.is_none() && progressed && co.states.contains(&EntryState::Pending) {
                continue;
            }
            break;
        }

        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((i, result)) => {
                in_flight -= 1;
                if co.fatal.is_some() {
                    log::debug!(
                        "Discarding result for {} after a fatal error",
                        plan.entries[i].logical_id
                    );
                } else {
                    match result {
                        Ok(change) => co.persist(i, change),
                        Err(error) => co.fail(i, error),
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if co.fatal.is_none() && co.guard.should_refresh(Utc::now()) {
            if let Err(e) = co.ctx.locks.refresh(co.guard) {
                log::error!("Could not refresh lock: {e}");
                co.fatal = Some(e.into());
            }
        }
    }

    if let Some(err) = co.fatal.take() {
        return Err(err);
    }
    for i in 0..co.states.len() {
        if co.states[i] == EntryState::Pending {
            co.skip(i, "dependencies never completed".to_string());
        }
    }

    let source = LiveSource {
        definition: ctx.definition,
        snapshot: &*co.snapshot,
    };
    co.report.outputs = ctx.definition.resolve_outputs(&source);

    if co.report.summary.is_success() && !co.report.cancelled {
        let serial = co.snapshot.meta().map_or(0, |m| m.serial) + 1;
        let meta = StackMeta {
            serial,
            template_digest: ctx.definition.digest.clone(),
            outputs: co.report.outputs.clone(),
            last_applied_at: Utc::now(),
        };
        ctx.store.put_meta(co.snapshot, meta, co.guard)?;
        log::info!("Stack '{}' is at serial {serial}", plan.stack);
    } else {
        log::warn!("Apply of '{}' did not complete; stack metadata unchanged", plan.stack);
    }

    co.progress.on_apply_complete(&co.report.summary);
    Ok(co.report)
}
