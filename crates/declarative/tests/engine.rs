//! End-to-end tests: template to plan to apply against a state backend

use declarative::{
    Action, ApplyOptions, ApplyRun, AutoConfirm, AutoDecline, CancelToken, CreatedResource,
    DriftStatus,
    Engine, EngineSettings, Error, ErrorCategory, NoProgress, OutcomeStatus, ParameterInputs,
    PlanOptions, Properties, PropertyChange, ProviderError, ProviderRegistry, ResolutionError,
    ResourceProvider, Template, TemplateFormat, UpdatePolicy,
};
use serde_json::{Value, json};
use statestore::{
    MemoryBackend, Record, RetryConfig, SqliteBackend, StateBackend, StateStore, WriteCondition,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-memory stand-in for a cloud API
#[derive(Default)]
struct Cloud {
    resources: Mutex<BTreeMap<String, Properties>>,
    calls: Mutex<Vec<String>>,
    failing: Mutex<BTreeSet<String>>,
    /// Property names of every diff passed to `update`, by physical id
    diffs: Mutex<Vec<(String, Vec<String>)>>,
    /// Cancel the run once this resource has been created
    cancel_after: Mutex<Option<(String, CancelToken)>>,
    next_id: AtomicU64,
}

impl Cloud {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn fail(&self, logical_id: &str) {
        self.failing.lock().unwrap().insert(logical_id.to_string());
    }

    fn set(&self, physical_id: &str, properties: Properties) {
        self.resources
            .lock()
            .unwrap()
            .insert(physical_id.to_string(), properties);
    }

    fn remove(&self, physical_id: &str) {
        self.resources.lock().unwrap().remove(physical_id);
    }

    fn get(&self, physical_id: &str) -> Properties {
        self.resources.lock().unwrap()[physical_id].clone()
    }
}

/// Provider for one type backed by the shared [`Cloud`]
struct CloudProvider {
    resource_type: &'static str,
    cloud: Arc<Cloud>,
}

impl CloudProvider {
    /// `Arn` plus `Name`, when the resource has one
    fn attributes(&self, physical_id: &str, properties: &Properties) -> Properties {
        let mut attributes = BTreeMap::from([(
            "Arn".to_string(),
            json!(format!("local:{}:{physical_id}", self.resource_type)),
        )]);
        if let Some(name) = properties.get("Name") {
            attributes.insert("Name".to_string(), name.clone());
        }
        attributes
    }
}

impl ResourceProvider for CloudProvider {
    fn resource_type(&self) -> &str {
        self.resource_type
    }

    fn describe(&self, physical_id: &str) -> Result<Properties, ProviderError> {
        self.cloud
            .resources
            .lock()
            .unwrap()
            .get(physical_id)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(physical_id))
    }

    fn create(&self, logical_id: &str, properties: &Properties) -> Result<CreatedResource, ProviderError> {
        self.cloud.calls.lock().unwrap().push(format!("create {logical_id}"));
        if self.cloud.failing.lock().unwrap().contains(logical_id) {
            return Err(ProviderError::failed(format!("{logical_id} refused")));
        }
        let n = self.cloud.next_id.fetch_add(1, Ordering::SeqCst);
        let physical_id = format!("{}-{n}", logical_id.to_lowercase());
        self.cloud.set(&physical_id, properties.clone());
        if let Some((id, cancel)) = &*self.cloud.cancel_after.lock().unwrap()
            && id == logical_id
        {
            cancel.cancel();
        }
        Ok(CreatedResource {
            attributes: self.attributes(&physical_id, properties),
            physical_id,
        })
    }

    fn update(
        &self,
        physical_id: &str,
        changes: &[PropertyChange],
        desired: &Properties,
    ) -> Result<Properties, ProviderError> {
        self.cloud.calls.lock().unwrap().push(format!("update {physical_id}"));
        self.cloud.diffs.lock().unwrap().push((
            physical_id.to_string(),
            changes.iter().map(|c| c.property.clone()).collect(),
        ));
        self.cloud.set(physical_id, desired.clone());
        Ok(self.attributes(physical_id, desired))
    }

    fn delete(&self, physical_id: &str) -> Result<(), ProviderError> {
        self.cloud.calls.lock().unwrap().push(format!("delete {physical_id}"));
        self.cloud.remove(physical_id);
        Ok(())
    }

    fn update_policy(&self, property: &str) -> UpdatePolicy {
        if property == "KeySchema" {
            UpdatePolicy::Replace
        } else {
            UpdatePolicy::InPlace
        }
    }
}

fn registry(cloud: &Arc<Cloud>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for resource_type in ["Storage::Bucket", "Storage::Table", "Access::Policy"] {
        registry.register(Arc::new(CloudProvider {
            resource_type,
            cloud: Arc::clone(cloud),
        }));
    }
    registry
}

fn engine_on(backend: Arc<dyn StateBackend>, cloud: &Arc<Cloud>) -> Engine {
    let mut settings = EngineSettings::new("demo");
    settings.retry = RetryConfig::no_retry();
    Engine::new(backend, registry(cloud), settings)
}

fn engine(cloud: &Arc<Cloud>) -> Engine {
    engine_on(Arc::new(MemoryBackend::new()), cloud)
}

fn template(value: &Value) -> Template {
    Template::parse(&value.to_string(), TemplateFormat::Json).unwrap()
}

fn app() -> Value {
    json!({
        "Parameters": {
            "Env": {"Type": "Enum", "AllowedValues": ["dev", "prod"], "Default": "dev"}
        },
        "Conditions": {
            "IsProd": {"Fn::Equals": [{"Ref": "Env"}, "prod"]}
        },
        "Resources": {
            "Bucket": {
                "Type": "Storage::Bucket",
                "Properties": {"Name": {"Fn::Sub": "${Stack::Name}-${Env}-logs"}}
            },
            "Table": {
                "Type": "Storage::Table",
                "Properties": {"KeySchema": "id"}
            },
            "Policy": {
                "Type": "Access::Policy",
                "Properties": {
                    "Resources": [
                        {"Fn::GetAtt": ["Bucket", "Arn"]},
                        {"Fn::GetAtt": "Table.Arn"}
                    ]
                }
            },
            "Replica": {
                "Type": "Storage::Bucket",
                "Condition": "IsProd",
                "Properties": {"Source": {"Ref": "Bucket"}}
            }
        },
        "Outputs": {
            "BucketArn": {"Value": {"Fn::GetAtt": ["Bucket", "Arn"]}},
            "ReplicaId": {"Value": {"Ref": "Replica"}, "Condition": "IsProd"}
        }
    })
}

fn apply(engine: &Engine, value: &Value, inputs: &ParameterInputs) -> ApplyRun {
    let definition = engine.build(&template(value), inputs).unwrap();
    engine
        .apply(&definition, &ApplyOptions::default(), &mut AutoConfirm, &mut NoProgress)
        .unwrap()
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call} not in {calls:?}"))
}

#[test]
fn test_plan_is_deterministic() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    let inputs = ParameterInputs::new();

    let first = engine
        .plan(&engine.build(&template(&app()), &inputs).unwrap(), &PlanOptions::default())
        .unwrap();
    let second = engine
        .plan(&engine.build(&template(&app()), &inputs).unwrap(), &PlanOptions::default())
        .unwrap();

    let ids = |plan: &declarative::Plan| {
        plan.entries
            .iter()
            .map(|e| e.logical_id.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(first.digest, second.digest);
    assert_eq!(
        serde_json::to_value(&first).unwrap(),
        serde_json::to_value(&second).unwrap()
    );
}

#[test]
fn test_cycle_is_rejected_before_any_provider_call() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    let cyclic = json!({"Resources": {
        "A": {"Type": "Storage::Bucket", "Properties": {"Peer": {"Ref": "B"}}},
        "B": {"Type": "Storage::Bucket", "Properties": {"Peer": {"Ref": "A"}}}
    }});

    let err = engine
        .build(&template(&cyclic), &ParameterInputs::new())
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Resolution(ResolutionError::CyclicDependency { .. })
    ));
    assert!(err.category().is_side_effect_free());
    assert!(cloud.calls().is_empty());
}

#[test]
fn test_unregistered_type_fails_validation() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    let err = engine
        .build(
            &template(&json!({"Resources": {"Q": {"Type": "Messaging::Queue"}}})),
            &ParameterInputs::new(),
        )
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
}

#[test]
fn test_apply_orders_policy_after_its_targets() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);

    let run = apply(&engine, &app(), &ParameterInputs::new());
    let report = run.report().unwrap();
    assert!(report.summary.is_success());
    assert_eq!(report.summary.succeeded, 3);

    let calls = cloud.calls();
    let policy = position(&calls, "create Policy");
    assert!(position(&calls, "create Bucket") < policy);
    assert!(position(&calls, "create Table") < policy);
    assert!(!calls.iter().any(|c| c == "create Replica"));

    let snapshot = engine.snapshot().unwrap();
    let policy = snapshot.get("Policy").unwrap();
    let bucket = snapshot.get("Bucket").unwrap();
    assert_eq!(
        policy.properties["Resources"][0],
        bucket.attributes["Arn"]
    );
    assert_eq!(bucket.properties["Name"], json!("demo-dev-logs"));
    assert_eq!(
        policy.dependencies,
        BTreeSet::from(["Bucket".to_string(), "Table".to_string()])
    );
    assert_eq!(report.outputs["BucketArn"], bucket.attributes["Arn"]);
    assert!(!report.outputs.contains_key("ReplicaId"));
}

#[test]
fn test_second_apply_has_no_changes() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    apply(&engine, &app(), &ParameterInputs::new());
    let calls = cloud.calls().len();

    let run = apply(&engine, &app(), &ParameterInputs::new());
    assert!(matches!(run, ApplyRun::NoChanges(_)));
    assert!(run.plan().entries.iter().all(|e| e.action == Action::NoOp));
    assert_eq!(cloud.calls().len(), calls);

    let meta = engine.snapshot().unwrap();
    assert_eq!(meta.meta().unwrap().serial, 1);
}

#[test]
fn test_parameter_change_flows_through_conditions() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    apply(&engine, &app(), &ParameterInputs::new());

    let prod = ParameterInputs::from([("Env".to_string(), json!("prod"))]);
    let run = apply(&engine, &app(), &prod);
    let plan = run.plan();
    assert_eq!(plan.get("Bucket").unwrap().action, Action::Update);
    assert_eq!(plan.get("Replica").unwrap().action, Action::Create);
    assert_eq!(plan.get("Table").unwrap().action, Action::NoOp);

    let snapshot = engine.snapshot().unwrap();
    assert_eq!(
        snapshot.get("Replica").unwrap().properties["Source"],
        json!(snapshot.get("Bucket").unwrap().physical_id)
    );
    assert_eq!(snapshot.meta().unwrap().serial, 2);
    assert!(run.report().unwrap().outputs.contains_key("ReplicaId"));
}

#[test]
fn test_failure_is_isolated_to_dependents() {
    let cloud = Arc::new(Cloud::default());
    cloud.fail("Table");
    let engine = engine(&cloud);

    let run = apply(&engine, &app(), &ParameterInputs::new());
    let report = run.report().unwrap();
    assert!(report.outcome("Bucket").unwrap().status.is_success());
    assert!(matches!(
        report.outcome("Table").unwrap().status,
        OutcomeStatus::Failed { .. }
    ));
    assert!(matches!(
        report.outcome("Policy").unwrap().status,
        OutcomeStatus::Skipped { .. }
    ));
    assert!(!cloud.calls().iter().any(|c| c == "create Policy"));

    // The successful create is recorded and is not repeated on the next run.
    cloud.failing.lock().unwrap().clear();
    let retry = apply(&engine, &app(), &ParameterInputs::new());
    assert_eq!(retry.plan().get("Bucket").unwrap().action, Action::NoOp);
    assert!(retry.report().unwrap().summary.is_success());
}

#[test]
fn test_replacement_updates_dependents() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    apply(&engine, &app(), &ParameterInputs::new());
    let old_table = engine.snapshot().unwrap().get("Table").unwrap().physical_id.clone();

    let mut changed = app();
    changed["Resources"]["Table"]["Properties"]["KeySchema"] = json!("pk");
    let run = apply(&engine, &changed, &ParameterInputs::new());

    let plan = run.plan();
    assert_eq!(plan.get("Table").unwrap().action, Action::Replace);
    assert_eq!(plan.get("Policy").unwrap().action, Action::Update);
    assert!(run.report().unwrap().summary.is_success());

    let calls = cloud.calls();
    assert!(position(&calls, &format!("delete {old_table}")) < calls.len() - 1);
    assert_eq!(calls.last().unwrap(), &format!("update {}", engine.snapshot().unwrap().get("Policy").unwrap().physical_id));
    let snapshot = engine.snapshot().unwrap();
    let table = snapshot.get("Table").unwrap();
    assert_ne!(table.physical_id, old_table);
    assert_eq!(
        snapshot.get("Policy").unwrap().properties["Resources"][1],
        table.attributes["Arn"]
    );
}

#[test]
fn test_removed_resources_delete_in_reverse_order() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    apply(&engine, &app(), &ParameterInputs::new());
    let snapshot = engine.snapshot().unwrap();
    let policy = snapshot.get("Policy").unwrap().physical_id.clone();
    let bucket = snapshot.get("Bucket").unwrap().physical_id.clone();

    let run = engine
        .destroy(&ApplyOptions::default(), &mut AutoConfirm, &mut NoProgress)
        .unwrap();
    assert_eq!(run.plan().summary.delete, 3);

    let calls = cloud.calls();
    assert!(position(&calls, &format!("delete {policy}")) < position(&calls, &format!("delete {bucket}")));
    assert!(engine.snapshot().unwrap().is_empty());
    assert!(cloud.resources.lock().unwrap().is_empty());
}

#[test]
fn test_retained_resource_is_never_deleted() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    let kept = json!({"Resources": {
        "Archive": {"Type": "Storage::Bucket", "DeletionPolicy": "Retain"}
    }});
    apply(&engine, &kept, &ParameterInputs::new());

    let run = apply(&engine, &json!({}), &ParameterInputs::new());
    assert_eq!(
        run.plan().get("Archive").unwrap().action,
        Action::Delete { retained: true }
    );
    assert!(run.report().unwrap().summary.is_success());
    assert!(!cloud.calls().iter().any(|c| c.starts_with("delete")));
    assert_eq!(cloud.resources.lock().unwrap().len(), 1);
    assert!(engine.snapshot().unwrap().is_empty());
}

#[test]
fn test_declined_plan_changes_nothing() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    let definition = engine.build(&template(&app()), &ParameterInputs::new()).unwrap();

    let run = engine
        .apply(&definition, &ApplyOptions::default(), &mut AutoDecline, &mut NoProgress)
        .unwrap();
    assert!(matches!(run, ApplyRun::Declined(_)));
    assert!(cloud.calls().is_empty());
    assert!(engine.snapshot().unwrap().is_empty());
    assert!(engine.lock_holder().unwrap().is_none());
}

#[test]
fn test_held_lock_blocks_other_runs() {
    let cloud = Arc::new(Cloud::default());
    let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
    let engine = engine_on(Arc::clone(&backend), &cloud);

    let other = StateStore::new(Arc::clone(&backend), "demo").lock_manager(chrono::Duration::seconds(60));
    let guard = other.acquire("someone-else", "apply").unwrap();

    let definition = engine.build(&template(&app()), &ParameterInputs::new()).unwrap();
    let err = engine.plan(&definition, &PlanOptions::default()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Lock);
    assert!(err.to_string().contains("someone-else"));

    // Only one of two racing acquirers wins.
    let second = other.acquire("third", "plan");
    assert!(second.is_err());

    other.release(guard).unwrap();
    engine.plan(&definition, &PlanOptions::default()).unwrap();
}

#[test]
fn test_force_unlock_clears_a_stale_lock() {
    let cloud = Arc::new(Cloud::default());
    let backend: Arc<dyn StateBackend> = Arc::new(MemoryBackend::new());
    let engine = engine_on(Arc::clone(&backend), &cloud);
    let crashed = StateStore::new(backend, "demo").lock_manager(chrono::Duration::seconds(60));
    let guard = crashed.acquire("crashed", "apply").unwrap();

    let holder = engine.lock_holder().unwrap().unwrap();
    assert_eq!(holder.holder, "crashed");
    engine.force_unlock(guard.token()).unwrap();
    assert!(engine.lock_holder().unwrap().is_none());
}

#[test]
fn test_drift_and_refresh() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    apply(&engine, &app(), &ParameterInputs::new());
    let snapshot = engine.snapshot().unwrap();
    let bucket = snapshot.get("Bucket").unwrap().physical_id.clone();
    let table = snapshot.get("Table").unwrap().physical_id.clone();

    cloud.set(&bucket, BTreeMap::from([("Name".to_string(), json!("renamed"))]));
    cloud.remove(&table);

    let report = engine.drift().unwrap();
    assert!(matches!(
        report.get("Bucket").unwrap().status,
        DriftStatus::Modified { .. }
    ));
    assert_eq!(report.get("Table").unwrap().status, DriftStatus::Deleted);
    assert_eq!(report.get("Policy").unwrap().status, DriftStatus::InSync);

    let definition = engine.build(&template(&app()), &ParameterInputs::new()).unwrap();
    let refreshed = engine
        .plan(&definition, &PlanOptions { refresh: true })
        .unwrap();
    assert_eq!(refreshed.get("Bucket").unwrap().action, Action::Update);
    assert_eq!(refreshed.get("Table").unwrap().action, Action::Create);
    assert_eq!(refreshed.get("Policy").unwrap().action, Action::Update);
}

#[test]
fn test_state_survives_a_new_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let cloud = Arc::new(Cloud::default());

    {
        let backend = Arc::new(SqliteBackend::open(&path).unwrap());
        let engine = engine_on(backend, &cloud);
        apply(&engine, &app(), &ParameterInputs::new());
    }

    let backend = Arc::new(SqliteBackend::open(&path).unwrap());
    let engine = engine_on(backend, &cloud);
    assert_eq!(engine.snapshot().unwrap().len(), 3);
    let run = apply(&engine, &app(), &ParameterInputs::new());
    assert!(matches!(run, ApplyRun::NoChanges(_)));
}

#[test]
fn test_refreshed_update_repairs_drift() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    apply(&engine, &app(), &ParameterInputs::new());
    let snapshot = engine.snapshot().unwrap();
    let bucket = snapshot.get("Bucket").unwrap().physical_id.clone();
    let policy = snapshot.get("Policy").unwrap().physical_id.clone();
    cloud.set(&bucket, BTreeMap::from([("Name".to_string(), json!("renamed"))]));

    let definition = engine.build(&template(&app()), &ParameterInputs::new()).unwrap();
    let options = ApplyOptions {
        refresh: true,
        ..ApplyOptions::default()
    };
    let run = engine
        .apply(&definition, &options, &mut AutoConfirm, &mut NoProgress)
        .unwrap();
    assert_eq!(run.plan().get("Bucket").unwrap().action, Action::Update);
    assert!(run.report().unwrap().summary.is_success());

    // The provider is told what differs from the resource as it is now.
    assert_eq!(
        *cloud.diffs.lock().unwrap(),
        vec![(bucket.clone(), vec!["Name".to_string()])]
    );
    assert_eq!(cloud.get(&bucket)["Name"], json!("demo-dev-logs"));
    assert!(!cloud.calls().contains(&format!("update {policy}")));

    let again = engine.plan(&definition, &PlanOptions { refresh: true }).unwrap();
    assert!(!again.has_changes());
}

#[test]
fn test_dependents_of_updated_attributes_converge() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    let stack = |name: &str| {
        json!({"Resources": {
            "Bucket": {"Type": "Storage::Bucket", "Properties": {"Name": name}},
            "Policy": {
                "Type": "Access::Policy",
                "Properties": {"Target": {"Fn::GetAtt": ["Bucket", "Name"]}}
            }
        }})
    };
    apply(&engine, &stack("one"), &ParameterInputs::new());

    let run = apply(&engine, &stack("two"), &ParameterInputs::new());
    assert_eq!(run.plan().get("Bucket").unwrap().action, Action::Update);
    assert_eq!(run.plan().get("Policy").unwrap().action, Action::Update);
    assert!(run.report().unwrap().summary.is_success());
    assert_eq!(
        engine.snapshot().unwrap().get("Policy").unwrap().properties["Target"],
        json!("two")
    );

    let definition = engine.build(&template(&stack("two")), &ParameterInputs::new()).unwrap();
    let replan = engine.plan(&definition, &PlanOptions::default()).unwrap();
    assert!(replan.entries.iter().all(|e| e.action == Action::NoOp));
}

#[test]
fn test_cancel_mid_apply_keeps_finished_work() {
    let cloud = Arc::new(Cloud::default());
    let engine = engine(&cloud);
    let cancel = CancelToken::new();
    *cloud.cancel_after.lock().unwrap() = Some(("Bucket".to_string(), cancel.clone()));

    let definition = engine.build(&template(&app()), &ParameterInputs::new()).unwrap();
    let options = ApplyOptions {
        jobs: 4,
        cancel,
        ..ApplyOptions::default()
    };
    let run = engine
        .apply(&definition, &options, &mut AutoConfirm, &mut NoProgress)
        .unwrap();
    let report = run.report().unwrap();
    assert!(report.cancelled);

    // Bucket and Table were both in flight when the cancel arrived.
    assert!(report.outcome("Bucket").unwrap().status.is_success());
    assert!(report.outcome("Table").unwrap().status.is_success());
    assert!(matches!(
        report.outcome("Policy").unwrap().status,
        OutcomeStatus::Skipped { .. }
    ));
    assert!(!cloud.calls().iter().any(|c| c == "create Policy"));

    let snapshot = engine.snapshot().unwrap();
    assert!(snapshot.contains("Bucket"));
    assert!(snapshot.contains("Table"));
    assert!(!snapshot.contains("Policy"));
    assert!(snapshot.meta().is_none());
    assert!(engine.lock_holder().unwrap().is_none());
}

/// Memory backend whose lock writes start failing after a set number
struct FailingLockWrites {
    inner: MemoryBackend,
    lock_writes_left: AtomicUsize,
}

impl StateBackend for FailingLockWrites {
    fn get(&self, key: &str) -> statestore::Result<Option<Record>> {
        self.inner.get(key)
    }

    fn list(&self, prefix: &str) -> statestore::Result<Vec<(String, Record)>> {
        self.inner.list(prefix)
    }

    fn put(&self, key: &str, value: &str, condition: WriteCondition<'_>) -> statestore::Result<u64> {
        if key.ends_with("/lock") {
            let left = self.lock_writes_left.load(Ordering::SeqCst);
            if left == 0 {
                return Err(statestore::Error::Io(std::io::Error::other("disk full")));
            }
            self.lock_writes_left.store(left - 1, Ordering::SeqCst);
        }
        self.inner.put(key, value, condition)
    }

    fn remove(&self, key: &str, condition: WriteCondition<'_>) -> statestore::Result<()> {
        self.inner.remove(key, condition)
    }
}

#[test]
fn test_failed_release_is_reported() {
    let cloud = Arc::new(Cloud::default());
    let backend = Arc::new(FailingLockWrites {
        inner: MemoryBackend::new(),
        lock_writes_left: AtomicUsize::new(1),
    });
    let engine = engine_on(backend, &cloud);
    let definition = engine.build(&template(&app()), &ParameterInputs::new()).unwrap();

    let err = engine.plan(&definition, &PlanOptions::default()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Storage);
    assert!(err.to_string().contains("disk full"));
    assert!(engine.lock_holder().unwrap().is_some());
}
