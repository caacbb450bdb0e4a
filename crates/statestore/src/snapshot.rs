//! State snapshot records and the per-stack store
//!
//! Each resource is persisted as its own versioned record so that the apply
//! executor can write one resource at a time. Records are wrapped in an
//! envelope carrying a `format` number; older formats are upgraded on read.

use crate::backend::{Expect, StateBackend, WriteCondition};
use crate::error::{Error, Result};
use crate::lock::{LockGuard, LockManager};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Current record format written by this engine
pub const RECORD_FORMAT: u64 = 2;

/// What happens to a physical resource when it leaves the template
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    /// Delete the physical resource
    #[default]
    Delete,
    /// Keep the physical resource, forget it from state
    Retain,
}

/// Last-applied state of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub logical_id: String,
    pub resource_type: String,
    /// Provider-assigned identifier
    pub physical_id: String,
    /// Properties as last applied
    pub properties: BTreeMap<String, Value>,
    /// Provider-computed attributes (e.g. an ARN)
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Logical ids this resource depended on when applied
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    pub updated_at: DateTime<Utc>,
}

/// Stack-level metadata written at the end of each apply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackMeta {
    /// Number of completed applies
    pub serial: u64,
    /// Digest of the template and parameters last applied
    pub template_digest: String,
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    pub last_applied_at: DateTime<Utc>,
}

/// A value together with the store version it was read or written at
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
}

/// Mapping from logical id to last-applied state
///
/// The snapshot is an explicit value: it is loaded once, passed by
/// reference through planning and applying, and kept in step with the store
/// by [`StateStore`]'s write methods.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    resources: BTreeMap<String, Versioned<ResourceRecord>>,
    meta: Option<Versioned<StackMeta>>,
}

impl StateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, logical_id: &str) -> Option<&ResourceRecord> {
        self.resources.get(logical_id).map(|v| &v.value)
    }

    pub fn version(&self, logical_id: &str) -> Option<u64> {
        self.resources.get(logical_id).map(|v| v.version)
    }

    pub fn contains(&self, logical_id: &str) -> bool {
        self.resources.contains_key(logical_id)
    }

    /// Records in logical id order
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.resources.values().map(|v| &v.value)
    }

    pub fn logical_ids(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn meta(&self) -> Option<&StackMeta> {
        self.meta.as_ref().map(|m| &m.value)
    }

    /// Insert a record at a known store version (used when loading)
    pub fn insert(&mut self, record: ResourceRecord, version: u64) {
        self.resources.insert(
            record.logical_id.clone(),
            Versioned {
                value: record,
                version,
            },
        );
    }

    fn remove(&mut self, logical_id: &str) -> Option<ResourceRecord> {
        self.resources.remove(logical_id).map(|v| v.value)
    }
}

/// Resource record as written by format 1 engines
#[derive(Debug, Deserialize)]
struct ResourceRecordV1 {
    #[serde(rename = "type")]
    resource_type: String,
    id: String,
    #[serde(default)]
    properties: BTreeMap<String, Value>,
    #[serde(default)]
    retain: bool,
}

impl ResourceRecordV1 {
    fn upgrade(self, logical_id: &str) -> ResourceRecord {
        ResourceRecord {
            logical_id: logical_id.to_string(),
            resource_type: self.resource_type,
            physical_id: self.id,
            properties: self.properties,
            attributes: BTreeMap::new(),
            dependencies: BTreeSet::new(),
            deletion_policy: if self.retain {
                DeletionPolicy::Retain
            } else {
                DeletionPolicy::Delete
            },
            updated_at: DateTime::<Utc>::default(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    format: u64,
    #[serde(flatten)]
    body: &'a T,
}

fn encode<T: Serialize>(body: &T) -> Result<String> {
    Ok(serde_json::to_string(&Envelope {
        format: RECORD_FORMAT,
        body,
    })?)
}

fn corrupt(key: &str, e: impl std::fmt::Display) -> Error {
    Error::CorruptRecord {
        key: key.to_string(),
        message: e.to_string(),
    }
}

/// Split a raw record into its format number and body
///
/// Records without a `format` field predate versioning and are format 1.
fn open_envelope(key: &str, raw: &str) -> Result<(u64, Value)> {
    let mut value: Value = serde_json::from_str(raw).map_err(|e| corrupt(key, e))?;
    let format = match value.as_object_mut().and_then(|o| o.remove("format")) {
        Some(f) => f
            .as_u64()
            .ok_or_else(|| corrupt(key, "format is not an integer"))?,
        None => 1,
    };
    Ok((format, value))
}

fn decode_resource(key: &str, logical_id: &str, raw: &str) -> Result<ResourceRecord> {
    let (format, body) = open_envelope(key, raw)?;
    match format {
        1 => {
            let legacy: ResourceRecordV1 =
                serde_json::from_value(body).map_err(|e| corrupt(key, e))?;
            log::debug!("Upgrading format 1 record '{key}'");
            Ok(legacy.upgrade(logical_id))
        }
        RECORD_FORMAT => serde_json::from_value(body).map_err(|e| corrupt(key, e)),
        other => Err(Error::UnsupportedFormat {
            key: key.to_string(),
            format: other,
        }),
    }
}

fn decode_meta(key: &str, raw: &str) -> Result<StackMeta> {
    let (format, body) = open_envelope(key, raw)?;
    if format > RECORD_FORMAT {
        return Err(Error::UnsupportedFormat {
            key: key.to_string(),
            format,
        });
    }
    serde_json::from_value(body).map_err(|e| corrupt(key, e))
}

/// Key layout for one stack
mod keys {
    pub fn root(stack: &str) -> String {
        format!("stacks/{stack}/")
    }

    pub fn lock(stack: &str) -> String {
        format!("stacks/{stack}/lock")
    }

    pub fn meta(stack: &str) -> String {
        format!("stacks/{stack}/meta")
    }

    pub fn resources(stack: &str) -> String {
        format!("stacks/{stack}/resources/")
    }

    pub fn resource(stack: &str, logical_id: &str) -> String {
        format!("stacks/{stack}/resources/{logical_id}")
    }
}

/// Durable state for one stack
#[derive(Clone)]
pub struct StateStore {
    backend: Arc<dyn StateBackend>,
    stack: String,
}

impl StateStore {
    pub fn new(backend: Arc<dyn StateBackend>, stack: impl Into<String>) -> Self {
        Self {
            backend,
            stack: stack.into(),
        }
    }

    pub fn stack(&self) -> &str {
        &self.stack
    }

    /// Lock manager for this stack
    pub fn lock_manager(&self, ttl: Duration) -> LockManager {
        LockManager::new(Arc::clone(&self.backend), keys::lock(&self.stack), ttl)
    }

    /// Load every resource record and the stack metadata
    pub fn load_snapshot(&self) -> Result<StateSnapshot> {
        let prefix = keys::resources(&self.stack);
        let mut snapshot = StateSnapshot::new();

        for (key, record) in self.backend.list(&prefix)? {
            let logical_id = &key[prefix.len()..];
            let resource = decode_resource(&key, logical_id, &record.value)?;
            snapshot.insert(resource, record.version);
        }

        let meta_key = keys::meta(&self.stack);
        if let Some(record) = self.backend.get(&meta_key)? {
            snapshot.meta = Some(Versioned {
                value: decode_meta(&meta_key, &record.value)?,
                version: record.version,
            });
        }

        log::debug!(
            "Loaded {} resource record(s) for stack '{}'",
            snapshot.len(),
            self.stack
        );
        Ok(snapshot)
    }

    /// Persist one resource under the guard's fence
    ///
    /// The write expects the version recorded in `snapshot`, and on success
    /// the snapshot is updated to match the store.
    pub fn put_resource(
        &self,
        snapshot: &mut StateSnapshot,
        record: ResourceRecord,
        guard: &LockGuard,
    ) -> Result<()> {
        let key = keys::resource(&self.stack, &record.logical_id);
        let expect = Expect::from_observed(snapshot.version(&record.logical_id));
        let version = self.backend.put(
            &key,
            &encode(&record)?,
            WriteCondition::fenced(expect, guard.fence()),
        )?;
        snapshot.insert(record, version);
        Ok(())
    }

    /// Remove one resource under the guard's fence
    pub fn remove_resource(
        &self,
        snapshot: &mut StateSnapshot,
        logical_id: &str,
        guard: &LockGuard,
    ) -> Result<Option<ResourceRecord>> {
        let Some(version) = snapshot.version(logical_id) else {
            return Ok(None);
        };
        let key = keys::resource(&self.stack, logical_id);
        self.backend.remove(
            &key,
            WriteCondition::fenced(Expect::Version(version), guard.fence()),
        )?;
        Ok(snapshot.remove(logical_id))
    }

    /// Persist stack metadata under the guard's fence
    pub fn put_meta(
        &self,
        snapshot: &mut StateSnapshot,
        meta: StackMeta,
        guard: &LockGuard,
    ) -> Result<()> {
        let key = keys::meta(&self.stack);
        let expect = Expect::from_observed(snapshot.meta.as_ref().map(|m| m.version));
        let version = self.backend.put(
            &key,
            &encode(&meta)?,
            WriteCondition::fenced(expect, guard.fence()),
        )?;
        snapshot.meta = Some(Versioned {
            value: meta,
            version,
        });
        Ok(())
    }

    /// Whether anything at all is stored for this stack
    pub fn exists(&self) -> Result<bool> {
        Ok(!self.backend.list(&keys::root(&self.stack))?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    fn record(id: &str) -> ResourceRecord {
        ResourceRecord {
            logical_id: id.to_string(),
            resource_type: "Storage::Bucket".to_string(),
            physical_id: format!("{}-1", id.to_lowercase()),
            properties: BTreeMap::from([("Name".to_string(), json!("logs"))]),
            attributes: BTreeMap::from([("Arn".to_string(), json!("arn:bucket"))]),
            dependencies: BTreeSet::new(),
            deletion_policy: DeletionPolicy::Retain,
            updated_at: Utc::now(),
        }
    }

    fn store() -> (StateStore, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        (StateStore::new(backend.clone(), "demo"), backend)
    }

    #[test]
    fn test_put_and_load() {
        let (store, _) = store();
        let locks = store.lock_manager(Duration::minutes(5));
        let guard = locks.acquire("me", "apply").unwrap();

        let mut snapshot = store.load_snapshot().unwrap();
        assert!(snapshot.is_empty());
        store
            .put_resource(&mut snapshot, record("Bucket"), &guard)
            .unwrap();
        assert_eq!(snapshot.version("Bucket"), Some(1));

        let loaded = store.load_snapshot().unwrap();
        assert_eq!(loaded.get("Bucket"), snapshot.get("Bucket"));
        assert_eq!(loaded.version("Bucket"), Some(1));
    }

    #[test]
    fn test_write_after_lock_loss_is_rejected() {
        let (store, _) = store();
        let locks = store.lock_manager(Duration::zero());
        let stale = locks.acquire("crashed", "apply").unwrap();
        let _fresh = locks.acquire("rescuer", "apply").unwrap();

        let mut snapshot = StateSnapshot::new();
        let err = store
            .put_resource(&mut snapshot, record("Bucket"), &stale)
            .unwrap_err();
        assert!(err.is_lock_loss());
        assert!(snapshot.is_empty());
        assert!(store.load_snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_stale_snapshot_version_conflicts() {
        let (store, _) = store();
        let locks = store.lock_manager(Duration::minutes(5));
        let guard = locks.acquire("me", "apply").unwrap();

        let mut first = StateSnapshot::new();
        store.put_resource(&mut first, record("Bucket"), &guard).unwrap();

        // A snapshot that never saw the first write expects no record.
        let mut stale = StateSnapshot::new();
        let err = store
            .put_resource(&mut stale, record("Bucket"), &guard)
            .unwrap_err();
        assert!(matches!(err, Error::OptimisticLockConflict { .. }));
    }

    #[test]
    fn test_remove_resource() {
        let (store, _) = store();
        let locks = store.lock_manager(Duration::minutes(5));
        let guard = locks.acquire("me", "apply").unwrap();
        let mut snapshot = StateSnapshot::new();
        store
            .put_resource(&mut snapshot, record("Bucket"), &guard)
            .unwrap();

        let removed = store
            .remove_resource(&mut snapshot, "Bucket", &guard)
            .unwrap();
        assert!(removed.is_some());
        assert!(store.load_snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_format_one_records_are_upgraded() {
        let (store, backend) = store();
        let legacy = json!({
            "type": "Storage::Bucket",
            "id": "logs-bucket",
            "properties": {"Name": "logs"},
            "retain": true
        });
        backend
            .put(
                "stacks/demo/resources/Bucket",
                &legacy.to_string(),
                WriteCondition::new(Expect::Absent),
            )
            .unwrap();

        let snapshot = store.load_snapshot().unwrap();
        let record = snapshot.get("Bucket").unwrap();
        assert_eq!(record.physical_id, "logs-bucket");
        assert_eq!(record.deletion_policy, DeletionPolicy::Retain);
        assert!(record.attributes.is_empty());
    }

    #[test]
    fn test_future_format_is_rejected() {
        let (store, backend) = store();
        backend
            .put(
                "stacks/demo/resources/Bucket",
                r#"{"format": 99}"#,
                WriteCondition::new(Expect::Absent),
            )
            .unwrap();
        assert!(matches!(
            store.load_snapshot().unwrap_err(),
            Error::UnsupportedFormat { format: 99, .. }
        ));
    }

    #[test]
    fn test_meta_roundtrip() {
        let (store, _) = store();
        let locks = store.lock_manager(Duration::minutes(5));
        let guard = locks.acquire("me", "apply").unwrap();
        let mut snapshot = StateSnapshot::new();

        let meta = StackMeta {
            serial: 1,
            template_digest: "abc".to_string(),
            outputs: BTreeMap::from([("BucketArn".to_string(), json!("arn:bucket"))]),
            last_applied_at: Utc::now(),
        };
        store.put_meta(&mut snapshot, meta.clone(), &guard).unwrap();

        let loaded = store.load_snapshot().unwrap();
        assert_eq!(loaded.meta(), Some(&meta));
        assert!(store.exists().unwrap());
    }
}
