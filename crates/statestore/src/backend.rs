//! Storage backends and the conditional write primitive
//!
//! Every backend stores opaque string values under string keys, each with a
//! version that starts at 1 and increases by one per write. Writes are
//! conditional: the caller states which version it expects and, optionally,
//! which fencing token it holds. Both checks happen atomically with the
//! write itself.

use crate::error::{Error, Result};
use crate::lock::LockRecord;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

/// What the caller expects the current version of a record to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The record must not exist yet
    Absent,
    /// The record must exist at exactly this version
    Version(u64),
    /// No version check
    Any,
}

impl Expect {
    /// Expectation derived from the version a caller last observed
    pub fn from_observed(version: Option<u64>) -> Self {
        version.map_or(Self::Absent, Self::Version)
    }

    fn matches(self, actual: Option<u64>) -> bool {
        match self {
            Self::Absent => actual.is_none(),
            Self::Version(v) => actual == Some(v),
            Self::Any => true,
        }
    }
}

impl fmt::Display for Expect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "no record"),
            Self::Version(v) => write!(f, "version {v}"),
            Self::Any => write!(f, "any version"),
        }
    }
}

/// Proof of lock ownership attached to writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fence {
    /// Key of the lock record that issued the token
    pub lock_key: String,
    /// Token issued at acquisition
    pub token: u64,
}

/// Preconditions for a write
#[derive(Debug, Clone, Copy)]
pub struct WriteCondition<'a> {
    pub expect: Expect,
    pub fence: Option<&'a Fence>,
}

impl<'a> WriteCondition<'a> {
    /// Condition with a version expectation and no fence
    pub fn new(expect: Expect) -> Self {
        Self {
            expect,
            fence: None,
        }
    }

    /// Condition that additionally requires the fence to be current
    pub fn fenced(expect: Expect, fence: &'a Fence) -> Self {
        Self {
            expect,
            fence: Some(fence),
        }
    }
}

/// A stored value and its version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub value: String,
    pub version: u64,
}

/// Durable key-value storage with conditional writes
///
/// Implementations must evaluate the version check, the fence check and the
/// mutation as one atomic step.
pub trait StateBackend: Send + Sync {
    /// Read a single record
    fn get(&self, key: &str) -> Result<Option<Record>>;

    /// Read every record whose key starts with `prefix`, ordered by key
    fn list(&self, prefix: &str) -> Result<Vec<(String, Record)>>;

    /// Write a record, returning its new version
    fn put(&self, key: &str, value: &str, condition: WriteCondition<'_>) -> Result<u64>;

    /// Remove a record
    fn remove(&self, key: &str, condition: WriteCondition<'_>) -> Result<()>;
}

/// Validate a write condition against the current state of the store
///
/// `lock_value` is the raw lock record at the fence's key, if a fence was
/// supplied.
pub(crate) fn check_condition(
    key: &str,
    actual: Option<u64>,
    condition: WriteCondition<'_>,
    lock_value: Option<&str>,
) -> Result<()> {
    if let Some(fence) = condition.fence {
        let current = match lock_value {
            Some(raw) => LockRecord::decode(&fence.lock_key, raw)?.current_token(),
            None => None,
        };
        if current != Some(fence.token) {
            return Err(Error::StaleFence {
                lock_key: fence.lock_key.clone(),
                token: fence.token,
                current,
            });
        }
    }

    if !condition.expect.matches(actual) {
        return Err(Error::OptimisticLockConflict {
            key: key.to_string(),
            expected: condition.expect,
            actual,
        });
    }

    Ok(())
}

/// In-process backend guarded by a single mutex
///
/// Useful for tests and dry runs; nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<String, Record>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Record>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(key).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Record)>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect())
    }

    fn put(&self, key: &str, value: &str, condition: WriteCondition<'_>) -> Result<u64> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let actual = records.get(key).map(|r| r.version);
        let lock_value = condition
            .fence
            .and_then(|f| records.get(&f.lock_key))
            .map(|r| r.value.as_str());
        check_condition(key, actual, condition, lock_value)?;

        let version = actual.unwrap_or(0) + 1;
        records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                version,
            },
        );
        Ok(version)
    }

    fn remove(&self, key: &str, condition: WriteCondition<'_>) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let actual = records.get(key).map(|r| r.version);
        let lock_value = condition
            .fence
            .and_then(|f| records.get(&f.lock_key))
            .map(|r| r.value.as_str());
        check_condition(key, actual, condition, lock_value)?;

        records.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_increment() {
        let backend = MemoryBackend::new();
        let v1 = backend
            .put("a", "one", WriteCondition::new(Expect::Absent))
            .unwrap();
        let v2 = backend
            .put("a", "two", WriteCondition::new(Expect::Version(v1)))
            .unwrap();
        assert_eq!((v1, v2), (1, 2));
        assert_eq!(backend.get("a").unwrap().unwrap().value, "two");
    }

    #[test]
    fn test_conditional_write_rejects_stale_version() {
        let backend = MemoryBackend::new();
        backend
            .put("a", "one", WriteCondition::new(Expect::Absent))
            .unwrap();
        backend
            .put("a", "two", WriteCondition::new(Expect::Any))
            .unwrap();

        let err = backend
            .put("a", "three", WriteCondition::new(Expect::Version(1)))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::OptimisticLockConflict {
                actual: Some(2),
                ..
            }
        ));
    }

    #[test]
    fn test_create_only_rejects_existing() {
        let backend = MemoryBackend::new();
        backend
            .put("a", "one", WriteCondition::new(Expect::Absent))
            .unwrap();
        assert!(
            backend
                .put("a", "again", WriteCondition::new(Expect::Absent))
                .is_err()
        );
    }

    #[test]
    fn test_fenced_write_without_lock_fails() {
        let backend = MemoryBackend::new();
        let fence = Fence {
            lock_key: "lock".to_string(),
            token: 1,
        };
        let err = backend
            .put("a", "one", WriteCondition::fenced(Expect::Absent, &fence))
            .unwrap_err();
        assert!(matches!(err, Error::StaleFence { current: None, .. }));
        assert!(backend.get("a").unwrap().is_none());
    }

    #[test]
    fn test_list_by_prefix() {
        let backend = MemoryBackend::new();
        for key in ["s/a/1", "s/a/2", "s/b/1", "s/ab"] {
            backend
                .put(key, "x", WriteCondition::new(Expect::Any))
                .unwrap();
        }
        let keys: Vec<String> = backend
            .list("s/a/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["s/a/1".to_string(), "s/a/2".to_string()]);
    }

    #[test]
    fn test_remove_requires_matching_version() {
        let backend = MemoryBackend::new();
        backend
            .put("a", "one", WriteCondition::new(Expect::Absent))
            .unwrap();
        assert!(
            backend
                .remove("a", WriteCondition::new(Expect::Version(7)))
                .is_err()
        );
        backend
            .remove("a", WriteCondition::new(Expect::Version(1)))
            .unwrap();
        assert!(backend.get("a").unwrap().is_none());
    }
}
