//! SQLite-backed state storage
//!
//! A single `records` table holds every key. Conditional writes run inside an
//! `IMMEDIATE` transaction so concurrent processes sharing the database file
//! serialize on the write lock before any check is made.

use crate::backend::{Record, StateBackend, WriteCondition, check_condition};
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Durable backend storing records in a SQLite database
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open or create a state database at the given path
    ///
    /// Creates the database file and the records table if they don't exist.
    pub fn open(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        log::debug!("Opened state database {}", db_path.display());
        Self::init(conn)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                version INTEGER NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

fn current_version(tx: &Transaction<'_>, key: &str) -> Result<Option<u64>> {
    let version = tx
        .query_row(
            "SELECT version FROM records WHERE key = ?1",
            params![key],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(version.map(|v| v as u64))
}

fn fence_value(tx: &Transaction<'_>, condition: WriteCondition<'_>) -> Result<Option<String>> {
    let Some(fence) = condition.fence else {
        return Ok(None);
    };
    let value = tx
        .query_row(
            "SELECT value FROM records WHERE key = ?1",
            params![fence.lock_key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

impl StateBackend for SqliteBackend {
    fn get(&self, key: &str) -> Result<Option<Record>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let record = conn
            .query_row(
                "SELECT value, version FROM records WHERE key = ?1",
                params![key],
                |row| {
                    Ok(Record {
                        value: row.get(0)?,
                        version: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Record)>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT key, value, version FROM records
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok((
                row.get::<_, String>(0)?,
                Record {
                    value: row.get(1)?,
                    version: row.get::<_, i64>(2)? as u64,
                },
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn put(&self, key: &str, value: &str, condition: WriteCondition<'_>) -> Result<u64> {
        self.with_write(|tx| {
            let actual = current_version(tx, key)?;
            let lock_value = fence_value(tx, condition)?;
            check_condition(key, actual, condition, lock_value.as_deref())?;

            let version = actual.unwrap_or(0) + 1;
            tx.execute(
                "INSERT INTO records (key, value, version) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, version = excluded.version",
                params![key, value, version as i64],
            )?;
            Ok(version)
        })
    }

    fn remove(&self, key: &str, condition: WriteCondition<'_>) -> Result<()> {
        self.with_write(|tx| {
            let actual = current_version(tx, key)?;
            let lock_value = fence_value(tx, condition)?;
            check_condition(key, actual, condition, lock_value.as_deref())?;

            tx.execute("DELETE FROM records WHERE key = ?1", params![key])?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Expect;
    use crate::error::Error;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.db");

        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend
                .put("k", "v", WriteCondition::new(Expect::Absent))
                .unwrap();
        }

        let reopened = SqliteBackend::open(&path).unwrap();
        let record = reopened.get("k").unwrap().unwrap();
        assert_eq!(record.value, "v");
        assert_eq!(record.version, 1);
    }

    #[test]
    fn test_conflict_leaves_record_untouched() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .put("k", "v1", WriteCondition::new(Expect::Absent))
            .unwrap();

        let err = backend
            .put("k", "v2", WriteCondition::new(Expect::Version(5)))
            .unwrap_err();
        assert!(matches!(err, Error::OptimisticLockConflict { .. }));
        assert_eq!(backend.get("k").unwrap().unwrap().value, "v1");
    }

    #[test]
    fn test_list_prefix_is_ordered() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        for key in ["p/z", "p/a", "q/a"] {
            backend
                .put(key, "x", WriteCondition::new(Expect::Any))
                .unwrap();
        }
        let keys: Vec<String> = backend
            .list("p/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["p/a".to_string(), "p/z".to_string()]);
    }

    #[test]
    fn test_remove() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let v = backend
            .put("k", "v", WriteCondition::new(Expect::Absent))
            .unwrap();
        backend
            .remove("k", WriteCondition::new(Expect::Version(v)))
            .unwrap();
        assert!(backend.get("k").unwrap().is_none());
    }
}
