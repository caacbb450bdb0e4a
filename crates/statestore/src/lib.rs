//! # Statestore
//!
//! Durable, versioned state for declarative stacks.
//!
//! This crate provides:
//! - A key-value [`StateBackend`] with a conditional write primitive
//!   (version expectation plus fencing token, checked atomically)
//! - [`MemoryBackend`] for tests and [`SqliteBackend`] for durable state
//!   shared between processes
//! - A [`LockManager`] granting one holder at a time, with monotonically
//!   increasing fencing tokens and expiry-based reclamation
//! - Per-resource [`ResourceRecord`]s grouped into a [`StateSnapshot`],
//!   readable across record format versions
//!
//! ## Example
//!
//! ```no_run
//! use statestore::{SqliteBackend, StateStore};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let backend = Arc::new(SqliteBackend::open(Path::new("/tmp/state.db"))?);
//! let store = StateStore::new(backend, "prod");
//!
//! let locks = store.lock_manager(chrono::Duration::minutes(15));
//! let guard = locks.acquire("ci@runner-7", "apply")?;
//!
//! let snapshot = store.load_snapshot()?;
//! println!("{} resources under management", snapshot.len());
//!
//! locks.release(guard)?;
//! # Ok::<(), statestore::Error>(())
//! ```

mod backend;
mod error;
mod lock;
pub mod retry;
mod snapshot;
mod sqlite;

pub use backend::{Expect, Fence, MemoryBackend, Record, StateBackend, WriteCondition};
pub use error::{Error, ErrorCategory, Result};
pub use lock::{LockGuard, LockInfo, LockManager, LockRecord};
pub use retry::{RetryConfig, with_retry};
pub use snapshot::{
    DeletionPolicy, RECORD_FORMAT, ResourceRecord, StackMeta, StateSnapshot, StateStore,
    Versioned,
};
pub use sqlite::SqliteBackend;
