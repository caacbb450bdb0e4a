//! Lock manager built on the conditional write primitive
//!
//! The lock record lives next to the stack's state and is never deleted: a
//! release only clears the holder, so the fencing token counter keeps
//! increasing across acquisitions.
//!
//! Expiry is the liveness escape hatch for crashed holders. Once a lock's
//! `expires_at` has passed, the next caller reclaims it and any write still
//! in flight from the old holder is rejected by its stale fence. A holder
//! that is merely slow (not dead) loses its lock the same way, so the TTL
//! must comfortably exceed the longest single provider call.

use crate::backend::{Expect, Fence, StateBackend, WriteCondition};
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Who holds a lock and until when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Holder identity (user, host, process)
    pub holder: String,
    /// Operation the holder is performing
    pub operation: String,
    /// Fencing token issued at acquisition
    pub token: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Whether the lock has outlived its expiry
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, token {}, since {}, expires {})",
            self.holder,
            self.operation,
            self.token,
            self.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.expires_at.format("%Y-%m-%d %H:%M:%S UTC"),
        )
    }
}

/// Persisted lock state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Highest token ever issued for this lock
    pub last_token: u64,
    /// Current holder, if any
    #[serde(default)]
    pub held: Option<LockInfo>,
}

impl LockRecord {
    pub(crate) fn decode(key: &str, raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::CorruptRecord {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Token of the current holder, if the lock is held
    pub fn current_token(&self) -> Option<u64> {
        self.held.as_ref().map(|h| h.token)
    }
}

/// An acquired lock
///
/// Dropping a guard does not release the lock; release is explicit so a
/// caller that lost its lock can abort without touching the record.
#[derive(Debug, Clone)]
pub struct LockGuard {
    info: LockInfo,
    fence: Fence,
    ttl: Duration,
}

impl LockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn token(&self) -> u64 {
        self.info.token
    }

    /// Fence to attach to every write made under this lock
    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    /// Whether less than half of the TTL remains
    pub fn should_refresh(&self, now: DateTime<Utc>) -> bool {
        self.info.expires_at - now < self.ttl / 2
    }
}

/// Acquires, refreshes and releases the lock for one stack
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn StateBackend>,
    key: String,
    ttl: Duration,
}

impl LockManager {
    pub fn new(backend: Arc<dyn StateBackend>, key: String, ttl: Duration) -> Self {
        Self { backend, key, ttl }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read the current lock record and its version
    pub fn current(&self) -> Result<(LockRecord, Option<u64>)> {
        match self.backend.get(&self.key)? {
            Some(record) => Ok((
                LockRecord::decode(&self.key, &record.value)?,
                Some(record.version),
            )),
            None => Ok((LockRecord::default(), None)),
        }
    }

    /// Current holder, if any (expired holders included)
    pub fn holder(&self) -> Result<Option<LockInfo>> {
        Ok(self.current()?.0.held)
    }

    /// Acquire the lock
    ///
    /// Succeeds only if nobody holds an unexpired lock. On contention the
    /// error names the current holder; callers decide whether to retry.
    pub fn acquire(&self, holder: &str, operation: &str) -> Result<LockGuard> {
        // A lost race where the winner already released is retried once more.
        for _ in 0..3 {
            let (record, version) = self.current()?;
            let now = Utc::now();

            if let Some(current) = &record.held {
                if !current.is_expired(now) {
                    return Err(Error::LockHeld {
                        holder: current.clone(),
                    });
                }
                log::warn!(
                    "Reclaiming expired lock on '{}' from {} (expired {}); \
                     writes still in flight from that holder will be rejected",
                    self.key,
                    current.holder,
                    current.expires_at
                );
            }

            let info = LockInfo {
                holder: holder.to_string(),
                operation: operation.to_string(),
                token: record.last_token + 1,
                acquired_at: now,
                expires_at: now + self.ttl,
            };
            let next = LockRecord {
                last_token: info.token,
                held: Some(info.clone()),
            };

            match self.write(&next, Expect::from_observed(version)) {
                Ok(()) => {
                    log::debug!("Acquired lock '{}' with token {}", self.key, info.token);
                    return Ok(LockGuard {
                        fence: Fence {
                            lock_key: self.key.clone(),
                            token: info.token,
                        },
                        info,
                        ttl: self.ttl,
                    });
                }
                Err(Error::OptimisticLockConflict { .. }) => {
                    // Someone else wrote between our read and write.
                    if let Some(winner) = self.holder()? {
                        return Err(Error::LockHeld { holder: winner });
                    }
                }
                Err(e) => return Err(e),
            }
        }

        match self.holder()? {
            Some(winner) => Err(Error::LockHeld { holder: winner }),
            None => Err(Error::LockLost {
                token: 0,
                reason: "lock record kept changing during acquisition".to_string(),
            }),
        }
    }

    /// Extend the guard's expiry
    ///
    /// Fails with `LockLost` if the guard's token is no longer current.
    pub fn refresh(&self, guard: &mut LockGuard) -> Result<()> {
        let (mut record, version) = self.owned_record(guard)?;
        let now = Utc::now();
        if let Some(held) = record.held.as_mut() {
            held.expires_at = now + self.ttl;
        }
        self.write(&record, Expect::from_observed(version))
            .map_err(|e| lost_on_conflict(e, guard.token()))?;
        guard.info.expires_at = now + self.ttl;
        log::debug!("Refreshed lock '{}' token {}", self.key, guard.token());
        Ok(())
    }

    /// Release the lock held by `guard`
    pub fn release(&self, guard: LockGuard) -> Result<()> {
        let (mut record, version) = self.owned_record(&guard)?;
        record.held = None;
        self.write(&record, Expect::from_observed(version))
            .map_err(|e| lost_on_conflict(e, guard.token()))?;
        log::debug!("Released lock '{}' token {}", self.key, guard.token());
        Ok(())
    }

    /// Clear the lock if it is held with `token`, regardless of holder
    ///
    /// This is an operator action for locks left behind by crashed runs;
    /// the caller is asserting the holder is gone.
    pub fn force_release(&self, token: u64) -> Result<LockInfo> {
        let (mut record, version) = self.current()?;
        let Some(held) = record.held.take() else {
            return Err(Error::LockLost {
                token,
                reason: "lock is not held".to_string(),
            });
        };
        if held.token != token {
            return Err(Error::LockLost {
                token,
                reason: format!("lock is held with token {}", held.token),
            });
        }
        self.write(&record, Expect::from_observed(version))?;
        log::warn!("Force-released lock '{}' held by {}", self.key, held);
        Ok(held)
    }

    fn owned_record(&self, guard: &LockGuard) -> Result<(LockRecord, Option<u64>)> {
        let (record, version) = self.current()?;
        match record.current_token() {
            Some(token) if token == guard.token() => Ok((record, version)),
            Some(token) => Err(Error::LockLost {
                token: guard.token(),
                reason: format!("lock was reclaimed with token {token}"),
            }),
            None => Err(Error::LockLost {
                token: guard.token(),
                reason: "lock was released".to_string(),
            }),
        }
    }

    fn write(&self, record: &LockRecord, expect: Expect) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.backend
            .put(&self.key, &raw, WriteCondition::new(expect))?;
        Ok(())
    }
}

fn lost_on_conflict(err: Error, token: u64) -> Error {
    match err {
        Error::OptimisticLockConflict { .. } => Error::LockLost {
            token,
            reason: "lock record changed concurrently".to_string(),
        },
        other => other,
    }
}
