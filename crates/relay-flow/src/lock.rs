//! The consumer lock: lease-based mutual exclusion per project.
//!
//! At most one live executor may serve a `(userId, projectId)` scope. The
//! lock is a single metadata document acquired through CAS:
//!
//! 1. A create-only write wins when no lock exists.
//! 2. An existing lock whose lease has lapsed (`now - acquiredAt >= leaseMs`)
//!    is taken over with a version-matched write.
//! 3. Anything else is a conflict carrying the current holder's identity.
//!
//! Acquisitions race through the store's transaction semantics; exactly one
//! wins per expiry window. The lease doubles as a liveness timeout: a dead
//! holder is superseded by the next acquire after expiry.
//!
//! The runtime descriptor attached to the lock records how the executor was
//! launched so `stop` can tear it down from any replica.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::docstore::{DocStore, WritePrecondition, WriteResult};
use relay_core::retry::{retry, RetryPolicy};
use relay_core::{ConsumerId, Scope};

use crate::error::{Error, Result};

/// Upper bound on the lease duration (10 minutes).
pub const MAX_LEASE_MS: u64 = 600_000;

/// Default lease duration when a start request does not specify one.
pub const DEFAULT_LEASE_MS: u64 = 300_000;

const LOCK_COLLECTION: &str = "locks";
const LOCK_DOC_ID: &str = "consumer";

/// Where the executor for a lock runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsumerType {
    /// Remote job execution.
    Cloud,
    /// Local sandbox containers.
    Local,
}

/// The consumer lock document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLock {
    /// The holding executor.
    pub consumer_id: ConsumerId,
    /// Where the executor runs.
    pub consumer_type: ConsumerType,
    /// Lease duration in milliseconds.
    pub lease_ms: u64,
    /// When the lease was (last) acquired or renewed.
    pub acquired_at: DateTime<Utc>,
    /// Opaque runtime descriptor written by the launcher.
    #[serde(default)]
    pub runtime: Value,
    /// Set by `stop` for remote executors to observe.
    #[serde(default)]
    pub stop_requested: bool,
    /// When stop was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_at: Option<DateTime<Utc>>,
}

impl ConsumerLock {
    /// Creates a fresh lock held by `consumer_id`.
    #[must_use]
    pub fn new(consumer_id: ConsumerId, consumer_type: ConsumerType, lease_ms: u64) -> Self {
        Self {
            consumer_id,
            consumer_type,
            lease_ms,
            acquired_at: Utc::now(),
            runtime: Value::Null,
            stop_requested: false,
            stop_at: None,
        }
    }

    /// Returns whether the lease had lapsed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let elapsed = now.signed_duration_since(self.acquired_at);
        elapsed.num_milliseconds() >= self.lease_ms as i64
    }

    /// Returns whether the lease has lapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Details of a held lock returned on acquisition conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockConflict {
    /// The current holder.
    pub current_consumer_id: String,
    /// When the current holder acquired the lease.
    pub acquired_at: DateTime<Utc>,
    /// The current holder's lease duration.
    pub lease_ms: u64,
}

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// The lock was acquired.
    Acquired(ConsumerLock),
    /// The lock is held by another live executor.
    Held(LockConflict),
}

impl AcquireOutcome {
    /// Returns true if the lock was acquired.
    #[must_use]
    pub const fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Manages consumer locks over the metadata store.
#[derive(Clone)]
pub struct LockManager {
    docs: Arc<dyn DocStore>,
}

impl LockManager {
    /// Creates a manager over the given store.
    #[must_use]
    pub fn new(docs: Arc<dyn DocStore>) -> Self {
        Self { docs }
    }

    fn key(scope: &Scope) -> String {
        scope.doc_key(LOCK_COLLECTION, LOCK_DOC_ID)
    }

    /// Attempts to acquire the lock for a scope.
    ///
    /// Transient storage failures are retried with bounded backoff; losing
    /// the acquisition race is not an error and returns the holder's info.
    ///
    /// # Errors
    ///
    /// Returns an error when the store stays unavailable past the retry
    /// budget.
    pub async fn acquire(
        &self,
        scope: &Scope,
        consumer_id: &ConsumerId,
        lease_ms: u64,
        consumer_type: ConsumerType,
    ) -> Result<AcquireOutcome> {
        if lease_ms == 0 || lease_ms > MAX_LEASE_MS {
            return Err(Error::invalid_request(format!(
                "leaseMs must be in 1..={MAX_LEASE_MS}, got {lease_ms}"
            )));
        }

        let outcome = retry(RetryPolicy::storage(), "lock.acquire", || {
            self.try_acquire(scope, consumer_id, lease_ms, consumer_type)
        })
        .await?;
        Ok(outcome)
    }

    async fn try_acquire(
        &self,
        scope: &Scope,
        consumer_id: &ConsumerId,
        lease_ms: u64,
        consumer_type: ConsumerType,
    ) -> relay_core::Result<AcquireOutcome> {
        let key = Self::key(scope);
        let fresh = ConsumerLock::new(consumer_id.clone(), consumer_type, lease_ms);
        let fresh_value = to_value(&fresh)?;

        // Fast path: no lock exists.
        match self
            .docs
            .put(&key, fresh_value.clone(), WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => return Ok(AcquireOutcome::Acquired(fresh)),
            WriteResult::PreconditionFailed { .. } => {}
        }

        // A lock exists: take it over only if its lease lapsed. The expiry
        // decision is bound to the version used for the CAS, so a racing
        // takeover makes this write fail rather than clobber the winner.
        let Some(doc) = self.docs.get(&key).await? else {
            // Deleted between the two operations; next caller wins.
            return Ok(AcquireOutcome::Held(LockConflict {
                current_consumer_id: String::new(),
                acquired_at: Utc::now(),
                lease_ms,
            }));
        };

        let current: ConsumerLock = from_value(doc.value.clone())?;
        if !current.is_expired() {
            return Ok(AcquireOutcome::Held(LockConflict {
                current_consumer_id: current.consumer_id.to_string(),
                acquired_at: current.acquired_at,
                lease_ms: current.lease_ms,
            }));
        }

        match self
            .docs
            .put(
                &key,
                fresh_value,
                WritePrecondition::MatchesVersion(doc.version),
            )
            .await?
        {
            WriteResult::Success { .. } => Ok(AcquireOutcome::Acquired(fresh)),
            WriteResult::PreconditionFailed { .. } => {
                // Someone else won the takeover; report them as holder.
                let holder = self.get(scope).await?;
                Ok(AcquireOutcome::Held(match holder {
                    Some(lock) => LockConflict {
                        current_consumer_id: lock.consumer_id.to_string(),
                        acquired_at: lock.acquired_at,
                        lease_ms: lock.lease_ms,
                    },
                    None => LockConflict {
                        current_consumer_id: String::new(),
                        acquired_at: Utc::now(),
                        lease_ms,
                    },
                }))
            }
        }
    }

    /// Reads the current lock, if any.
    ///
    /// # Errors
    ///
    /// Returns an error when the store read fails.
    pub async fn get(&self, scope: &Scope) -> relay_core::Result<Option<ConsumerLock>> {
        match self.docs.get(&Self::key(scope)).await? {
            Some(doc) => Ok(Some(from_value(doc.value)?)),
            None => Ok(None),
        }
    }

    /// Merges a runtime descriptor into the lock, owner-gated.
    ///
    /// A caller that no longer holds the lock is a no-op (`false`).
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable.
    pub async fn set_runtime(
        &self,
        scope: &Scope,
        consumer_id: &ConsumerId,
        runtime: Value,
    ) -> Result<bool> {
        self.mutate(scope, Some(consumer_id), |lock| {
            lock.runtime = runtime.clone();
        })
        .await
    }

    /// Renews the lease (`acquiredAt = now`), owner-gated.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable.
    pub async fn renew(&self, scope: &Scope, consumer_id: &ConsumerId) -> Result<bool> {
        self.mutate(scope, Some(consumer_id), |lock| {
            lock.acquired_at = Utc::now();
        })
        .await
    }

    /// Marks the lock as stop-requested for remote executors to observe.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable.
    pub async fn request_stop(&self, scope: &Scope) -> Result<bool> {
        self.mutate(scope, None, |lock| {
            lock.stop_requested = true;
            lock.stop_at = Some(Utc::now());
        })
        .await
    }

    /// Releases the lock.
    ///
    /// Deletes the document when `force` is set or the stored holder matches
    /// `consumer_id`. Idempotent: a missing lock releases successfully
    /// without effect.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable. Callers on cleanup
    /// paths treat failures as best-effort and log them.
    pub async fn release(
        &self,
        scope: &Scope,
        consumer_id: Option<&str>,
        force: bool,
    ) -> Result<bool> {
        let key = Self::key(scope);
        let Some(doc) = self.docs.get(&key).await? else {
            return Ok(false);
        };

        let current: ConsumerLock = from_value(doc.value)?;
        let owned = consumer_id.is_some_and(|id| current.consumer_id.as_str() == id);
        if !(force || owned) {
            return Ok(false);
        }

        self.docs.delete(&key).await?;
        Ok(true)
    }

    /// Get-check-CAS helper; retries lost races against fresh state.
    async fn mutate(
        &self,
        scope: &Scope,
        owner: Option<&ConsumerId>,
        apply: impl Fn(&mut ConsumerLock),
    ) -> Result<bool> {
        let key = Self::key(scope);

        for _ in 0..3 {
            let Some(doc) = self.docs.get(&key).await? else {
                return Ok(false);
            };
            let mut lock: ConsumerLock = from_value(doc.value)?;
            if let Some(owner) = owner {
                if &lock.consumer_id != owner {
                    return Ok(false);
                }
            }
            apply(&mut lock);

            match self
                .docs
                .put(
                    &key,
                    to_value(&lock)?,
                    WritePrecondition::MatchesVersion(doc.version),
                )
                .await?
            {
                WriteResult::Success { .. } => return Ok(true),
                WriteResult::PreconditionFailed { .. } => {}
            }
        }

        Err(Error::Core(relay_core::Error::PreconditionFailed {
            message: format!("lock mutation contention on {key}"),
        }))
    }
}

fn to_value<T: Serialize>(value: &T) -> relay_core::Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| relay_core::Error::serialization(format!("serialize lock: {e}")))
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> relay_core::Result<T> {
    serde_json::from_value(value)
        .map_err(|e| relay_core::Error::serialization(format!("parse lock: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::docstore::MemoryDocStore;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryDocStore::new()))
    }

    fn scope() -> Scope {
        Scope::new("u1", "p1").expect("scope")
    }

    #[tokio::test]
    async fn acquire_fresh_lock() {
        let manager = manager();
        let consumer = ConsumerId::generate();

        let outcome = manager
            .acquire(&scope(), &consumer, 30_000, ConsumerType::Local)
            .await
            .expect("acquire");
        assert!(outcome.is_acquired());

        let stored = manager.get(&scope()).await.expect("get").expect("lock");
        assert_eq!(stored.consumer_id, consumer);
        assert!(!stored.stop_requested);
    }

    #[tokio::test]
    async fn second_acquire_conflicts() {
        let manager = manager();
        let first = ConsumerId::generate();
        let second = ConsumerId::generate();

        manager
            .acquire(&scope(), &first, 30_000, ConsumerType::Local)
            .await
            .expect("first");

        let outcome = manager
            .acquire(&scope(), &second, 30_000, ConsumerType::Cloud)
            .await
            .expect("second");
        match outcome {
            AcquireOutcome::Held(conflict) => {
                assert_eq!(conflict.current_consumer_id, first.to_string());
            }
            AcquireOutcome::Acquired(_) => panic!("expected conflict"),
        }
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let manager = manager();
        let first = ConsumerId::generate();
        let second = ConsumerId::generate();

        manager
            .acquire(&scope(), &first, 1, ConsumerType::Local)
            .await
            .expect("first");
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let outcome = manager
            .acquire(&scope(), &second, 30_000, ConsumerType::Cloud)
            .await
            .expect("takeover");
        assert!(outcome.is_acquired());

        let stored = manager.get(&scope()).await.expect("get").expect("lock");
        assert_eq!(stored.consumer_id, second);
        assert_eq!(stored.consumer_type, ConsumerType::Cloud);
    }

    #[tokio::test]
    async fn renew_refreshes_lease_for_owner_only() {
        let manager = manager();
        let owner = ConsumerId::generate();
        let other = ConsumerId::generate();

        manager
            .acquire(&scope(), &owner, 30_000, ConsumerType::Local)
            .await
            .expect("acquire");
        let before = manager.get(&scope()).await.expect("get").expect("lock");

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(manager.renew(&scope(), &owner).await.expect("renew"));
        let after = manager.get(&scope()).await.expect("get").expect("lock");
        assert!(after.acquired_at > before.acquired_at);

        assert!(!manager.renew(&scope(), &other).await.expect("renew other"));
    }

    #[tokio::test]
    async fn set_runtime_is_owner_gated() {
        let manager = manager();
        let owner = ConsumerId::generate();
        let other = ConsumerId::generate();

        manager
            .acquire(&scope(), &owner, 30_000, ConsumerType::Local)
            .await
            .expect("acquire");

        let applied = manager
            .set_runtime(&scope(), &owner, serde_json::json!({"mode": "local-sandbox"}))
            .await
            .expect("set");
        assert!(applied);

        let ignored = manager
            .set_runtime(&scope(), &other, serde_json::json!({"mode": "hijack"}))
            .await
            .expect("set other");
        assert!(!ignored);

        let stored = manager.get(&scope()).await.expect("get").expect("lock");
        assert_eq!(stored.runtime["mode"], "local-sandbox");
    }

    #[tokio::test]
    async fn release_is_owner_scoped_and_idempotent() {
        let manager = manager();
        let owner = ConsumerId::generate();

        manager
            .acquire(&scope(), &owner, 30_000, ConsumerType::Local)
            .await
            .expect("acquire");

        assert!(!manager
            .release(&scope(), Some("someone-else"), false)
            .await
            .expect("foreign release"));
        assert!(manager.get(&scope()).await.expect("get").is_some());

        assert!(manager
            .release(&scope(), Some(owner.as_str()), false)
            .await
            .expect("owner release"));
        assert!(manager.get(&scope()).await.expect("get").is_none());

        // Releasing again is a quiet no-op.
        assert!(!manager
            .release(&scope(), Some(owner.as_str()), false)
            .await
            .expect("repeat release"));
    }

    #[tokio::test]
    async fn force_release_ignores_ownership() {
        let manager = manager();
        let owner = ConsumerId::generate();

        manager
            .acquire(&scope(), &owner, 30_000, ConsumerType::Cloud)
            .await
            .expect("acquire");
        assert!(manager.release(&scope(), None, true).await.expect("force"));
        assert!(manager.get(&scope()).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn request_stop_marks_lock() {
        let manager = manager();
        let owner = ConsumerId::generate();

        manager
            .acquire(&scope(), &owner, 30_000, ConsumerType::Cloud)
            .await
            .expect("acquire");
        assert!(manager.request_stop(&scope()).await.expect("stop"));

        let stored = manager.get(&scope()).await.expect("get").expect("lock");
        assert!(stored.stop_requested);
        assert!(stored.stop_at.is_some());
    }

    #[tokio::test]
    async fn lease_bounds_are_enforced() {
        let manager = manager();
        let consumer = ConsumerId::generate();

        assert!(manager
            .acquire(&scope(), &consumer, 0, ConsumerType::Local)
            .await
            .is_err());
        assert!(manager
            .acquire(&scope(), &consumer, MAX_LEASE_MS + 1, ConsumerType::Local)
            .await
            .is_err());
    }
}
