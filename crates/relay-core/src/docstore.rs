//! Metadata store abstraction (transactional document store).
//!
//! This module defines the contract Relay needs from its metadata store:
//! - Versioned reads and conditional writes (CAS)
//! - Idempotent deletes
//! - Prefix scans and field-equality queries
//!
//! The version token is a numeric revision maintained by the backend. CAS is
//! the core primitive for distributed correctness: lock acquisition and every
//! idempotent upsert are expressed as conditional writes, never as
//! "create-then-catch-already-exists".
//!
//! [`MemoryDocStore`] is the in-memory implementation used by tests and debug
//! deployments. Production backends (Firestore-class stores) implement the
//! same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional document writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Write only if the document does not exist.
    DoesNotExist,
    /// Write only if the document's version matches.
    MatchesVersion(i64),
    /// Write unconditionally.
    None,
}

/// Result of a conditional document write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns the new version.
    Success {
        /// The document version after the write.
        version: i64,
    },
    /// Precondition failed, returns the current version if the doc exists.
    PreconditionFailed {
        /// The current version that caused the failure, if any.
        current_version: Option<i64>,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// A stored document with its version metadata.
#[derive(Debug, Clone)]
pub struct Document {
    /// Full document key.
    pub key: String,
    /// Document contents.
    pub value: Value,
    /// Backend revision for CAS operations.
    pub version: i64,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Transactional document store contract.
///
/// All methods are `Send + Sync` to support concurrent access from request
/// tasks. Write preconditions never surface as errors - a failed precondition
/// is a normal result the caller handles.
#[async_trait]
pub trait DocStore: Send + Sync + 'static {
    /// Reads a document by key. Returns `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Document>>;

    /// Writes a document with an optional precondition.
    async fn put(&self, key: &str, value: Value, precondition: WritePrecondition)
        -> Result<WriteResult>;

    /// Deletes a document. Succeeds even if the document is absent.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lists all documents whose key starts with `prefix`.
    ///
    /// Ordering is arbitrary; callers requiring deterministic order sort the
    /// results themselves.
    async fn list(&self, prefix: &str) -> Result<Vec<Document>>;

    /// Returns documents under `prefix` whose top-level `field` equals `value`.
    async fn query(&self, prefix: &str, field: &str, value: &Value) -> Result<Vec<Document>>;
}

/// Maximum CAS attempts for [`update`].
const UPDATE_MAX_ATTEMPTS: u32 = 5;

/// Transactional read-modify-write over a [`DocStore`].
///
/// Reads the current document, applies `apply`, and writes back with a
/// version precondition. Lost races are replayed against fresh state, bounded
/// by a fixed attempt budget.
///
/// # Errors
///
/// Returns `Error::PreconditionFailed` when the attempt budget is exhausted,
/// or any error surfaced by the store or by `apply`.
pub async fn update<F>(store: &dyn DocStore, key: &str, mut apply: F) -> Result<Document>
where
    F: FnMut(Option<&Value>) -> Result<Value> + Send,
{
    for _ in 0..UPDATE_MAX_ATTEMPTS {
        let current = store.get(key).await?;
        let next = apply(current.as_ref().map(|d| &d.value))?;
        let precondition = match &current {
            Some(doc) => WritePrecondition::MatchesVersion(doc.version),
            None => WritePrecondition::DoesNotExist,
        };

        match store.put(key, next.clone(), precondition).await? {
            WriteResult::Success { version } => {
                return Ok(Document {
                    key: key.to_string(),
                    value: next,
                    version,
                    updated_at: Utc::now(),
                });
            }
            WriteResult::PreconditionFailed { .. } => {
                // Lost the race - re-read and reapply.
            }
        }
    }

    Err(Error::PreconditionFailed {
        message: format!("update contention on {key} after {UPDATE_MAX_ATTEMPTS} attempts"),
    })
}

#[derive(Debug, Clone)]
struct StoredDoc {
    value: Value,
    version: i64,
    updated_at: DateTime<Utc>,
}

/// In-memory document store for tests and debug deployments.
///
/// Thread-safe via `RwLock`. Versions are monotonically increasing per key,
/// simulating the revision semantics of a transactional metadata store.
#[derive(Debug, Default)]
pub struct MemoryDocStore {
    docs: Arc<RwLock<HashMap<String, StoredDoc>>>,
}

impl MemoryDocStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn get(&self, key: &str) -> Result<Option<Document>> {
        let docs = self.docs.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(docs.get(key).map(|d| Document {
            key: key.to_string(),
            value: d.value.clone(),
            version: d.version,
            updated_at: d.updated_at,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut docs = self.docs.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        let current = docs.get(key);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(doc) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: Some(doc.version),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => match current {
                Some(doc) if doc.version != expected => {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: Some(doc.version),
                    });
                }
                None => {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: None,
                    });
                }
                _ => {}
            },
            WritePrecondition::None => {}
        }

        let version = current.map_or(1, |d| d.version + 1);
        docs.insert(
            key.to_string(),
            StoredDoc {
                value,
                version,
                updated_at: Utc::now(),
            },
        );
        drop(docs);

        Ok(WriteResult::Success { version })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.docs
            .write()
            .map_err(|_| Error::Internal {
                message: "lock poisoned".into(),
            })?
            .remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Document>> {
        let docs = self.docs.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(docs
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, d)| Document {
                key: k.clone(),
                value: d.value.clone(),
                version: d.version,
                updated_at: d.updated_at,
            })
            .collect())
    }

    async fn query(&self, prefix: &str, field: &str, value: &Value) -> Result<Vec<Document>> {
        Ok(self
            .list(prefix)
            .await?
            .into_iter()
            .filter(|doc| doc.value.get(field) == Some(value))
            .collect())
    }
}
