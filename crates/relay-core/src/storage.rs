//! Object store abstraction for the sandbox mirror.
//!
//! This module defines the contract the sync engine needs from an object
//! store:
//! - List with prefix (arbitrary order, missing prefix is empty)
//! - Versioned get/put where the version token is the object `generation`
//! - Conditional puts (`if-generation-match`, `0` meaning create-only)
//!
//! The generation is an opaque string so backends with non-numeric version
//! tokens (ETags) fit the same contract.
//!
//! Two implementations are provided: [`MemoryBackend`] for tests and debug
//! deployments, and [`GcsBackend`] speaking the GCS JSON API with a
//! per-stream bearer credential.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Precondition for conditional object writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutPrecondition {
    /// Write only if the object does not exist (`ifGenerationMatch=0`).
    DoesNotExist,
    /// Write only if the object's generation matches.
    GenerationMatches(String),
    /// Write unconditionally.
    None,
}

/// Result of a conditional object write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutResult {
    /// Write succeeded, returns the new generation.
    Success {
        /// The object generation after the write.
        generation: String,
    },
    /// Precondition failed. The caller treats this as a conflict.
    PreconditionFailed {
        /// The current generation, when the backend reports it.
        current_generation: Option<String>,
    },
}

impl PutResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Object name (key) relative to the bucket.
    pub name: String,
    /// Object size in bytes.
    pub size: u64,
    /// Object generation for conditional writes.
    pub generation: String,
    /// Last modification timestamp, when the backend reports it.
    pub updated: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Returns true for folder placeholder objects (trailing slash).
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.name.ends_with('/')
    }
}

/// Object store contract for the sandbox mirror.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Reads an entire object. Returns `Error::NotFound` if absent.
    async fn get(&self, name: &str) -> Result<Bytes>;

    /// Writes an object with an optional generation precondition.
    ///
    /// A failed precondition is a normal result, never an error.
    async fn put(&self, name: &str, data: Bytes, precondition: PutPrecondition)
        -> Result<PutResult>;

    /// Deletes an object. Succeeds even if the object is absent.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Lists objects with the given prefix.
    ///
    /// A missing prefix yields an empty list. Ordering is arbitrary.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;

    /// Returns object metadata without content, or `None` if absent.
    async fn head(&self, name: &str) -> Result<Option<ObjectMeta>>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    generation: i64,
    updated: DateTime<Utc>,
}

/// In-memory object store for tests and debug deployments.
///
/// Generations are numeric (rendered as strings) to simulate GCS behavior.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Arc<RwLock<HashMap<String, StoredObject>>>,
}

impl MemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, name: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        objects
            .get(name)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("object not found: {name}")))
    }

    async fn put(
        &self,
        name: &str,
        data: Bytes,
        precondition: PutPrecondition,
    ) -> Result<PutResult> {
        let mut objects = self.objects.write().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        let current = objects.get(name);

        match &precondition {
            PutPrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(PutResult::PreconditionFailed {
                        current_generation: Some(obj.generation.to_string()),
                    });
                }
            }
            PutPrecondition::GenerationMatches(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.generation != expected_num => {
                        return Ok(PutResult::PreconditionFailed {
                            current_generation: Some(obj.generation.to_string()),
                        });
                    }
                    None => {
                        return Ok(PutResult::PreconditionFailed {
                            current_generation: None,
                        });
                    }
                    _ => {}
                }
            }
            PutPrecondition::None => {}
        }

        let generation = current.map_or(1, |o| o.generation + 1);
        objects.insert(
            name.to_string(),
            StoredObject {
                data,
                generation,
                updated: Utc::now(),
            },
        );
        drop(objects);

        Ok(PutResult::Success {
            generation: generation.to_string(),
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| Error::Internal {
                message: "lock poisoned".into(),
            })?
            .remove(name);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, obj)| ObjectMeta {
                name: name.clone(),
                size: obj.data.len() as u64,
                generation: obj.generation.to_string(),
                updated: Some(obj.updated),
            })
            .collect())
    }

    async fn head(&self, name: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| Error::Internal {
            message: "lock poisoned".into(),
        })?;

        Ok(objects.get(name).map(|obj| ObjectMeta {
            name: name.to_string(),
            size: obj.data.len() as u64,
            generation: obj.generation.to_string(),
            updated: Some(obj.updated),
        }))
    }
}

/// Default GCS JSON API endpoint.
const GCS_DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";

/// GCS JSON API backend.
///
/// Carries a per-stream bearer credential narrowed to the bucket and prefix
/// the mirror operates on. The base URL is overridable for emulators.
pub struct GcsBackend {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
    token: String,
}

impl std::fmt::Debug for GcsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsBackend")
            .field("base_url", &self.base_url)
            .field("bucket", &self.bucket)
            .field("token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct GcsObjectResource {
    name: String,
    generation: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GcsListResponse {
    #[serde(default)]
    items: Vec<GcsObjectResource>,
    #[serde(default, rename = "nextPageToken")]
    next_page_token: Option<String>,
}

impl From<GcsObjectResource> for ObjectMeta {
    fn from(obj: GcsObjectResource) -> Self {
        Self {
            size: obj.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0),
            name: obj.name,
            generation: obj.generation,
            updated: obj.updated,
        }
    }
}

impl GcsBackend {
    /// Creates a backend for `bucket` using the given bearer credential.
    #[must_use]
    pub fn new(bucket: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: GCS_DEFAULT_BASE_URL.to_string(),
            bucket: bucket.into(),
            token: token.into(),
        }
    }

    /// Overrides the API endpoint (emulators and tests).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            self.bucket,
            utf8_percent_encode(name, NON_ALPHANUMERIC)
        )
    }

    fn transport(err: reqwest::Error) -> Error {
        Error::storage_with_source("gcs request failed", err)
    }
}

#[async_trait]
impl StorageBackend for GcsBackend {
    async fn get(&self, name: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(self.object_url(name))
            .query(&[("alt", "media")])
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::transport)?;

        match response.status() {
            status if status.is_success() => response.bytes().await.map_err(Self::transport),
            reqwest::StatusCode::NOT_FOUND => {
                Err(Error::NotFound(format!("object not found: {name}")))
            }
            status => Err(Error::storage(format!("gcs get {name}: {status}"))),
        }
    }

    async fn put(
        &self,
        name: &str,
        data: Bytes,
        precondition: PutPrecondition,
    ) -> Result<PutResult> {
        let mut query: Vec<(&str, String)> = vec![
            ("uploadType", "media".to_string()),
            ("name", name.to_string()),
        ];
        match &precondition {
            PutPrecondition::DoesNotExist => query.push(("ifGenerationMatch", "0".to_string())),
            PutPrecondition::GenerationMatches(generation) => {
                query.push(("ifGenerationMatch", generation.clone()));
            }
            PutPrecondition::None => {}
        }

        let response = self
            .client
            .post(format!(
                "{}/upload/storage/v1/b/{}/o",
                self.base_url, self.bucket
            ))
            .query(&query)
            .bearer_auth(&self.token)
            .body(data)
            .send()
            .await
            .map_err(Self::transport)?;

        match response.status() {
            status if status.is_success() => {
                let resource: GcsObjectResource =
                    response.json().await.map_err(Self::transport)?;
                Ok(PutResult::Success {
                    generation: resource.generation,
                })
            }
            reqwest::StatusCode::PRECONDITION_FAILED | reqwest::StatusCode::CONFLICT => {
                Ok(PutResult::PreconditionFailed {
                    current_generation: None,
                })
            }
            status => Err(Error::storage(format!("gcs put {name}: {status}"))),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.object_url(name))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::transport)?;

        match response.status() {
            status if status.is_success() => Ok(()),
            reqwest::StatusCode::NOT_FOUND => Ok(()),
            status => Err(Error::storage(format!("gcs delete {name}: {status}"))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let mut all = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("prefix", prefix.to_string()),
                (
                    "fields",
                    "items(name,generation,size,updated),nextPageToken".to_string(),
                ),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let response = self
                .client
                .get(format!(
                    "{}/storage/v1/b/{}/o",
                    self.base_url, self.bucket
                ))
                .query(&query)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(Self::transport)?;

            let page: GcsListResponse = match response.status() {
                status if status.is_success() => {
                    response.json().await.map_err(Self::transport)?
                }
                // A missing prefix (or freshly-created bucket path) lists empty.
                reqwest::StatusCode::NOT_FOUND => return Ok(all),
                status => return Err(Error::storage(format!("gcs list {prefix}: {status}"))),
            };

            all.extend(page.items.into_iter().map(ObjectMeta::from));
            page_token = page.next_page_token;
            if page_token.is_none() {
                return Ok(all);
            }
        }
    }

    async fn head(&self, name: &str) -> Result<Option<ObjectMeta>> {
        let response = self
            .client
            .get(self.object_url(name))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(Self::transport)?;

        match response.status() {
            status if status.is_success() => {
                let resource: GcsObjectResource =
                    response.json().await.map_err(Self::transport)?;
                Ok(Some(resource.into()))
            }
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status => Err(Error::storage(format!("gcs head {name}: {status}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let data = Bytes::from("hello world");

        let result = backend
            .put("work/file.txt", data.clone(), PutPrecondition::None)
            .await
            .expect("put");
        assert!(matches!(result, PutResult::Success { ref generation } if generation == "1"));

        let retrieved = backend.get("work/file.txt").await.expect("get");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn create_only_precondition() {
        let backend = MemoryBackend::new();

        let first = backend
            .put("new.txt", Bytes::from("a"), PutPrecondition::DoesNotExist)
            .await
            .expect("first");
        assert!(first.is_success());

        let second = backend
            .put("new.txt", Bytes::from("b"), PutPrecondition::DoesNotExist)
            .await
            .expect("second");
        assert!(!second.is_success());
    }

    #[tokio::test]
    async fn generation_match_precondition() {
        let backend = MemoryBackend::new();

        let created = backend
            .put("gen.txt", Bytes::from("v1"), PutPrecondition::None)
            .await
            .expect("create");
        let generation = match created {
            PutResult::Success { generation } => generation,
            PutResult::PreconditionFailed { .. } => panic!("expected success"),
        };

        let updated = backend
            .put(
                "gen.txt",
                Bytes::from("v2"),
                PutPrecondition::GenerationMatches(generation.clone()),
            )
            .await
            .expect("update");
        assert!(updated.is_success());

        let stale = backend
            .put(
                "gen.txt",
                Bytes::from("v3"),
                PutPrecondition::GenerationMatches(generation),
            )
            .await
            .expect("stale");
        assert!(matches!(
            stale,
            PutResult::PreconditionFailed {
                current_generation: Some(ref g)
            } if g == "2"
        ));
    }

    #[tokio::test]
    async fn list_with_prefix_and_missing_object() {
        let backend = MemoryBackend::new();
        backend
            .put("a/1.txt", Bytes::from("a1"), PutPrecondition::None)
            .await
            .expect("put");
        backend
            .put("b/1.txt", Bytes::from("b1"), PutPrecondition::None)
            .await
            .expect("put");

        assert_eq!(backend.list("a/").await.expect("list").len(), 1);
        assert!(backend.list("missing/").await.expect("list").is_empty());
        assert!(backend.head("a/2.txt").await.expect("head").is_none());
        assert!(matches!(
            backend.get("a/2.txt").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let backend = MemoryBackend::new();
        backend
            .put("d.txt", Bytes::from("x"), PutPrecondition::None)
            .await
            .expect("put");
        backend.delete("d.txt").await.expect("delete");
        backend.delete("d.txt").await.expect("delete again");
    }

    #[test]
    fn folder_placeholder_detection() {
        let folder = ObjectMeta {
            name: "work/dir/".into(),
            size: 0,
            generation: "1".into(),
            updated: None,
        };
        assert!(folder.is_folder());
    }
}
