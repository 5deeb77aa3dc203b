//! The sync manifest: local record of remote generations and file stats.
//!
//! Persisted as JSON at `<workRoot>/.gcs-manifest.json`, mapping object
//! names to the remote generation and the local `(mtime, size)` observed at
//! the last successful download or upload. Updates are written via
//! temp-file-and-rename to be crash-safe. A malformed manifest is treated
//! as empty; the next sync re-downloads differing remote objects.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use relay_core::error::{Error, Result};

/// Manifest file name at the work root.
pub const MANIFEST_FILE: &str = ".gcs-manifest.json";

/// Per-object manifest entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Remote generation at the last successful transfer.
    pub remote_gen: String,
    /// Local file mtime at the last successful transfer, epoch milliseconds.
    pub local_mtime: i64,
    /// Local file size at the last successful transfer.
    pub local_size: u64,
}

/// The manifest: object name to entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    /// Loads the manifest from a work root.
    ///
    /// A missing or malformed file yields an empty manifest.
    pub async fn load(work_root: &Path) -> Self {
        let path = work_root.join(MANIFEST_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Malformed sync manifest, treating as empty"
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Persists the manifest at the work root via temp-file-and-rename.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the write or rename fails.
    pub async fn save(&self, work_root: &Path) -> Result<()> {
        let path = work_root.join(MANIFEST_FILE);
        let tmp = work_root.join(format!("{MANIFEST_FILE}.tmp"));

        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::serialization(format!("serialize manifest: {e}")))?;

        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::storage_with_source("write manifest", e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::storage_with_source("rename manifest", e))?;
        Ok(())
    }

    /// Returns the entry for an object name.
    #[must_use]
    pub fn get(&self, object_name: &str) -> Option<&ManifestEntry> {
        self.entries.get(object_name)
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, object_name: impl Into<String>, entry: ManifestEntry) {
        self.entries.insert(object_name.into(), entry);
    }

    /// Returns the number of tracked objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no objects are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
