//! The sync engine: download and upload passes with conflict protection.
//!
//! Runs for the same work root are serialized; overlapping triggers
//! coalesce ([`SyncEngine::try_sync`] returns `None` instead of queueing a
//! duplicate run). Transfers within a pass run concurrently up to the
//! configured limits.
//!
//! Conflict rules (upload pass):
//! - manifest entry present but remote generation moved -> conflict, skip
//! - no manifest entry but the remote object exists -> conflict, skip
//! - otherwise upload with `if-generation-match` (or create-only), and a
//!   failed precondition is a conflict
//!
//! A locally-modified file whose remote also moved is counted as a conflict
//! in the download pass before the remote content replaces it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::Instrument;

use relay_core::error::{Error, Result};
use relay_core::storage::{ObjectMeta, PutPrecondition, PutResult, StorageBackend};

use crate::sync::manifest::{Manifest, ManifestEntry, MANIFEST_FILE};
use crate::workroot::WorkRoot;

/// Default interval between periodic sync runs.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(15);

/// Default transfer parallelism per pass.
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 4;

/// Sync engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Object name prefix the mirror is scoped to.
    pub prefix: String,
    /// Whether the upload pass runs at all.
    pub uploads_enabled: bool,
    /// Download parallelism.
    pub download_concurrency: usize,
    /// Upload parallelism.
    pub upload_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            uploads_enabled: true,
            download_concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            upload_concurrency: DEFAULT_TRANSFER_CONCURRENCY,
        }
    }
}

/// Per-run transfer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Remote objects seen by the listing.
    pub scanned_remote: u64,
    /// Objects downloaded into the work root.
    pub downloaded: u64,
    /// Files uploaded to the remote.
    pub uploaded: u64,
    /// Transfers skipped due to divergent local and remote state.
    pub conflicts: u64,
}

/// Mirrors a work root against an object-store prefix.
pub struct SyncEngine {
    storage: Arc<dyn StorageBackend>,
    config: SyncConfig,
    runs: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Creates an engine over the given backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, config: SyncConfig) -> Self {
        Self {
            storage,
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the configured prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    /// Runs a sync, waiting for any in-flight run on the same work root.
    ///
    /// # Errors
    ///
    /// Surfaces listing/download failures; upload permission failures are
    /// absorbed as conflicts.
    pub async fn sync(&self, work_root: &Path) -> Result<SyncStats> {
        let gate = self.gate(work_root).await;
        let _guard = gate.lock().await;
        let span =
            relay_core::observability::sync_span("sync", &work_root.display().to_string());
        self.run(work_root).instrument(span).await
    }

    /// Runs a sync unless one is already in flight for this work root.
    ///
    /// Returns `None` when a run is active (the trigger coalesces into it).
    ///
    /// # Errors
    ///
    /// Same as [`SyncEngine::sync`].
    pub async fn try_sync(&self, work_root: &Path) -> Result<Option<SyncStats>> {
        let gate = self.gate(work_root).await;
        let Ok(_guard) = gate.try_lock() else {
            return Ok(None);
        };
        let span =
            relay_core::observability::sync_span("sync", &work_root.display().to_string());
        self.run(work_root).instrument(span).await.map(Some)
    }

    async fn gate(&self, work_root: &Path) -> Arc<Mutex<()>> {
        let mut runs = self.runs.lock().await;
        Arc::clone(
            runs.entry(work_root.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    async fn run(&self, work_root: &Path) -> Result<SyncStats> {
        let mut manifest = Manifest::load(work_root).await;
        let mut stats = SyncStats::default();

        let remote = self.storage.list(&self.config.prefix).await?;
        stats.scanned_remote = remote.len() as u64;

        let remote_by_name: HashMap<String, ObjectMeta> = remote
            .iter()
            .map(|meta| (meta.name.clone(), meta.clone()))
            .collect();

        self.download_pass(work_root, &remote, &mut manifest, &mut stats)
            .await?;

        if self.config.uploads_enabled {
            self.upload_pass(work_root, &remote_by_name, &mut manifest, &mut stats)
                .await?;
        }

        manifest.save(work_root).await?;
        tracing::info!(
            work_root = %work_root.display(),
            scanned_remote = stats.scanned_remote,
            downloaded = stats.downloaded,
            uploaded = stats.uploaded,
            conflicts = stats.conflicts,
            "Sync run complete"
        );
        Ok(stats)
    }

    async fn download_pass(
        &self,
        work_root: &Path,
        remote: &[ObjectMeta],
        manifest: &mut Manifest,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let root = WorkRoot::from_path(work_root);

        let mut pending = Vec::new();
        for meta in remote {
            if meta.is_folder() {
                continue;
            }
            let Some(rel) = self.relative_name(&meta.name) else {
                continue;
            };
            if rel == MANIFEST_FILE {
                continue;
            }
            let changed = manifest
                .get(&meta.name)
                .is_none_or(|entry| entry.remote_gen != meta.generation);
            if !changed {
                continue;
            }
            let Ok(local_path) = root.resolve(&rel) else {
                tracing::warn!(object = %meta.name, "Remote object name escapes work root, skipping");
                continue;
            };

            // Both sides moved: the local edit is about to be replaced.
            if let Some(entry) = manifest.get(&meta.name) {
                if let Some((mtime, size)) = local_stats(&local_path).await {
                    if mtime != entry.local_mtime || size != entry.local_size {
                        stats.conflicts += 1;
                    }
                }
            }

            pending.push((meta.clone(), local_path));
        }

        let storage = Arc::clone(&self.storage);
        let results: Vec<Result<(String, String, PathBuf)>> = stream::iter(pending)
            .map(|(meta, local_path)| {
                let storage = Arc::clone(&storage);
                async move {
                    let data = storage.get(&meta.name).await?;
                    if let Some(parent) = local_path.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| Error::storage_with_source("create parent", e))?;
                    }
                    tokio::fs::write(&local_path, &data)
                        .await
                        .map_err(|e| Error::storage_with_source("write download", e))?;
                    Ok((meta.name, meta.generation, local_path))
                }
            })
            .buffer_unordered(self.config.download_concurrency.max(1))
            .collect()
            .await;

        for result in results {
            let (name, generation, local_path) = result?;
            let (local_mtime, local_size) = local_stats(&local_path).await.unwrap_or((0, 0));
            manifest.insert(
                name,
                ManifestEntry {
                    remote_gen: generation,
                    local_mtime,
                    local_size,
                },
            );
            stats.downloaded += 1;
        }

        Ok(())
    }

    async fn upload_pass(
        &self,
        work_root: &Path,
        remote_by_name: &HashMap<String, ObjectMeta>,
        manifest: &mut Manifest,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let files = walk_files(work_root).await?;

        let mut pending = Vec::new();
        for rel in files {
            if rel == MANIFEST_FILE || rel.ends_with(".tmp") {
                continue;
            }
            let object_name = self.object_name(&rel);
            let local_path = work_root.join(&rel);
            let Some((local_mtime, local_size)) = local_stats(&local_path).await else {
                continue;
            };

            let entry = manifest.get(&object_name);
            if entry.is_some_and(|e| e.local_mtime == local_mtime && e.local_size == local_size) {
                continue;
            }

            let remote = remote_by_name.get(&object_name);
            match (entry, remote) {
                (Some(entry), Some(meta)) if meta.generation != entry.remote_gen => {
                    stats.conflicts += 1;
                    continue;
                }
                (None, Some(_)) => {
                    stats.conflicts += 1;
                    continue;
                }
                _ => {}
            }

            let precondition = match entry {
                Some(entry) => PutPrecondition::GenerationMatches(entry.remote_gen.clone()),
                None => PutPrecondition::DoesNotExist,
            };
            pending.push((object_name, local_path, local_mtime, local_size, precondition));
        }

        enum UploadOutcome {
            Uploaded {
                object_name: String,
                generation: String,
                local_mtime: i64,
                local_size: u64,
            },
            Conflict,
        }

        let storage = Arc::clone(&self.storage);
        let results: Vec<UploadOutcome> = stream::iter(pending)
            .map(
                |(object_name, local_path, local_mtime, local_size, precondition)| {
                    let storage = Arc::clone(&storage);
                    async move {
                        let data = match tokio::fs::read(&local_path).await {
                            Ok(data) => data,
                            Err(e) => {
                                tracing::warn!(
                                    object = %object_name,
                                    error = %e,
                                    "Skipping upload, local file unreadable"
                                );
                                return UploadOutcome::Conflict;
                            }
                        };
                        match storage.put(&object_name, data.into(), precondition).await {
                            Ok(PutResult::Success { generation }) => UploadOutcome::Uploaded {
                                object_name,
                                generation,
                                local_mtime,
                                local_size,
                            },
                            Ok(PutResult::PreconditionFailed { .. }) => UploadOutcome::Conflict,
                            // Narrowed credentials without create permission land
                            // here; other objects continue.
                            Err(e) => {
                                tracing::warn!(object = %object_name, error = %e, "Upload failed");
                                UploadOutcome::Conflict
                            }
                        }
                    }
                },
            )
            .buffer_unordered(self.config.upload_concurrency.max(1))
            .collect()
            .await;

        for outcome in results {
            match outcome {
                UploadOutcome::Uploaded {
                    object_name,
                    generation,
                    local_mtime,
                    local_size,
                } => {
                    manifest.insert(
                        object_name,
                        ManifestEntry {
                            remote_gen: generation,
                            local_mtime,
                            local_size,
                        },
                    );
                    stats.uploaded += 1;
                }
                UploadOutcome::Conflict => stats.conflicts += 1,
            }
        }

        Ok(())
    }

    fn object_name(&self, rel: &str) -> String {
        let prefix = self.config.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            rel.to_string()
        } else {
            format!("{prefix}/{rel}")
        }
    }

    fn relative_name(&self, object_name: &str) -> Option<String> {
        let prefix = self.config.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Some(object_name.to_string());
        }
        object_name
            .strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .filter(|rest| !rest.is_empty())
    }
}

async fn local_stats(path: &Path) -> Option<(i64, u64)> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let mtime = metadata
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_millis() as i64;
    Some((mtime, metadata.len()))
}

/// Walks the work root, returning file paths relative to it.
async fn walk_files(work_root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut stack = vec![work_root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::storage_with_source("walk work root", e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::storage_with_source("walk work root", e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| Error::storage_with_source("walk work root", e))?;
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(work_root) {
                    files.push(rel.to_string_lossy().into_owned());
                }
            }
        }
    }

    Ok(files)
}
