//! Workspace registrations and heartbeats.
//!
//! A workspace names the object-store scope a sandbox mirrors. Workspaces
//! are registered per `(userId, projectId)` and optionally pinned to a
//! session; a workspace with no session is project-wide. Liveness is a
//! heartbeat: a workspace is live while `now - liveAt <= ttl`, and `liveAt`
//! never decreases.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use relay_core::docstore::{update, DocStore, WritePrecondition, WriteResult};
use relay_core::{Scope, WorkspaceId};

use crate::error::{Error, Result};

/// Default workspace liveness TTL (5 minutes).
pub const DEFAULT_WORKSPACE_TTL: Duration = Duration::from_secs(300);

const WORKSPACE_COLLECTION: &str = "workspaces";

/// A workspace document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    /// The workspace identifier.
    pub workspace_id: WorkspaceId,
    /// The owning project.
    pub project_id: String,
    /// Session the workspace serves; `None` means project-wide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// When the workspace was registered.
    pub created_at: DateTime<Utc>,
    /// Last heartbeat.
    pub live_at: DateTime<Utc>,
}

impl Workspace {
    /// Returns whether the workspace is live at `now` for the given TTL.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let elapsed = now.signed_duration_since(self.live_at);
        elapsed.num_milliseconds() <= ttl.as_millis() as i64
    }
}

/// Manages workspace documents over the metadata store.
#[derive(Clone)]
pub struct WorkspaceRegistry {
    docs: Arc<dyn DocStore>,
}

impl WorkspaceRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub fn new(docs: Arc<dyn DocStore>) -> Self {
        Self { docs }
    }

    fn key(scope: &Scope, workspace_id: &WorkspaceId) -> String {
        scope.doc_key(WORKSPACE_COLLECTION, &workspace_id.to_string())
    }

    /// Resolves a live workspace for `(projectId, sessionId?)`, creating one
    /// when none is live.
    ///
    /// The newest live workspace with a matching session wins; a stale one
    /// is replaced by a fresh registration rather than resurrected.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable.
    pub async fn resolve_or_create(
        &self,
        scope: &Scope,
        session_id: Option<&str>,
        ttl: Duration,
    ) -> Result<Workspace> {
        let now = Utc::now();
        let mut live: Vec<Workspace> = self
            .docs
            .list(&scope.collection_prefix(WORKSPACE_COLLECTION))
            .await
            .map_err(Error::Core)?
            .into_iter()
            .filter_map(|doc| serde_json::from_value::<Workspace>(doc.value).ok())
            .filter(|ws| ws.session_id.as_deref() == session_id)
            .filter(|ws| ws.is_live_at(now, ttl))
            .collect();

        live.sort_by_key(|ws| std::cmp::Reverse(ws.live_at));
        if let Some(existing) = live.into_iter().next() {
            self.heartbeat(scope, &existing.workspace_id).await?;
            return Ok(existing);
        }

        let workspace = Workspace {
            workspace_id: WorkspaceId::generate(),
            project_id: scope.project_id().to_string(),
            session_id: session_id.map(str::to_string),
            created_at: now,
            live_at: now,
        };
        self.register(scope, &workspace).await?;
        Ok(workspace)
    }

    /// Registers a workspace document (create-only).
    ///
    /// # Errors
    ///
    /// Returns a conflict error when the id is already registered.
    pub async fn register(&self, scope: &Scope, workspace: &Workspace) -> Result<()> {
        let value = serde_json::to_value(workspace)
            .map_err(|e| Error::serialization(format!("serialize workspace: {e}")))?;

        match self
            .docs
            .put(
                &Self::key(scope, &workspace.workspace_id),
                value,
                WritePrecondition::DoesNotExist,
            )
            .await
            .map_err(Error::Core)?
        {
            WriteResult::Success { .. } => Ok(()),
            WriteResult::PreconditionFailed { .. } => Err(Error::Core(
                relay_core::Error::conflict(format!(
                    "workspace already registered: {}",
                    workspace.workspace_id
                )),
            )),
        }
    }

    /// Reads a workspace by id.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable.
    pub async fn get(&self, scope: &Scope, workspace_id: &WorkspaceId) -> Result<Option<Workspace>> {
        match self
            .docs
            .get(&Self::key(scope, workspace_id))
            .await
            .map_err(Error::Core)?
        {
            Some(doc) => Ok(Some(serde_json::from_value(doc.value).map_err(|e| {
                Error::serialization(format!("parse workspace: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    /// Bumps `liveAt` to now. Monotonic: a lagging clock never moves the
    /// heartbeat backwards.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown workspaces.
    pub async fn heartbeat(&self, scope: &Scope, workspace_id: &WorkspaceId) -> Result<Workspace> {
        let key = Self::key(scope, workspace_id);
        let doc = update(self.docs.as_ref(), &key, |current| {
            let Some(current) = current else {
                return Err(relay_core::Error::resource_not_found(
                    "workspace",
                    workspace_id,
                ));
            };
            let mut workspace: Workspace = serde_json::from_value(current.clone())
                .map_err(|e| relay_core::Error::serialization(format!("parse workspace: {e}")))?;
            let now = Utc::now();
            if now > workspace.live_at {
                workspace.live_at = now;
            }
            serde_json::to_value(&workspace)
                .map_err(|e| relay_core::Error::serialization(format!("serialize workspace: {e}")))
        })
        .await
        .map_err(Error::Core)?;

        serde_json::from_value::<Workspace>(doc.value)
            .map_err(|e| Error::serialization(format!("parse workspace: {e}")))
    }

    /// Lists all workspaces for a scope (diagnostics).
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable.
    pub async fn list(&self, scope: &Scope) -> Result<Vec<Workspace>> {
        Ok(self
            .docs
            .list(&scope.collection_prefix(WORKSPACE_COLLECTION))
            .await
            .map_err(Error::Core)?
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc.value).ok())
            .collect())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::docstore::MemoryDocStore;

    fn registry() -> WorkspaceRegistry {
        WorkspaceRegistry::new(Arc::new(MemoryDocStore::new()))
    }

    fn scope() -> Scope {
        Scope::new("u1", "p1").expect("scope")
    }

    #[tokio::test]
    async fn resolve_creates_then_reuses() {
        let registry = registry();

        let first = registry
            .resolve_or_create(&scope(), Some("s1"), DEFAULT_WORKSPACE_TTL)
            .await
            .expect("create");
        let second = registry
            .resolve_or_create(&scope(), Some("s1"), DEFAULT_WORKSPACE_TTL)
            .await
            .expect("reuse");

        assert_eq!(first.workspace_id, second.workspace_id);
    }

    #[tokio::test]
    async fn sessions_do_not_share_workspaces() {
        let registry = registry();

        let s1 = registry
            .resolve_or_create(&scope(), Some("s1"), DEFAULT_WORKSPACE_TTL)
            .await
            .expect("s1");
        let s2 = registry
            .resolve_or_create(&scope(), Some("s2"), DEFAULT_WORKSPACE_TTL)
            .await
            .expect("s2");
        let project_wide = registry
            .resolve_or_create(&scope(), None, DEFAULT_WORKSPACE_TTL)
            .await
            .expect("project-wide");

        assert_ne!(s1.workspace_id, s2.workspace_id);
        assert_ne!(s1.workspace_id, project_wide.workspace_id);
        assert!(project_wide.session_id.is_none());
    }

    #[tokio::test]
    async fn stale_workspace_is_replaced() {
        let registry = registry();

        let first = registry
            .resolve_or_create(&scope(), Some("s1"), Duration::from_millis(1))
            .await
            .expect("create");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = registry
            .resolve_or_create(&scope(), Some("s1"), Duration::from_millis(1))
            .await
            .expect("replace");
        assert_ne!(first.workspace_id, second.workspace_id);
    }

    #[tokio::test]
    async fn heartbeat_is_monotonic() {
        let registry = registry();
        let workspace = registry
            .resolve_or_create(&scope(), None, DEFAULT_WORKSPACE_TTL)
            .await
            .expect("create");

        tokio::time::sleep(Duration::from_millis(5)).await;
        let bumped = registry
            .heartbeat(&scope(), &workspace.workspace_id)
            .await
            .expect("heartbeat");
        assert!(bumped.live_at >= workspace.live_at);
    }

    #[tokio::test]
    async fn heartbeat_unknown_workspace_is_not_found() {
        let registry = registry();
        let missing = WorkspaceId::generate();
        assert!(registry.heartbeat(&scope(), &missing).await.is_err());
    }
}
