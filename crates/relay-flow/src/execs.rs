//! Workflow execution lineage: registrations, links, statuses, and trees.
//!
//! Three document families per `(userId, projectId)` scope:
//!
//! - **ExecReg** - one row per workflow execution, keyed by `execId`, with a
//!   best-effort mirror of the latest status
//! - **ExecStatus** - the full status document, upserted on reports,
//!   `createdAt` preserved across writes
//! - **ExecLink** - parent/child edges keyed `{callingExecId}:{triggeredExecId}`,
//!   idempotent and stable after creation
//!
//! The exec tree is derived: children are grouped by `callingExec` and
//! ordered by link `createdAt`, roots are execs never triggered by another,
//! and cycles are guarded by a visited set with a newest-exec fallback.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_core::docstore::{update, DocStore, WritePrecondition};
use relay_core::Scope;

use crate::error::{Error, Result};

const REG_COLLECTION: &str = "exec-regs";
const STATUS_COLLECTION: &str = "exec-statuses";
const LINK_COLLECTION: &str = "exec-links";

/// Status reported for execs with no status document.
pub const STATUS_UNKNOWN: &str = "UNKNOWN";

/// Default number of rows returned by latest-status queries.
pub const DEFAULT_STATUS_LIMIT: usize = 5;

/// Upper bound on latest-status query size.
pub const MAX_STATUS_LIMIT: usize = 50;

/// A workflow execution registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecReg {
    /// The execution identifier.
    pub exec_id: String,
    /// The session this exec belongs to.
    pub session_id: String,
    /// When the exec was registered.
    pub created_at: DateTime<Utc>,
    /// Mirrored status, best-effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Mirrored terminal flag, best-effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<bool>,
    /// Mirrored status timestamp, best-effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A workflow execution status document.
///
/// The status vocabulary is an open set owned by the upstream; this registry
/// stores whatever it is given.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecStatus {
    /// Reported status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Reported result payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Reported error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Whether the exec reached a terminal state.
    #[serde(default)]
    pub ended: bool,
    /// First report time, preserved across upserts.
    pub created_at: DateTime<Utc>,
    /// Last report time.
    pub updated_at: DateTime<Utc>,
    /// Workflow descriptor attached by the upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Value>,
}

/// A parent/child edge between two execs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecLink {
    /// The exec that triggered the child.
    pub calling_exec: String,
    /// The exec that was triggered.
    pub triggered_exec: String,
    /// The session both execs belong to.
    pub session_id: String,
    /// When the link was registered.
    pub created_at: DateTime<Utc>,
}

/// Fields of a status report. At least one must be present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    /// New status value.
    #[serde(default)]
    pub status: Option<String>,
    /// New result payload.
    #[serde(default)]
    pub result: Option<Value>,
    /// New error payload.
    #[serde(default)]
    pub error: Option<Value>,
    /// New terminal flag.
    #[serde(default)]
    pub ended: Option<bool>,
    /// Explicit report timestamp; defaults to now.
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    /// Workflow descriptor.
    #[serde(default)]
    pub workflow: Option<Value>,
}

impl StatusUpdate {
    /// Returns true when no field is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.result.is_none()
            && self.error.is_none()
            && self.ended.is_none()
            && self.updated.is_none()
            && self.workflow.is_none()
    }
}

/// One row of a latest-statuses query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecStatusView {
    /// The execution identifier.
    pub exec_id: String,
    /// The session this exec belongs to.
    pub session_id: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Merged status, `UNKNOWN` when no status document exists.
    pub status: String,
    /// Terminal flag from the status document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended: Option<bool>,
    /// Result payload from the status document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload, or the fetch failure for this row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// A node of the derived exec tree.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecNode {
    /// The execution identifier.
    pub exec_id: String,
    /// The session this exec belongs to.
    pub session_id: String,
    /// Registration time.
    pub created_at: DateTime<Utc>,
    /// Mirrored status, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Mirrored terminal flag, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended: Option<bool>,
    /// Children ordered by link creation time.
    pub children: Vec<ExecNode>,
}

/// Persists and derives workflow execution lineage.
#[derive(Clone)]
pub struct ExecRegistry {
    docs: Arc<dyn DocStore>,
}

impl ExecRegistry {
    /// Creates a registry over the given store.
    #[must_use]
    pub fn new(docs: Arc<dyn DocStore>) -> Self {
        Self { docs }
    }

    fn validate_exec_id(exec_id: &str) -> Result<()> {
        if exec_id.is_empty() || exec_id.contains('/') || exec_id.contains(':') {
            return Err(Error::invalid_request(format!(
                "invalid exec id: '{exec_id}'"
            )));
        }
        Ok(())
    }

    /// Registers an exec for a session. Idempotent: an existing registration
    /// is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid ids or an unavailable store.
    pub async fn register(
        &self,
        scope: &Scope,
        exec_id: &str,
        session_id: &str,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<ExecReg> {
        Self::validate_exec_id(exec_id)?;

        let reg = ExecReg {
            exec_id: exec_id.to_string(),
            session_id: session_id.to_string(),
            created_at: created_at.unwrap_or_else(Utc::now),
            status: None,
            ended: None,
            updated_at: None,
        };
        let key = scope.doc_key(REG_COLLECTION, exec_id);
        let value = to_value(&reg)?;

        match self
            .docs
            .put(&key, value, WritePrecondition::DoesNotExist)
            .await
            .map_err(Error::Core)?
        {
            relay_core::docstore::WriteResult::Success { .. } => Ok(reg),
            relay_core::docstore::WriteResult::PreconditionFailed { .. } => {
                match self.docs.get(&key).await.map_err(Error::Core)? {
                    Some(doc) => from_value(doc.value),
                    None => Ok(reg),
                }
            }
        }
    }

    /// Registers a parent/child link. Idempotent upsert at
    /// `{callingExecId}:{triggeredExecId}`; an existing link is stable.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid ids or an unavailable store.
    pub async fn link_register(
        &self,
        scope: &Scope,
        calling_exec: &str,
        triggered_exec: &str,
        session_id: &str,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<ExecLink> {
        Self::validate_exec_id(calling_exec)?;
        Self::validate_exec_id(triggered_exec)?;

        let key = scope.doc_key(
            LINK_COLLECTION,
            &format!("{calling_exec}:{triggered_exec}"),
        );
        let link = ExecLink {
            calling_exec: calling_exec.to_string(),
            triggered_exec: triggered_exec.to_string(),
            session_id: session_id.to_string(),
            created_at: created_at.unwrap_or_else(Utc::now),
        };
        let fresh = to_value(&link)?;

        let doc = update(self.docs.as_ref(), &key, |current| match current {
            Some(existing) => Ok(existing.clone()),
            None => Ok(fresh.clone()),
        })
        .await
        .map_err(Error::Core)?;

        from_value(doc.value)
    }

    /// Returns links triggered by `calling_exec_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable.
    pub async fn links_by_calling(
        &self,
        scope: &Scope,
        calling_exec_id: &str,
    ) -> Result<Vec<ExecLink>> {
        let mut links: Vec<ExecLink> = self
            .docs
            .query(
                &scope.collection_prefix(LINK_COLLECTION),
                "callingExec",
                &Value::String(calling_exec_id.to_string()),
            )
            .await
            .map_err(Error::Core)?
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc.value).ok())
            .collect();
        links.sort_by_key(|link: &ExecLink| link.created_at);
        Ok(links)
    }

    /// Returns the link that triggered `triggered_exec_id`, newest when
    /// multiple exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable.
    pub async fn link_by_triggered(
        &self,
        scope: &Scope,
        triggered_exec_id: &str,
    ) -> Result<Option<ExecLink>> {
        let mut links: Vec<ExecLink> = self
            .docs
            .query(
                &scope.collection_prefix(LINK_COLLECTION),
                "triggeredExec",
                &Value::String(triggered_exec_id.to_string()),
            )
            .await
            .map_err(Error::Core)?
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc.value).ok())
            .collect();
        links.sort_by_key(|link: &ExecLink| std::cmp::Reverse(link.created_at));
        Ok(links.into_iter().next())
    }

    /// Upserts a status report for an exec.
    ///
    /// `createdAt` is preserved on upsert, `updatedAt` defaults to now, and
    /// an update with no fields is rejected. The matching ExecReg is
    /// mirrored best-effort; mirror failures are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns an error for empty updates, invalid ids, or an unavailable
    /// store.
    pub async fn status_update(
        &self,
        scope: &Scope,
        exec_id: &str,
        report: &StatusUpdate,
    ) -> Result<ExecStatus> {
        Self::validate_exec_id(exec_id)?;
        if report.is_empty() {
            return Err(Error::invalid_request(
                "status update requires at least one field",
            ));
        }

        let key = scope.doc_key(STATUS_COLLECTION, exec_id);
        let updated_at = report.updated.unwrap_or_else(Utc::now);

        let doc = update(self.docs.as_ref(), &key, |current| {
            let mut status: ExecStatus = match current {
                Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                    relay_core::Error::serialization(format!("parse exec status: {e}"))
                })?,
                None => ExecStatus {
                    status: None,
                    result: None,
                    error: None,
                    ended: false,
                    created_at: updated_at,
                    updated_at,
                    workflow: None,
                },
            };

            if let Some(value) = &report.status {
                status.status = Some(value.clone());
            }
            if let Some(value) = &report.result {
                status.result = Some(value.clone());
            }
            if let Some(value) = &report.error {
                status.error = Some(value.clone());
            }
            if let Some(value) = report.ended {
                status.ended = value;
            }
            if let Some(value) = &report.workflow {
                status.workflow = Some(value.clone());
            }
            status.updated_at = updated_at;

            serde_json::to_value(&status)
                .map_err(|e| relay_core::Error::serialization(format!("serialize exec status: {e}")))
        })
        .await
        .map_err(Error::Core)?;

        let status: ExecStatus = from_value(doc.value)?;
        self.mirror_onto_reg(scope, exec_id, &status).await;
        Ok(status)
    }

    /// Best-effort mirror of `{status, ended, updatedAt}` onto the ExecReg.
    async fn mirror_onto_reg(&self, scope: &Scope, exec_id: &str, status: &ExecStatus) {
        let key = scope.doc_key(REG_COLLECTION, exec_id);
        let result = update(self.docs.as_ref(), &key, |current| {
            let Some(current) = current else {
                return Err(relay_core::Error::resource_not_found("exec", exec_id));
            };
            let mut reg: ExecReg = serde_json::from_value(current.clone())
                .map_err(|e| relay_core::Error::serialization(format!("parse exec reg: {e}")))?;
            reg.status.clone_from(&status.status);
            reg.ended = Some(status.ended);
            reg.updated_at = Some(status.updated_at);
            serde_json::to_value(&reg)
                .map_err(|e| relay_core::Error::serialization(format!("serialize exec reg: {e}")))
        })
        .await;

        if let Err(e) = result {
            tracing::debug!(exec_id, error = %e, "Status mirror onto exec reg skipped");
        }
    }

    /// Returns the newest `limit` exec rows for a session, each merged with
    /// its status document.
    ///
    /// A row whose status fetch fails is returned with `UNKNOWN` status and
    /// the failure attached, not dropped.
    ///
    /// # Errors
    ///
    /// Returns an error when the registration query fails.
    pub async fn latest_statuses(
        &self,
        scope: &Scope,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<ExecStatusView>> {
        let limit = limit.clamp(1, MAX_STATUS_LIMIT);
        let mut regs = self.session_regs(scope, session_id).await?;
        regs.sort_by_key(|reg| std::cmp::Reverse(reg.created_at));
        regs.truncate(limit);

        let mut views = Vec::with_capacity(regs.len());
        for reg in regs {
            let key = scope.doc_key(STATUS_COLLECTION, &reg.exec_id);
            let view = match self.docs.get(&key).await {
                Ok(Some(doc)) => match serde_json::from_value::<ExecStatus>(doc.value) {
                    Ok(status) => ExecStatusView {
                        exec_id: reg.exec_id,
                        session_id: reg.session_id,
                        created_at: reg.created_at,
                        status: status
                            .status
                            .unwrap_or_else(|| STATUS_UNKNOWN.to_string()),
                        ended: Some(status.ended),
                        result: status.result,
                        error: status.error,
                    },
                    Err(e) => unknown_view(reg, Some(format!("malformed status: {e}"))),
                },
                Ok(None) => unknown_view(reg, None),
                Err(e) => unknown_view(reg, Some(e.to_string())),
            };
            views.push(view);
        }

        Ok(views)
    }

    /// Builds the exec forest for a session.
    ///
    /// Children are ordered by link `createdAt` ascending; roots are execs
    /// that no link triggers, with a newest-exec fallback when every exec is
    /// triggered (cycles). `latest_only` returns the single tree rooted at
    /// the newest exec.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying queries fail.
    pub async fn tree(
        &self,
        scope: &Scope,
        session_id: &str,
        latest_only: bool,
    ) -> Result<Vec<ExecNode>> {
        let regs = self.session_regs(scope, session_id).await?;
        let links = self.session_links(scope, session_id).await?;

        let regs_by_id: HashMap<String, ExecReg> = regs
            .iter()
            .map(|reg| (reg.exec_id.clone(), reg.clone()))
            .collect();

        let mut children_by_calling: HashMap<String, Vec<ExecLink>> = HashMap::new();
        for link in &links {
            children_by_calling
                .entry(link.calling_exec.clone())
                .or_default()
                .push(link.clone());
        }
        for children in children_by_calling.values_mut() {
            children.sort_by_key(|link| link.created_at);
        }

        let roots: Vec<&ExecReg> = if latest_only {
            regs.iter()
                .max_by_key(|reg| reg.created_at)
                .into_iter()
                .collect()
        } else {
            let triggered: HashSet<&str> =
                links.iter().map(|link| link.triggered_exec.as_str()).collect();
            let mut roots: Vec<&ExecReg> = regs
                .iter()
                .filter(|reg| !triggered.contains(reg.exec_id.as_str()))
                .collect();
            if roots.is_empty() {
                // Cycle fallback: root the forest at the newest exec.
                roots = regs.iter().max_by_key(|reg| reg.created_at).into_iter().collect();
            }
            roots.sort_by_key(|reg| std::cmp::Reverse(reg.created_at));
            roots
        };

        let mut visited = HashSet::new();
        let forest = roots
            .into_iter()
            .filter_map(|reg| {
                build_node(&reg.exec_id, &regs_by_id, &children_by_calling, &mut visited)
            })
            .collect();
        Ok(forest)
    }

    async fn session_regs(&self, scope: &Scope, session_id: &str) -> Result<Vec<ExecReg>> {
        Ok(self
            .docs
            .query(
                &scope.collection_prefix(REG_COLLECTION),
                "sessionId",
                &Value::String(session_id.to_string()),
            )
            .await
            .map_err(Error::Core)?
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc.value).ok())
            .collect())
    }

    async fn session_links(&self, scope: &Scope, session_id: &str) -> Result<Vec<ExecLink>> {
        Ok(self
            .docs
            .query(
                &scope.collection_prefix(LINK_COLLECTION),
                "sessionId",
                &Value::String(session_id.to_string()),
            )
            .await
            .map_err(Error::Core)?
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc.value).ok())
            .collect())
    }
}

fn unknown_view(reg: ExecReg, error: Option<String>) -> ExecStatusView {
    ExecStatusView {
        exec_id: reg.exec_id,
        session_id: reg.session_id,
        created_at: reg.created_at,
        status: STATUS_UNKNOWN.to_string(),
        ended: reg.ended,
        result: None,
        error: error.map(Value::String),
    }
}

fn build_node(
    exec_id: &str,
    regs_by_id: &HashMap<String, ExecReg>,
    children_by_calling: &HashMap<String, Vec<ExecLink>>,
    visited: &mut HashSet<String>,
) -> Option<ExecNode> {
    let reg = regs_by_id.get(exec_id)?;
    if !visited.insert(exec_id.to_string()) {
        return None;
    }

    let children = children_by_calling
        .get(exec_id)
        .map(|links| {
            links
                .iter()
                .filter_map(|link| {
                    build_node(&link.triggered_exec, regs_by_id, children_by_calling, visited)
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ExecNode {
        exec_id: reg.exec_id.clone(),
        session_id: reg.session_id.clone(),
        created_at: reg.created_at,
        status: reg.status.clone(),
        ended: reg.ended,
        children,
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::serialization(format!("serialize doc: {e}")))
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::serialization(format!("parse doc: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::docstore::MemoryDocStore;
    use serde_json::json;

    fn registry() -> ExecRegistry {
        ExecRegistry::new(Arc::new(MemoryDocStore::new()))
    }

    fn scope() -> Scope {
        Scope::new("u1", "p1").expect("scope")
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).expect("timestamp")
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let registry = registry();
        let first = registry
            .register(&scope(), "A", "s1", Some(at(0)))
            .await
            .expect("register");
        let second = registry
            .register(&scope(), "A", "s1", Some(at(100)))
            .await
            .expect("re-register");

        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn link_register_is_idempotent_and_stable() {
        let registry = registry();
        let first = registry
            .link_register(&scope(), "A", "B", "s1", Some(at(0)))
            .await
            .expect("link");
        let second = registry
            .link_register(&scope(), "A", "B", "s1", Some(at(100)))
            .await
            .expect("relink");

        assert_eq!(first.created_at, second.created_at);

        let by_calling = registry
            .links_by_calling(&scope(), "A")
            .await
            .expect("by calling");
        assert_eq!(by_calling.len(), 1);
        assert_eq!(by_calling[0].triggered_exec, "B");
    }

    #[tokio::test]
    async fn link_by_triggered_picks_newest() {
        let registry = registry();
        registry
            .link_register(&scope(), "A", "C", "s1", Some(at(0)))
            .await
            .expect("older");
        registry
            .link_register(&scope(), "B", "C", "s1", Some(at(10)))
            .await
            .expect("newer");

        let link = registry
            .link_by_triggered(&scope(), "C")
            .await
            .expect("query")
            .expect("link");
        assert_eq!(link.calling_exec, "B");
    }

    #[tokio::test]
    async fn status_update_preserves_created_at_and_mirrors() {
        let registry = registry();
        registry
            .register(&scope(), "A", "s1", Some(at(0)))
            .await
            .expect("register");

        let first = registry
            .status_update(
                &scope(),
                "A",
                &StatusUpdate {
                    status: Some("RUNNING".into()),
                    updated: Some(at(1)),
                    ..StatusUpdate::default()
                },
            )
            .await
            .expect("first update");

        let second = registry
            .status_update(
                &scope(),
                "A",
                &StatusUpdate {
                    status: Some("SUCCEEDED".into()),
                    ended: Some(true),
                    result: Some(json!({"answer": 42})),
                    updated: Some(at(2)),
                    ..StatusUpdate::default()
                },
            )
            .await
            .expect("second update");

        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.status.as_deref(), Some("SUCCEEDED"));
        assert!(second.ended);

        let views = registry
            .latest_statuses(&scope(), "s1", 5)
            .await
            .expect("latest");
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].status, "SUCCEEDED");
        assert_eq!(views[0].ended, Some(true));
    }

    #[tokio::test]
    async fn empty_status_update_is_rejected() {
        let registry = registry();
        let result = registry
            .status_update(&scope(), "A", &StatusUpdate::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn status_update_without_reg_still_persists() {
        let registry = registry();
        let status = registry
            .status_update(
                &scope(),
                "orphan",
                &StatusUpdate {
                    status: Some("RUNNING".into()),
                    ..StatusUpdate::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(status.status.as_deref(), Some("RUNNING"));
    }

    #[tokio::test]
    async fn latest_statuses_fills_unknown() {
        let registry = registry();
        registry
            .register(&scope(), "A", "s1", Some(at(0)))
            .await
            .expect("register");

        let views = registry
            .latest_statuses(&scope(), "s1", 5)
            .await
            .expect("latest");
        assert_eq!(views[0].status, STATUS_UNKNOWN);
    }

    #[tokio::test]
    async fn latest_statuses_orders_newest_first_and_limits() {
        let registry = registry();
        for (i, id) in ["A", "B", "C"].iter().enumerate() {
            registry
                .register(&scope(), id, "s1", Some(at(i as i64)))
                .await
                .expect("register");
        }

        let views = registry
            .latest_statuses(&scope(), "s1", 2)
            .await
            .expect("latest");
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].exec_id, "C");
        assert_eq!(views[1].exec_id, "B");
    }

    #[tokio::test]
    async fn tree_builds_forest_with_unknown_children_dropped() {
        let registry = registry();
        for (i, id) in ["A", "B", "C"].iter().enumerate() {
            registry
                .register(&scope(), id, "s1", Some(at(i as i64)))
                .await
                .expect("register");
        }
        registry
            .link_register(&scope(), "A", "B", "s1", Some(at(10)))
            .await
            .expect("A->B");
        registry
            .link_register(&scope(), "A", "C", "s1", Some(at(11)))
            .await
            .expect("A->C");
        // D has no registration; the link exists but the child is unknown.
        registry
            .link_register(&scope(), "C", "D", "s1", Some(at(12)))
            .await
            .expect("C->D");

        let forest = registry.tree(&scope(), "s1", false).await.expect("tree");
        assert_eq!(forest.len(), 1);

        let root = &forest[0];
        assert_eq!(root.exec_id, "A");
        let child_ids: Vec<&str> = root.children.iter().map(|c| c.exec_id.as_str()).collect();
        assert_eq!(child_ids, vec!["B", "C"]);

        let c = &root.children[1];
        assert!(c.children.is_empty());
    }

    #[tokio::test]
    async fn tree_latest_only_roots_at_newest() {
        let registry = registry();
        for (i, id) in ["A", "B"].iter().enumerate() {
            registry
                .register(&scope(), id, "s1", Some(at(i as i64)))
                .await
                .expect("register");
        }
        registry
            .link_register(&scope(), "A", "B", "s1", Some(at(10)))
            .await
            .expect("A->B");

        let forest = registry.tree(&scope(), "s1", true).await.expect("tree");
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].exec_id, "B");
    }

    #[tokio::test]
    async fn tree_cycle_falls_back_to_newest() {
        let registry = registry();
        for (i, id) in ["A", "B"].iter().enumerate() {
            registry
                .register(&scope(), id, "s1", Some(at(i as i64)))
                .await
                .expect("register");
        }
        registry
            .link_register(&scope(), "A", "B", "s1", Some(at(10)))
            .await
            .expect("A->B");
        registry
            .link_register(&scope(), "B", "A", "s1", Some(at(11)))
            .await
            .expect("B->A");

        let forest = registry.tree(&scope(), "s1", false).await.expect("tree");
        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].exec_id, "B");
        // The visited guard stops the cycle from recursing forever.
        assert_eq!(forest[0].children.len(), 1);
        assert!(forest[0].children[0].children.is_empty());
    }

    #[tokio::test]
    async fn invalid_exec_ids_are_rejected() {
        let registry = registry();
        assert!(registry
            .register(&scope(), "has/slash", "s1", None)
            .await
            .is_err());
        assert!(registry
            .register(&scope(), "has:colon", "s1", None)
            .await
            .is_err());
        assert!(registry.register(&scope(), "", "s1", None).await.is_err());
    }
}
