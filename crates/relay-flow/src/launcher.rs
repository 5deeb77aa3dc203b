//! Producer orchestration: start, stop, and the exit monitor.
//!
//! A start request resolves a workspace, acquires the consumer lock, brings
//! up the producer (and optionally a consumer sidecar), persists the runtime
//! descriptor on the lock, and installs an exit monitor that tears the pair
//! down and releases the lock when the producer terminates.
//!
//! Failure discipline: any failure between lock acquisition and a
//! successful producer start cleans up partial containers (best-effort) and
//! releases the lock owner-scoped. The lock is never orphaned by a clean
//! error path.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use relay_core::{ConsumerId, Scope, WorkspaceId};

use crate::error::{Error, Result};
use crate::lock::{
    AcquireOutcome, ConsumerLock, ConsumerType, LockConflict, LockManager, DEFAULT_LEASE_MS,
};
use crate::runtime::{
    container_name, ContainerRuntime, ContainerSpec, JobLauncher, JobSpec,
};
use crate::workspace::{WorkspaceRegistry, DEFAULT_WORKSPACE_TTL};

/// Container name prefix for consumer sidecars.
pub const CONSUMER_NAME_PREFIX: &str = "sse-consumer-";

/// Container name prefix for producers.
pub const PRODUCER_NAME_PREFIX: &str = "producer-";

/// How a producer/consumer pair is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaunchMode {
    /// Local containers on this host.
    #[serde(rename = "local-sandbox")]
    LocalSandbox,
    /// A remote job execution.
    #[serde(rename = "remote-job")]
    RemoteJob,
}

impl LaunchMode {
    /// The lock consumer type for this mode.
    #[must_use]
    pub const fn consumer_type(self) -> ConsumerType {
        match self {
            Self::LocalSandbox => ConsumerType::Local,
            Self::RemoteJob => ConsumerType::Cloud,
        }
    }
}

/// A producer start request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Session the stream serves.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Explicit workspace; resolved or created when absent.
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Event-id replay cursor.
    #[serde(default)]
    pub since_id: Option<String>,
    /// Wall-clock replay cursor.
    #[serde(default)]
    pub since_time: Option<DateTime<Utc>>,
    /// Lease duration; defaults to 5 minutes, capped at 10.
    #[serde(default)]
    pub lease_ms: Option<u64>,
    /// Execution mode; defaults to local sandbox.
    #[serde(default)]
    pub mode: Option<LaunchMode>,
    /// Consumer image override.
    #[serde(default)]
    pub consumer_image: Option<String>,
    /// Whether to run a consumer sidecar next to the producer.
    #[serde(default = "default_sidecar")]
    pub consumer_sidecar: bool,
    /// Environment overrides composed over the launcher's env.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

const fn default_sidecar() -> bool {
    true
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            session_id: None,
            workspace_id: None,
            since_id: None,
            since_time: None,
            lease_ms: None,
            mode: None,
            consumer_image: None,
            consumer_sidecar: default_sidecar(),
            env: BTreeMap::new(),
        }
    }
}

/// Outcome of a start request.
#[derive(Debug, Clone)]
pub enum StartOutcome {
    /// The producer is up and the lock is held.
    Started {
        /// The executor identity.
        consumer_id: ConsumerId,
        /// How it runs.
        mode: LaunchMode,
        /// The workspace it mirrors.
        workspace_id: WorkspaceId,
        /// The lock, including the runtime descriptor.
        lock: ConsumerLock,
    },
    /// Another live executor holds the lock. Nothing was started.
    LockHeld(LockConflict),
}

/// Outcome of a stop request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    /// Whether the stop completed.
    pub ok: bool,
    /// The mode the stopped executor ran in, when a lock existed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<LaunchMode>,
    /// Per-step human-readable results.
    pub results: Vec<String>,
    /// Whether a lock was released.
    pub released: bool,
}

/// Static launcher configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Upstream workflows service base URL.
    pub upstream_url: String,
    /// Audience for upstream auth, when required.
    pub upstream_audience: Option<String>,
    /// Bearer token handed to producers.
    pub upstream_token: Option<String>,
    /// Producer image.
    pub producer_image: String,
    /// Default consumer image.
    pub consumer_image: String,
    /// Port consumers listen on.
    pub consumer_port: u16,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            upstream_url: "http://localhost:8080".to_string(),
            upstream_audience: None,
            upstream_token: None,
            producer_image: "relay/producer:latest".to_string(),
            consumer_image: "relay/consumer:latest".to_string(),
            consumer_port: 8081,
        }
    }
}

/// Starts and stops producer/consumer pairs.
#[derive(Clone)]
pub struct ProducerLauncher {
    locks: LockManager,
    workspaces: WorkspaceRegistry,
    runtime: Arc<dyn ContainerRuntime>,
    jobs: Arc<dyn JobLauncher>,
    config: LauncherConfig,
    shutdown: CancellationToken,
}

impl ProducerLauncher {
    /// Creates a launcher.
    #[must_use]
    pub fn new(
        locks: LockManager,
        workspaces: WorkspaceRegistry,
        runtime: Arc<dyn ContainerRuntime>,
        jobs: Arc<dyn JobLauncher>,
        config: LauncherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            locks,
            workspaces,
            runtime,
            jobs,
            config,
            shutdown,
        }
    }

    /// Handles a start request end to end.
    ///
    /// On lock conflict nothing is started and the holder's details are
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid requests, unknown workspaces, runtime
    /// failures (after cleanup), or an unavailable store.
    pub async fn start(&self, scope: &Scope, request: &StartRequest) -> Result<StartOutcome> {
        let mode = request.mode.unwrap_or(LaunchMode::LocalSandbox);
        let lease_ms = request.lease_ms.unwrap_or(DEFAULT_LEASE_MS);

        let workspace_id = match request.workspace_id.as_deref() {
            Some(raw) => {
                let id = WorkspaceId::from_str(raw).map_err(Error::Core)?;
                if self.workspaces.get(scope, &id).await?.is_none() {
                    return Err(Error::Core(relay_core::Error::resource_not_found(
                        "workspace",
                        id,
                    )));
                }
                id
            }
            None => {
                self.workspaces
                    .resolve_or_create(scope, request.session_id.as_deref(), DEFAULT_WORKSPACE_TTL)
                    .await?
                    .workspace_id
            }
        };

        let consumer_id = ConsumerId::generate();
        tracing::info!(
            consumer_id = %consumer_id,
            user = scope.user_id(),
            project = scope.project_id(),
            mode = ?mode,
            "Starting producer"
        );

        match self
            .locks
            .acquire(scope, &consumer_id, lease_ms, mode.consumer_type())
            .await?
        {
            AcquireOutcome::Acquired(_) => {}
            AcquireOutcome::Held(conflict) => {
                tracing::info!(
                    holder = %conflict.current_consumer_id,
                    "Lock held by another consumer, not starting"
                );
                return Ok(StartOutcome::LockHeld(conflict));
            }
        }

        let result = self
            .bring_up(scope, request, mode, lease_ms, &workspace_id, &consumer_id)
            .await;

        match result {
            Ok(runtime_descriptor) => {
                self.locks
                    .set_runtime(scope, &consumer_id, runtime_descriptor)
                    .await?;
                let lock = self
                    .locks
                    .get(scope)
                    .await
                    .map_err(Error::Core)?
                    .ok_or_else(|| Error::runtime("lock vanished during start"))?;
                Ok(StartOutcome::Started {
                    consumer_id,
                    mode,
                    workspace_id,
                    lock,
                })
            }
            Err(e) => {
                // Clean error path: no orphaned lock, no stray containers.
                self.cleanup_partial(scope, &consumer_id).await;
                Err(e)
            }
        }
    }

    /// Brings up the executor pair, returning the runtime descriptor.
    async fn bring_up(
        &self,
        scope: &Scope,
        request: &StartRequest,
        mode: LaunchMode,
        lease_ms: u64,
        workspace_id: &WorkspaceId,
        consumer_id: &ConsumerId,
    ) -> Result<Value> {
        let consumer_name = container_name(CONSUMER_NAME_PREFIX, consumer_id.as_str());
        let producer_name = container_name(PRODUCER_NAME_PREFIX, consumer_id.as_str());

        let consumer_base_url = if request.consumer_sidecar {
            match mode {
                LaunchMode::LocalSandbox => {
                    format!("http://{consumer_name}:{}", self.config.consumer_port)
                }
                LaunchMode::RemoteJob => {
                    format!("http://localhost:{}", self.config.consumer_port)
                }
            }
        } else {
            format!("http://localhost:{}", self.config.consumer_port)
        };

        let env = self.compose_env(
            scope,
            request,
            lease_ms,
            workspace_id,
            consumer_id,
            &consumer_base_url,
        );

        match mode {
            LaunchMode::LocalSandbox => {
                let mut consumer_container_id = None;
                if request.consumer_sidecar {
                    let image = request
                        .consumer_image
                        .clone()
                        .unwrap_or_else(|| self.config.consumer_image.clone());
                    let id = self
                        .runtime
                        .start(&ContainerSpec {
                            name: consumer_name.clone(),
                            image,
                            env: env.clone(),
                        })
                        .await?;
                    consumer_container_id = Some(id);
                }

                let producer_container_id = self
                    .runtime
                    .start(&ContainerSpec {
                        name: producer_name.clone(),
                        image: self.config.producer_image.clone(),
                        env,
                    })
                    .await?;

                self.spawn_exit_monitor(
                    scope.clone(),
                    consumer_id.clone(),
                    producer_name.clone(),
                    request.consumer_sidecar.then(|| consumer_name.clone()),
                    lease_ms,
                );

                Ok(json!({
                    "mode": mode,
                    "producerContainer": producer_name,
                    "producerContainerId": producer_container_id,
                    "consumerContainer": request.consumer_sidecar.then_some(consumer_name),
                    "consumerContainerId": consumer_container_id,
                    "sidecar": request.consumer_sidecar,
                    "stopRequested": false,
                }))
            }
            LaunchMode::RemoteJob => {
                let operation = self
                    .jobs
                    .submit(&JobSpec {
                        name: consumer_id.to_string(),
                        image: request.consumer_image.clone(),
                        env,
                    })
                    .await?;

                Ok(json!({
                    "mode": mode,
                    "operation": operation,
                    "sidecar": request.consumer_sidecar,
                    "stopRequested": false,
                }))
            }
        }
    }

    /// Composes the producer/consumer environment; request overrides win.
    fn compose_env(
        &self,
        scope: &Scope,
        request: &StartRequest,
        lease_ms: u64,
        workspace_id: &WorkspaceId,
        consumer_id: &ConsumerId,
        consumer_base_url: &str,
    ) -> Vec<(String, String)> {
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        env.insert("RELAY_UPSTREAM_URL".into(), self.config.upstream_url.clone());
        if let Some(audience) = &self.config.upstream_audience {
            env.insert("RELAY_UPSTREAM_AUDIENCE".into(), audience.clone());
        }
        if let Some(token) = &self.config.upstream_token {
            env.insert("RELAY_UPSTREAM_TOKEN".into(), token.clone());
        }
        env.insert("RELAY_USER_ID".into(), scope.user_id().to_string());
        env.insert("RELAY_PROJECT_ID".into(), scope.project_id().to_string());
        env.insert("RELAY_CONSUMER_ID".into(), consumer_id.to_string());
        env.insert("RELAY_LEASE_MS".into(), lease_ms.to_string());
        env.insert("RELAY_WORKSPACE_ID".into(), workspace_id.to_string());
        if let Some(session_id) = &request.session_id {
            env.insert("RELAY_SESSION_ID".into(), session_id.clone());
        }
        if let Some(since_id) = &request.since_id {
            env.insert("RELAY_SINCE_ID".into(), since_id.clone());
        }
        if let Some(since_time) = &request.since_time {
            env.insert("RELAY_SINCE_TIME".into(), since_time.to_rfc3339());
        }
        env.insert("RELAY_CONSUMER_BASE_URL".into(), consumer_base_url.to_string());

        for (key, value) in &request.env {
            env.insert(key.clone(), value.clone());
        }

        env.into_iter().collect()
    }

    /// Waits for the producer to exit, then stops the sidecar and releases
    /// the lock owner-scoped. While the producer lives, the owner's
    /// heartbeat renews the lease at a third of its duration.
    fn spawn_exit_monitor(
        &self,
        scope: Scope,
        consumer_id: ConsumerId,
        producer_name: String,
        consumer_name: Option<String>,
        lease_ms: u64,
    ) {
        let runtime = Arc::clone(&self.runtime);
        let locks = self.locks.clone();
        let shutdown = self.shutdown.clone();
        let span = relay_core::observability::producer_span(
            "exit-monitor",
            consumer_id.as_str(),
            scope.user_id(),
            scope.project_id(),
        );

        let heartbeat = CancellationToken::new();
        {
            let heartbeat = heartbeat.clone();
            let locks = locks.clone();
            let scope = scope.clone();
            let consumer_id = consumer_id.clone();
            let period = std::time::Duration::from_millis((lease_ms / 3).max(1_000));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = heartbeat.cancelled() => break,
                        _ = ticker.tick() => {
                            match locks.renew(&scope, &consumer_id).await {
                                Ok(true) => {}
                                Ok(false) => {
                                    tracing::warn!(consumer_id = %consumer_id, "Lease lost, stopping renewal");
                                    break;
                                }
                                Err(e) => {
                                    tracing::warn!(consumer_id = %consumer_id, error = %e, "Lease renewal failed");
                                }
                            }
                        }
                    }
                }
            });
        }

        let monitor = async move {
            tokio::select! {
                exit = runtime.wait(&producer_name) => match exit {
                    Ok(code) => {
                        tracing::info!(producer = %producer_name, code, "Producer exited");
                    }
                    Err(e) => {
                        tracing::warn!(producer = %producer_name, error = %e, "Producer wait failed");
                    }
                },
                () = shutdown.cancelled() => {
                    tracing::info!(producer = %producer_name, "Shutdown, stopping producer");
                    if let Err(e) = runtime.stop(&producer_name).await {
                        tracing::warn!(producer = %producer_name, error = %e, "Producer stop failed");
                    }
                }
            }

            heartbeat.cancel();

            if let Some(consumer_name) = &consumer_name {
                if let Err(e) = runtime.stop(consumer_name).await {
                    tracing::warn!(consumer = %consumer_name, error = %e, "Sidecar stop failed");
                }
                let _ = runtime.remove(consumer_name).await;
            }
            let _ = runtime.remove(&producer_name).await;

            match locks
                .release(&scope, Some(consumer_id.as_str()), false)
                .await
            {
                Ok(released) => {
                    tracing::info!(consumer_id = %consumer_id, released, "Exit monitor released lock");
                }
                Err(e) => {
                    tracing::warn!(consumer_id = %consumer_id, error = %e, "Lock release failed");
                }
            }
        };
        tokio::spawn(monitor.instrument(span));
    }

    /// Best-effort cleanup after a failed start.
    async fn cleanup_partial(&self, scope: &Scope, consumer_id: &ConsumerId) {
        let consumer_name = container_name(CONSUMER_NAME_PREFIX, consumer_id.as_str());
        let producer_name = container_name(PRODUCER_NAME_PREFIX, consumer_id.as_str());
        let _ = self.runtime.remove(&producer_name).await;
        let _ = self.runtime.remove(&consumer_name).await;
        if let Err(e) = self
            .locks
            .release(scope, Some(consumer_id.as_str()), false)
            .await
        {
            tracing::warn!(error = %e, "Cleanup release failed");
        }
    }

    /// Handles a stop request. Idempotent.
    ///
    /// Local executors are stopped by container name; remote executors are
    /// marked stop-requested for the job to observe. Either way the lock is
    /// force-released.
    ///
    /// # Errors
    ///
    /// Returns an error when the store is unavailable.
    pub async fn stop(&self, scope: &Scope) -> Result<StopOutcome> {
        let Some(lock) = self.locks.get(scope).await.map_err(Error::Core)? else {
            return Ok(StopOutcome {
                ok: true,
                mode: None,
                results: vec!["no active lock".to_string()],
                released: false,
            });
        };

        let mode: Option<LaunchMode> = lock
            .runtime
            .get("mode")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());
        let mut results = Vec::new();

        match mode {
            Some(LaunchMode::LocalSandbox) => {
                for key in ["producerContainer", "consumerContainer"] {
                    if let Some(name) = lock.runtime.get(key).and_then(Value::as_str) {
                        match self.runtime.stop(name).await {
                            Ok(()) => results.push(format!("stopped {name}")),
                            Err(e) => results.push(format!("stop {name} failed: {e}")),
                        }
                        let _ = self.runtime.remove(name).await;
                    }
                }
            }
            Some(LaunchMode::RemoteJob) => {
                match self.locks.request_stop(scope).await {
                    Ok(true) => results.push("stop requested".to_string()),
                    Ok(false) => results.push("lock gone before stop request".to_string()),
                    Err(e) => results.push(format!("stop request failed: {e}")),
                }
            }
            None => results.push("no runtime descriptor on lock".to_string()),
        }

        let released = match self.locks.release(scope, None, true).await {
            Ok(released) => released,
            Err(e) => {
                tracing::warn!(error = %e, "Force release failed");
                results.push(format!("release failed: {e}"));
                false
            }
        };

        Ok(StopOutcome {
            ok: true,
            mode,
            results,
            released,
        })
    }
}
