//! API server implementation.
//!
//! Provides health, ready, and the Relay endpoints, and owns the single
//! cancellation token propagated to every long-lived task for bounded
//! graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use relay_core::docstore::{DocStore, MemoryDocStore};
use relay_core::storage::{GcsBackend, MemoryBackend, StorageBackend};
use relay_flow::execs::ExecRegistry;
use relay_flow::launcher::ProducerLauncher;
use relay_flow::lock::LockManager;
use relay_flow::runtime::{ContainerRuntime, JobLauncher, MemoryJobLauncher, MemoryRuntime};
use relay_flow::workspace::WorkspaceRegistry;
use relay_sandbox::sync::{SyncConfig, SyncEngine};
use relay_sandbox::Dispatcher;

use crate::config::Config;
use crate::error::ApiResult;
use crate::routes;

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
}

/// Readiness check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ReadyResponse {
    /// Service readiness status.
    pub ready: bool,
    /// Optional message about readiness state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    docs: Arc<dyn DocStore>,
    storage: Option<Arc<dyn StorageBackend>>,
    runtime: Arc<dyn ContainerRuntime>,
    jobs: Arc<dyn JobLauncher>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("docs", &"<DocStore>")
            .field("storage", &self.storage.is_some())
            .field("runtime", &"<ContainerRuntime>")
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Creates application state over explicit backends.
    #[must_use]
    pub fn new(
        config: Config,
        docs: Arc<dyn DocStore>,
        storage: Option<Arc<dyn StorageBackend>>,
        runtime: Arc<dyn ContainerRuntime>,
        jobs: Arc<dyn JobLauncher>,
    ) -> Self {
        Self {
            config,
            docs,
            storage,
            runtime,
            jobs,
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates application state over in-memory backends (tests/debug).
    #[must_use]
    pub fn with_memory(config: Config) -> Self {
        Self::new(
            config,
            Arc::new(MemoryDocStore::new()),
            Some(Arc::new(MemoryBackend::new())),
            Arc::new(MemoryRuntime::new()),
            Arc::new(MemoryJobLauncher::new()),
        )
    }

    /// Returns the shutdown token handed to long-lived tasks.
    #[must_use]
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Returns the lock manager.
    #[must_use]
    pub fn lock_manager(&self) -> LockManager {
        LockManager::new(Arc::clone(&self.docs))
    }

    /// Returns the workspace registry.
    #[must_use]
    pub fn workspaces(&self) -> WorkspaceRegistry {
        WorkspaceRegistry::new(Arc::clone(&self.docs))
    }

    /// Returns the exec registry.
    #[must_use]
    pub fn execs(&self) -> ExecRegistry {
        ExecRegistry::new(Arc::clone(&self.docs))
    }

    /// Returns the producer launcher.
    #[must_use]
    pub fn launcher(&self) -> ProducerLauncher {
        ProducerLauncher::new(
            self.lock_manager(),
            self.workspaces(),
            Arc::clone(&self.runtime),
            Arc::clone(&self.jobs),
            self.config.launcher_config(),
            self.shutdown.clone(),
        )
    }

    /// Returns the tool dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.config.work_root_spec(), self.config.tool_config())
    }

    /// Builds a sync engine for one stream.
    ///
    /// A per-stream credential narrows access to the configured bucket; with
    /// no credential the ambient backend is used. `None` when no object
    /// store is configured at all - sync is disabled for the stream.
    #[must_use]
    pub fn sync_engine(&self, prefix: String, stream_token: Option<String>) -> Option<Arc<SyncEngine>> {
        let backend: Arc<dyn StorageBackend> = match (&stream_token, &self.config.storage_bucket) {
            (Some(token), Some(bucket)) => {
                Arc::new(GcsBackend::new(bucket.clone(), token.clone()))
            }
            _ => Arc::clone(self.storage.as_ref()?),
        };

        Some(Arc::new(SyncEngine::new(
            backend,
            SyncConfig {
                prefix,
                uploads_enabled: self.config.gcs_enable_upload,
                download_concurrency: self.config.gcs_download_concurrency,
                upload_concurrency: self.config.gcs_upload_concurrency,
            },
        )))
    }

    fn storage(&self) -> Option<Arc<dyn StorageBackend>> {
        self.storage.clone()
    }
}

/// Health check endpoint handler.
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// Readiness check endpoint handler.
///
/// Verifies object-store connectivity when one is configured. A `HEAD` on a
/// missing key is sufficient to validate credentials and network path.
async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(storage) = state.storage() else {
        return (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: Some("no object store configured".to_string()),
            }),
        );
    };

    match storage.head("__relay/ready-check").await {
        Ok(_) => (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                message: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                message: Some(format!("storage check failed: {e}")),
            }),
        ),
    }
}

/// Builds the application router.
#[must_use]
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .merge(routes::routes())
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors_layer(&state.config) {
        app = app.layer(cors);
    }

    app.with_state(state)
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    if config.cors_allowed_origins.is_empty() {
        return None;
    }

    let layer = if config.cors_allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };
    Some(layer.allow_methods(Any).allow_headers(Any))
}

/// The HTTP server.
pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    /// Creates a server over the given state.
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Serves until interrupted, then runs the bounded shutdown sequence:
    /// stop accepting, cancel all streams and monitors, and give them half
    /// the shutdown budget to finish.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot bind.
    pub async fn serve(self) -> ApiResult<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| crate::error::ApiError::internal(format!("bind {addr}: {e}")))?;

        tracing::info!(%addr, "Relay API listening");

        let shutdown = self.state.shutdown().clone();
        let signal_token = shutdown.clone();
        let app = router(Arc::clone(&self.state));
        let grace = Duration::from_millis(self.state.config.shutdown_timeout_ms / 2);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("Shutdown signal received");
                signal_token.cancel();
            })
            .await
            .map_err(|e| crate::error::ApiError::internal(format!("serve: {e}")))?;

        // Streams and exit monitors observe the token; give them half the
        // budget to release locks and finish final syncs.
        shutdown.cancel();
        tokio::time::sleep(grace).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn debug_config() -> Config {
        Config {
            debug: true,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let state = Arc::new(AppState::with_memory(debug_config()));
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .expect("body");
        let health: HealthResponse = serde_json::from_slice(&body).expect("parse");
        assert_eq!(health.status, "ok");
    }

    #[tokio::test]
    async fn ready_endpoint_checks_storage() {
        let state = Arc::new(AppState::with_memory(debug_config()));
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/ready")
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }
}
