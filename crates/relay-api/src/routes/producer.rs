//! Producer lifecycle routes.
//!
//! `POST /producer/start` returns 202 on both outcomes: a started executor
//! and a "lock held" conflict. The conflict is not an error - the caller
//! learns who holds the project and backs off.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use relay_flow::launcher::{LaunchMode, StartOutcome, StartRequest as FlowStartRequest};

use crate::context::RequestScope;
use crate::error::ApiError;
use crate::server::AppState;

/// Request body for `POST /producer/start`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
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
    /// Lease duration in milliseconds, at most 10 minutes.
    #[serde(default)]
    pub lease_ms: Option<u64>,
    /// `local-sandbox` (default) or `remote-job`.
    #[serde(default)]
    pub mode: Option<String>,
    /// Consumer image override.
    #[serde(default)]
    pub consumer_image: Option<String>,
    /// Whether to run a consumer sidecar. Defaults to true.
    #[serde(default)]
    pub consumer_sidecar: Option<bool>,
    /// Environment overrides for the launched pair.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl StartRequest {
    fn into_flow(self, ctx: &RequestScope) -> Result<FlowStartRequest, ApiError> {
        let mode = match self.mode.as_deref() {
            None => None,
            Some(raw) => Some(
                serde_json::from_value(Value::String(raw.to_string()))
                    .map_err(|_| ApiError::bad_request(format!("invalid mode: '{raw}'")))?,
            ),
        };

        Ok(FlowStartRequest {
            session_id: self.session_id.or_else(|| ctx.session_id.clone()),
            workspace_id: self.workspace_id.or_else(|| ctx.workspace_id.clone()),
            since_id: self.since_id,
            since_time: self.since_time,
            lease_ms: self.lease_ms,
            mode,
            consumer_image: self.consumer_image,
            consumer_sidecar: self.consumer_sidecar.unwrap_or(true),
            env: self.env,
        })
    }
}

/// Response body for a successful start.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    /// Always true.
    pub ok: bool,
    /// How the executor runs.
    #[schema(value_type = String)]
    pub mode: LaunchMode,
    /// The executor identity.
    pub consumer_id: String,
    /// The workspace the executor mirrors.
    pub workspace_id: String,
    /// The consumer lock, including the runtime descriptor.
    #[schema(value_type = Object)]
    pub lock: Value,
}

/// Response body for a lock-held conflict.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LockHeldResponse {
    /// Human-readable explanation.
    pub message: String,
    /// Current holder details.
    #[schema(value_type = Object)]
    pub details: Value,
}

/// Starts a producer/consumer pair for the scoped project.
#[utoipa::path(
    post,
    path = "/producer/start",
    request_body = StartRequest,
    responses(
        (status = 202, description = "Started, or lock held by another consumer"),
        (status = 400, description = "Invalid request"),
        (status = 401, description = "Missing or invalid identity"),
        (status = 404, description = "Unknown workspace"),
    ),
    tag = "Producer"
)]
pub(crate) async fn start(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRequest>,
) -> Result<Response, ApiError> {
    let flow_request = request.into_flow(&ctx)?;
    tracing::info!(
        user = ctx.scope.user_id(),
        project = ctx.scope.project_id(),
        mode = ?flow_request.mode,
        "Producer start requested"
    );

    let outcome = state
        .launcher()
        .start(&ctx.scope, &flow_request)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    let response = match outcome {
        StartOutcome::Started {
            consumer_id,
            mode,
            workspace_id,
            lock,
        } => (
            StatusCode::ACCEPTED,
            Json(StartResponse {
                ok: true,
                mode,
                consumer_id: consumer_id.to_string(),
                workspace_id: workspace_id.to_string(),
                lock: serde_json::to_value(&lock).unwrap_or(Value::Null),
            }),
        )
            .into_response(),
        StartOutcome::LockHeld(conflict) => (
            StatusCode::ACCEPTED,
            Json(LockHeldResponse {
                message: "Lock held by another consumer".to_string(),
                details: serde_json::to_value(&conflict).unwrap_or(Value::Null),
            }),
        )
            .into_response(),
    };
    Ok(response)
}

/// Stops the scoped project's executor. Idempotent.
#[utoipa::path(
    post,
    path = "/producer/stop",
    responses(
        (status = 200, description = "Stop results"),
        (status = 401, description = "Missing or invalid identity"),
    ),
    tag = "Producer"
)]
pub(crate) async fn stop(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    tracing::info!(
        user = ctx.scope.user_id(),
        project = ctx.scope.project_id(),
        "Producer stop requested"
    );

    let outcome = state
        .launcher()
        .stop(&ctx.scope)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    Ok((StatusCode::OK, Json(outcome)).into_response())
}

/// Creates the producer routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/producer/start", post(start))
        .route("/producer/stop", post(stop))
}
