//! Exec registry routes: links, statuses, and the exec tree.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use utoipa::ToSchema;

use relay_flow::execs::{StatusUpdate, DEFAULT_STATUS_LIMIT};

use crate::context::RequestScope;
use crate::error::ApiError;
use crate::server::AppState;

/// Request body for `POST /execs/register`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecRegisterRequest {
    /// The execution identifier.
    pub exec_id: String,
    /// The session the exec belongs to.
    pub session_id: String,
    /// Explicit registration time; defaults to now.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Request body for `POST /links/register`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LinkRegisterRequest {
    /// The exec that triggered the child.
    pub calling_exec_id: String,
    /// The exec that was triggered.
    pub triggered_exec_id: String,
    /// The session both execs belong to.
    pub session_id: String,
    /// Explicit link time; defaults to now.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Request body for `POST /status/update`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    /// The execution the report is about.
    pub exec_id: String,
    /// New status value.
    #[serde(default)]
    pub status: Option<String>,
    /// New result payload.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub result: Option<Value>,
    /// New error payload.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub error: Option<Value>,
    /// New terminal flag.
    #[serde(default)]
    pub ended: Option<bool>,
    /// Explicit report timestamp; defaults to now.
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    /// Workflow descriptor.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub workflow: Option<Value>,
}

/// Request body for `POST /status`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusQueryRequest {
    /// The session to query.
    pub session_id: String,
    /// Number of rows, at most 50. Defaults to 5.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Request body for `POST /tree`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TreeRequest {
    /// The session to derive the tree for.
    pub session_id: String,
    /// Return only the tree rooted at the newest exec.
    #[serde(default)]
    pub latest_only: bool,
}

/// Registers an exec for a session. Idempotent.
#[utoipa::path(
    post,
    path = "/execs/register",
    request_body = ExecRegisterRequest,
    responses(
        (status = 200, description = "The registration"),
        (status = 400, description = "Invalid exec id"),
    ),
    tag = "Execs"
)]
pub(crate) async fn exec_register(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecRegisterRequest>,
) -> Result<Response, ApiError> {
    let reg = state
        .execs()
        .register(
            &ctx.scope,
            &request.exec_id,
            &request.session_id,
            request.created_at,
        )
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(Json(reg).into_response())
}

/// Registers a parent/child link. Idempotent.
#[utoipa::path(
    post,
    path = "/links/register",
    request_body = LinkRegisterRequest,
    responses(
        (status = 200, description = "The link"),
        (status = 400, description = "Invalid exec ids"),
    ),
    tag = "Execs"
)]
pub(crate) async fn link_register(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
    Json(request): Json<LinkRegisterRequest>,
) -> Result<Response, ApiError> {
    let link = state
        .execs()
        .link_register(
            &ctx.scope,
            &request.calling_exec_id,
            &request.triggered_exec_id,
            &request.session_id,
            request.created_at,
        )
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(Json(link).into_response())
}

/// Returns links triggered by an exec, oldest first.
#[utoipa::path(
    get,
    path = "/links/by-calling/{exec_id}",
    params(("exec_id" = String, Path, description = "Calling exec id")),
    responses((status = 200, description = "Links, oldest first")),
    tag = "Execs"
)]
pub(crate) async fn links_by_calling(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
    Path(exec_id): Path<String>,
) -> Result<Response, ApiError> {
    let links = state
        .execs()
        .links_by_calling(&ctx.scope, &exec_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(Json(links).into_response())
}

/// Returns the newest link that triggered an exec.
#[utoipa::path(
    get,
    path = "/links/by-triggered/{exec_id}",
    params(("exec_id" = String, Path, description = "Triggered exec id")),
    responses(
        (status = 200, description = "The newest link"),
        (status = 404, description = "No link triggered this exec"),
    ),
    tag = "Execs"
)]
pub(crate) async fn link_by_triggered(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
    Path(exec_id): Path<String>,
) -> Result<Response, ApiError> {
    let link = state
        .execs()
        .link_by_triggered(&ctx.scope, &exec_id)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;

    match link {
        Some(link) => Ok(Json(link).into_response()),
        None => Err(ApiError::not_found(format!("no link triggered {exec_id}"))
            .with_request_id(ctx.request_id.clone())),
    }
}

/// Reports an exec status.
#[utoipa::path(
    post,
    path = "/status/update",
    request_body = StatusUpdateRequest,
    responses(
        (status = 200, description = "The stored status"),
        (status = 400, description = "Empty update or invalid exec id"),
    ),
    tag = "Execs"
)]
pub(crate) async fn status_update(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
    Json(request): Json<StatusUpdateRequest>,
) -> Result<Response, ApiError> {
    let report = StatusUpdate {
        status: request.status,
        result: request.result,
        error: request.error,
        ended: request.ended,
        updated: request.updated,
        workflow: request.workflow,
    };

    let status = state
        .execs()
        .status_update(&ctx.scope, &request.exec_id, &report)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(Json(status).into_response())
}

/// Returns the newest statuses for a session.
#[utoipa::path(
    post,
    path = "/status",
    request_body = StatusQueryRequest,
    responses((status = 200, description = "Status rows, newest first")),
    tag = "Execs"
)]
pub(crate) async fn latest_statuses(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
    Json(request): Json<StatusQueryRequest>,
) -> Result<Response, ApiError> {
    let views = state
        .execs()
        .latest_statuses(
            &ctx.scope,
            &request.session_id,
            request.limit.unwrap_or(DEFAULT_STATUS_LIMIT),
        )
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok(Json(views).into_response())
}

/// Returns the exec tree or forest for a session.
#[utoipa::path(
    post,
    path = "/tree",
    request_body = TreeRequest,
    responses((status = 200, description = "Exec forest, roots newest first")),
    tag = "Execs"
)]
pub(crate) async fn tree(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
    Json(request): Json<TreeRequest>,
) -> Result<Response, ApiError> {
    let forest = state
        .execs()
        .tree(&ctx.scope, &request.session_id, request.latest_only)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?;
    Ok((StatusCode::OK, Json(forest)).into_response())
}

/// Creates the exec registry routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execs/register", post(exec_register))
        .route("/links/register", post(link_register))
        .route("/links/by-calling/:exec_id", get(links_by_calling))
        .route("/links/by-triggered/:exec_id", get(link_by_triggered))
        .route("/status/update", post(status_update))
        .route("/status", post(latest_statuses))
        .route("/tree", post(tree))
}
