//! Streaming session routes.
//!
//! Two modes over the same dispatch pipeline:
//!
//! - `GET /sessions/consume` - pull+callback. The service opens the
//!   outbound upstream subscription; the response is an SSE progress feed
//!   (connection state, per-event notes, pings, sync stats) while results
//!   are POSTed to upstream callbacks.
//! - `POST /sessions/stream` - push. A trusted backend streams NDJSON
//!   events in the request body and reads NDJSON results on the response.
//!   Each response line is exactly one result record, a `{"type":"ping"}`
//!   heartbeat, or a `{"type":"gcs_sync", ...}` stats line.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use relay_flow::stream::EventStreamClient;
use relay_flow::workspace::DEFAULT_WORKSPACE_TTL;
use relay_sandbox::sync::SyncEngine;
use relay_sandbox::workroot::{render_prefix, TemplateVars};
use relay_sandbox::{DispatchContext, Dispatcher, ToolEvent};

use crate::context::RequestScope;
use crate::error::ApiError;
use crate::server::AppState;

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Query parameters for `GET /sessions/consume`.
#[derive(Debug, Default, Deserialize)]
pub struct ConsumeQuery {
    /// Event-id replay cursor.
    #[serde(default)]
    pub since_id: Option<String>,
    /// Wall-clock replay cursor.
    #[serde(default)]
    pub since_time: Option<DateTime<Utc>>,
}

/// Resolves the stream's dispatch context and sync prefix.
async fn stream_context(
    ctx: &RequestScope,
    state: &AppState,
) -> Result<(DispatchContext, String), ApiError> {
    let workspace_id = match &ctx.workspace_id {
        Some(explicit) => explicit.clone(),
        None => state
            .workspaces()
            .resolve_or_create(&ctx.scope, ctx.session_id.as_deref(), DEFAULT_WORKSPACE_TTL)
            .await
            .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?
            .workspace_id
            .to_string(),
    };

    let dispatch_ctx = DispatchContext {
        user_id: ctx.scope.user_id().to_string(),
        project_id: ctx.scope.project_id().to_string(),
        workspace_id,
        session_id: ctx.session_id.clone().unwrap_or_default(),
    };

    let prefix = render_prefix(
        &state.config.sync_prefix_template,
        &TemplateVars {
            user_id: &dispatch_ctx.user_id,
            project_id: &dispatch_ctx.project_id,
            workspace_id: &dispatch_ctx.workspace_id,
            session_id: &dispatch_ctx.session_id,
        },
    );

    Ok((dispatch_ctx, prefix))
}

fn stream_credential(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-storage-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
}

/// Pull+callback stream.
#[utoipa::path(
    get,
    path = "/sessions/consume",
    responses(
        (status = 200, description = "SSE progress feed while consuming"),
        (status = 401, description = "Missing or invalid identity"),
    ),
    tag = "Sessions"
)]
pub(crate) async fn consume(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConsumeQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl futures::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (dispatch_ctx, prefix) = stream_context(&ctx, &state).await?;
    let sync = state.sync_engine(prefix, stream_credential(&headers));

    let client = EventStreamClient::new(
        state.config.stream_config(query.since_id, query.since_time),
        Arc::new(state.dispatcher()),
        sync,
        state.shutdown().child_token(),
    );

    let span = relay_core::observability::stream_span(
        "pull",
        ctx.scope.user_id(),
        ctx.scope.project_id(),
    );
    let (notes_tx, notes_rx) = mpsc::channel(64);
    tokio::spawn(
        async move {
            if let Err(e) = client.run(&dispatch_ctx, notes_tx).await {
                tracing::warn!(error = %e, "Pull stream ended with error");
            }
        }
        .instrument(span),
    );

    let stream = ReceiverStream::new(notes_rx).map(|note| {
        let data = serde_json::to_string(&note).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });
    Ok(Sse::new(stream))
}

/// Push stream: NDJSON request body, NDJSON response body.
#[utoipa::path(
    post,
    path = "/sessions/stream",
    responses(
        (status = 200, description = "NDJSON result stream"),
        (status = 401, description = "Missing or invalid identity"),
    ),
    tag = "Sessions"
)]
pub(crate) async fn stream(
    ctx: RequestScope,
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ApiError> {
    let (dispatch_ctx, prefix) = stream_context(&ctx, &state).await?;
    let sync = state.sync_engine(prefix, stream_credential(request.headers()));

    let dispatcher = Arc::new(state.dispatcher());
    let work_root = dispatcher
        .work_root(&dispatch_ctx)
        .await
        .map_err(|e| ApiError::from(e).with_request_id(ctx.request_id.clone()))?
        .path()
        .to_path_buf();

    let (lines_tx, lines_rx) = mpsc::channel::<String>(64);
    let worker = PushStreamWorker {
        dispatcher,
        dispatch_ctx,
        sync,
        work_root,
        heartbeat: Duration::from_millis(state.config.events_heartbeat_ms),
        sync_interval: Duration::from_millis(state.config.sync_interval_ms),
        sync_on_start: state.config.sync_on_start,
        shutdown: state.shutdown().child_token(),
        lines: lines_tx,
    };

    let span = relay_core::observability::stream_span(
        "push",
        ctx.scope.user_id(),
        ctx.scope.project_id(),
    );
    let body = request.into_body().into_data_stream();
    tokio::spawn(worker.run(body).instrument(span));

    let response_body = Body::from_stream(
        ReceiverStream::new(lines_rx).map(Ok::<String, Infallible>),
    );
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .body(response_body)
        .map_err(|e| ApiError::internal(format!("build response: {e}")))
}

/// Drives one push stream: reads event lines, writes result lines.
struct PushStreamWorker {
    dispatcher: Arc<Dispatcher>,
    dispatch_ctx: DispatchContext,
    sync: Option<Arc<SyncEngine>>,
    work_root: PathBuf,
    heartbeat: Duration,
    sync_interval: Duration,
    sync_on_start: bool,
    shutdown: CancellationToken,
    lines: mpsc::Sender<String>,
}

impl PushStreamWorker {
    async fn run(self, body: axum::body::BodyDataStream) {
        tracing::info!(
            user = %self.dispatch_ctx.user_id,
            project = %self.dispatch_ctx.project_id,
            "Push stream opened"
        );

        if self.sync_on_start && self.sync_now(true).await.is_err() {
            return;
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;
        let mut sync_timer = tokio::time::interval(self.sync_interval);
        sync_timer.tick().await;

        let mut body = body;
        let mut buffer = String::new();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    if self.send_json(&json!({"type": "ping"})).await.is_err() {
                        return;
                    }
                }
                _ = sync_timer.tick() => {
                    if self.sync_now(false).await.is_err() {
                        return;
                    }
                }
                chunk = body.next() => match chunk {
                    None => break,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Push stream body read failed");
                        break;
                    }
                    Some(Ok(bytes)) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(newline) = buffer.find('\n') {
                            let line: String = buffer.drain(..=newline).collect();
                            if self.handle_line(line.trim()).await.is_err() {
                                return;
                            }
                        }
                    }
                },
            }
        }

        // A final line may arrive without a trailing newline.
        let tail = buffer.trim().to_string();
        if !tail.is_empty() && self.handle_line(&tail).await.is_err() {
            return;
        }

        let _ = self.sync_now(true).await;
    }

    /// Dispatches one event line, emitting exactly one result line.
    async fn handle_line(&self, line: &str) -> Result<(), ()> {
        if line.is_empty() {
            return Ok(());
        }

        let event: ToolEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable event line, skipping");
                return Ok(());
            }
        };

        let record = self.dispatcher.dispatch(&event, &self.dispatch_ctx).await;
        let rendered = serde_json::to_string(&record)
            .unwrap_or_else(|_| json!({"event_id": event.id, "error": {"message": "serialize"}}).to_string());
        self.send_line(rendered).await
    }

    async fn sync_now(&self, wait: bool) -> Result<(), ()> {
        let Some(sync) = &self.sync else {
            return Ok(());
        };

        let outcome = if wait {
            sync.sync(&self.work_root).await.map(Some)
        } else {
            sync.try_sync(&self.work_root).await
        };

        match outcome {
            Ok(Some(stats)) => {
                let mut line = serde_json::to_value(stats).unwrap_or_else(|_| json!({}));
                if let Some(map) = line.as_object_mut() {
                    map.insert("type".to_string(), json!("gcs_sync"));
                }
                self.send_json(&line).await
            }
            Ok(None) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "Sync run failed");
                Ok(())
            }
        }
    }

    async fn send_json(&self, value: &serde_json::Value) -> Result<(), ()> {
        self.send_line(value.to_string()).await
    }

    async fn send_line(&self, mut line: String) -> Result<(), ()> {
        line.push('\n');
        self.lines.send(line).await.map_err(|_| ())
    }
}

/// Creates the session routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions/consume", get(consume))
        .route("/sessions/stream", post(stream))
}
