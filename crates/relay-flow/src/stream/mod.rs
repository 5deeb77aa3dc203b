//! The event stream client: durable pull subscription with callbacks.
//!
//! The client holds a long-lived SSE-framed connection to the upstream
//! event channel, dispatches each event through the tool dispatcher, and
//! posts per-event results as callbacks. It maintains a replay cursor
//! (`lastEventId` preferred, wall-clock fallback), reconnects with
//! exponential backoff capped at 30s and reset on a successful event, and
//! force-reconnects when the connection idles past the watchdog.
//!
//! Duplicate event ids after a reconnect are deduped against the cursor;
//! for a single event id exactly one dispatch is invoked and results are
//! emitted in the order events are received.

pub mod callback;
pub mod sse;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_sandbox::sync::{SyncEngine, SyncStats};
use relay_sandbox::{DispatchContext, Dispatcher, ToolEvent};

use crate::error::{Error, Result};
use crate::stream::callback::CallbackPoster;
use crate::stream::sse::SseParser;

/// Default keepalive interval.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// Default initial reconnect backoff.
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect backoff ceiling.
pub const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Default idle window before a forced reconnect.
pub const DEFAULT_IDLE_WATCHDOG: Duration = Duration::from_secs(90);

/// Stream client configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Upstream workflows service base URL.
    pub upstream_url: String,
    /// Bearer token for the upstream.
    pub token: Option<String>,
    /// Keepalive interval.
    pub heartbeat: Duration,
    /// Initial reconnect backoff.
    pub reconnect_backoff: Duration,
    /// Idle window before a forced reconnect.
    pub idle_watchdog: Duration,
    /// Event-id replay cursor seed.
    pub since_id: Option<String>,
    /// Wall-clock replay cursor seed.
    pub since_time: Option<DateTime<Utc>>,
    /// Whether to run a sync before consuming events.
    pub sync_on_start: bool,
    /// Interval between periodic syncs while the stream is open.
    pub sync_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            upstream_url: "http://localhost:8080".to_string(),
            token: None,
            heartbeat: DEFAULT_HEARTBEAT,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            idle_watchdog: DEFAULT_IDLE_WATCHDOG,
            since_id: None,
            since_time: None,
            sync_on_start: true,
            sync_interval: relay_sandbox::sync::DEFAULT_SYNC_INTERVAL,
        }
    }
}

/// Replay cursor: both the last event id and its wall-clock time are
/// tracked; resume prefers the id and falls back to time.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    /// Last successfully dispatched event id.
    pub last_event_id: Option<String>,
    /// Wall-clock time of the last successful event.
    pub last_event_time: Option<DateTime<Utc>>,
}

/// Progress notes emitted to the pull-mode response stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamNote {
    /// The upstream connection is established.
    Connected,
    /// Keepalive.
    Ping,
    /// One event was dispatched.
    Event {
        /// The dispatched event id.
        event_id: String,
    },
    /// One callback delivery finished.
    Callback {
        /// The event the callback answered.
        event_id: String,
        /// Whether the upstream acknowledged it.
        delivered: bool,
    },
    /// One sync run finished.
    GcsSync {
        /// The run's transfer stats.
        #[serde(flatten)]
        stats: SyncStats,
    },
}

/// Pull-mode event stream client.
pub struct EventStreamClient {
    config: StreamConfig,
    dispatcher: Arc<Dispatcher>,
    callbacks: CallbackPoster,
    sync: Option<Arc<SyncEngine>>,
    shutdown: CancellationToken,
    client: reqwest::Client,
}

impl EventStreamClient {
    /// Creates a client.
    #[must_use]
    pub fn new(
        config: StreamConfig,
        dispatcher: Arc<Dispatcher>,
        sync: Option<Arc<SyncEngine>>,
        shutdown: CancellationToken,
    ) -> Self {
        let callbacks = CallbackPoster::new(config.upstream_url.clone(), config.token.clone());
        Self {
            config,
            dispatcher,
            callbacks,
            sync,
            shutdown,
            client: reqwest::Client::new(),
        }
    }

    /// Runs the subscription until shutdown or the notes receiver goes away.
    ///
    /// # Errors
    ///
    /// Returns an error when the work root cannot be derived. Connection
    /// failures are retried indefinitely with capped backoff.
    pub async fn run(
        &self,
        ctx: &DispatchContext,
        notes: mpsc::Sender<StreamNote>,
    ) -> Result<()> {
        tracing::info!(
            user = %ctx.user_id,
            project = %ctx.project_id,
            "Pull stream starting"
        );

        let work_root = self
            .dispatcher
            .work_root(ctx)
            .await
            .map_err(Error::Core)?
            .path()
            .to_path_buf();

        let mut cursor = Cursor {
            last_event_id: self.config.since_id.clone(),
            last_event_time: self.config.since_time,
        };

        if self.config.sync_on_start {
            self.run_sync(&work_root, &notes, true).await;
        }

        let mut heartbeat = tokio::time::interval(self.config.heartbeat);
        heartbeat.tick().await;
        let mut sync_timer = tokio::time::interval(self.config.sync_interval);
        sync_timer.tick().await;

        let mut backoff = self.config.reconnect_backoff;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let response = match self.connect(ctx, &cursor).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Connect failed");
                    if !self.sleep_backoff(&mut backoff).await {
                        break;
                    }
                    continue;
                }
            };

            if notes.send(StreamNote::Connected).await.is_err() {
                break;
            }

            let mut events = response.bytes_stream();
            let mut parser = SseParser::new();

            'connection: loop {
                tokio::select! {
                    () = self.shutdown.cancelled() => break,
                    _ = heartbeat.tick() => {
                        if notes.send(StreamNote::Ping).await.is_err() {
                            break;
                        }
                    }
                    _ = sync_timer.tick() => {
                        self.run_sync(&work_root, &notes, false).await;
                    }
                    next = tokio::time::timeout(self.config.idle_watchdog, events.next()) => {
                        match next {
                            Err(_) => {
                                tracing::warn!("Idle watchdog elapsed, forcing reconnect");
                                break 'connection;
                            }
                            Ok(None) => break 'connection,
                            Ok(Some(Err(e))) => {
                                tracing::warn!(error = %e, "Event stream read failed");
                                break 'connection;
                            }
                            Ok(Some(Ok(chunk))) => {
                                for frame in parser.push(&chunk) {
                                    if !self.handle_frame(&frame.data, ctx, &mut cursor, &notes).await {
                                        break;
                                    }
                                    backoff = self.config.reconnect_backoff;
                                }
                            }
                        }
                    }
                }

                if self.shutdown.is_cancelled() || notes.is_closed() {
                    break;
                }
            }

            if self.shutdown.is_cancelled() || notes.is_closed() {
                break;
            }
            if !self.sleep_backoff(&mut backoff).await {
                break;
            }
        }

        self.final_sync(&work_root, &notes).await;
        Ok(())
    }

    async fn connect(&self, ctx: &DispatchContext, cursor: &Cursor) -> Result<reqwest::Response> {
        let url = format!("{}/events", self.config.upstream_url.trim_end_matches('/'));

        let mut query: Vec<(&str, String)> = vec![
            ("userId", ctx.user_id.clone()),
            ("projectId", ctx.project_id.clone()),
        ];
        if !ctx.workspace_id.is_empty() {
            query.push(("workspaceId", ctx.workspace_id.clone()));
        }
        if !ctx.session_id.is_empty() {
            query.push(("sessionId", ctx.session_id.clone()));
        }
        // Resume by id when we have one, by time otherwise.
        if let Some(id) = &cursor.last_event_id {
            query.push(("since_id", id.clone()));
        } else if let Some(time) = &cursor.last_event_time {
            query.push(("since_time", time.to_rfc3339()));
        }

        let mut request = self
            .client
            .get(url)
            .query(&query)
            .header("Accept", "text/event-stream");
        if let Some(id) = &cursor.last_event_id {
            request = request.header("Last-Event-ID", id.clone());
        }
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::upstream(format!("connect: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::upstream(format!(
                "connect: status {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// Dispatches one frame. Returns false when the notes receiver is gone.
    async fn handle_frame(
        &self,
        data: &str,
        ctx: &DispatchContext,
        cursor: &mut Cursor,
        notes: &mpsc::Sender<StreamNote>,
    ) -> bool {
        if data.is_empty() {
            return true;
        }

        let event: ToolEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable event frame, skipping");
                return true;
            }
        };

        // Duplicate delivery after reconnect: the cursor already covers it.
        if cursor.last_event_id.as_deref() == Some(event.id.as_str()) {
            tracing::debug!(event_id = %event.id, "Duplicate event, skipping");
            return true;
        }

        let record = self.dispatcher.dispatch(&event, ctx).await;
        cursor.last_event_id = Some(event.id.clone());
        cursor.last_event_time = Some(event.create_time.unwrap_or_else(Utc::now));

        if notes
            .send(StreamNote::Event {
                event_id: event.id.clone(),
            })
            .await
            .is_err()
        {
            return false;
        }

        if let Some(callback_id) = &event.callback_id {
            let delivery = self.callbacks.post(callback_id, &record.to_payload()).await;
            if !delivery.is_delivered() {
                tracing::warn!(
                    event_id = %event.id,
                    callback_id,
                    ?delivery,
                    "Callback not delivered"
                );
            }
            if notes
                .send(StreamNote::Callback {
                    event_id: event.id.clone(),
                    delivered: delivery.is_delivered(),
                })
                .await
                .is_err()
            {
                return false;
            }
        }

        true
    }

    async fn run_sync(&self, work_root: &Path, notes: &mpsc::Sender<StreamNote>, wait: bool) {
        let Some(sync) = &self.sync else { return };

        let outcome = if wait {
            sync.sync(work_root).await.map(Some)
        } else {
            sync.try_sync(work_root).await
        };

        match outcome {
            Ok(Some(stats)) => {
                let _ = notes.send(StreamNote::GcsSync { stats }).await;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Sync run failed"),
        }
    }

    async fn final_sync(&self, work_root: &Path, notes: &mpsc::Sender<StreamNote>) {
        self.run_sync(work_root, notes, true).await;
    }

    /// Sleeps the backoff (doubling, capped), returning false on shutdown.
    async fn sleep_backoff(&self, backoff: &mut Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(*backoff) => {
                *backoff = (*backoff * 2).min(RECONNECT_BACKOFF_CAP);
                true
            }
            () = self.shutdown.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_notes_serialize_with_type_tags() {
        let ping = serde_json::to_value(StreamNote::Ping).expect("serialize");
        assert_eq!(ping["type"], "ping");

        let sync = serde_json::to_value(StreamNote::GcsSync {
            stats: SyncStats {
                scanned_remote: 3,
                downloaded: 1,
                uploaded: 0,
                conflicts: 1,
            },
        })
        .expect("serialize");
        assert_eq!(sync["type"], "gcs_sync");
        assert_eq!(sync["downloaded"], 1);
        assert_eq!(sync["conflicts"], 1);
    }

    #[test]
    fn cursor_prefers_id_on_resume() {
        let cursor = Cursor {
            last_event_id: Some("41".into()),
            last_event_time: Some(Utc::now()),
        };
        // The resume query is built from the id when present.
        assert!(cursor.last_event_id.is_some());
    }

    #[test]
    fn default_config_matches_contract() {
        let config = StreamConfig::default();
        assert_eq!(config.heartbeat, Duration::from_secs(15));
        assert_eq!(config.reconnect_backoff, Duration::from_secs(1));
        assert!(config.sync_on_start);
    }
}
