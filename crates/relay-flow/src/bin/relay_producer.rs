//! `relay-producer` binary entrypoint.
//!
//! The producer is the event-consuming driver launched per executor: it
//! subscribes to the upstream event channel in pull+callback mode and runs
//! tool calls in its sandbox until stopped. Configuration comes from the
//! environment composed by the runner launcher.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use relay_core::observability::{init_logging, LogFormat};
use relay_core::storage::GcsBackend;
use relay_flow::stream::{EventStreamClient, StreamConfig};
use relay_sandbox::sync::{SyncConfig, SyncEngine};
use relay_sandbox::workroot::{DEFAULT_PREFIX_TEMPLATE, DEFAULT_WORK_ROOT};
use relay_sandbox::{DispatchContext, Dispatcher, ToolConfig, WorkRootSpec};

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_required(name: &str) -> Result<String> {
    env_opt(name).with_context(|| format!("{name} is required"))
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_opt(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    let debug = env_opt("RELAY_DEBUG").is_some_and(|v| v == "1" || v == "true");
    init_logging(if debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    });

    let ctx = DispatchContext {
        user_id: env_required("RELAY_USER_ID")?,
        project_id: env_required("RELAY_PROJECT_ID")?,
        workspace_id: env_opt("RELAY_WORKSPACE_ID").unwrap_or_default(),
        session_id: env_opt("RELAY_SESSION_ID").unwrap_or_default(),
    };

    let spec = WorkRootSpec::new(
        env_opt("WORK_ROOT").unwrap_or_else(|| DEFAULT_WORK_ROOT.to_string()),
        env_opt("WORK_PREFIX_TEMPLATE").unwrap_or_else(|| DEFAULT_PREFIX_TEMPLATE.to_string()),
    );
    let tools = ToolConfig {
        read_file_max_bytes: env_u64("READ_FILE_MAX_BYTES", 200_000) as usize,
        output_max_bytes: env_u64("OUTPUT_MAX_BYTES", 50_000) as usize,
        run_command_timeout: Duration::from_secs(env_u64("RUN_COMMAND_TIMEOUT_SECONDS", 120)),
    };
    let dispatcher = Arc::new(Dispatcher::new(spec, tools));

    let sync = match (env_opt("RELAY_GCS_BUCKET"), env_opt("RELAY_GCS_TOKEN")) {
        (Some(bucket), Some(token)) => {
            let prefix = env_opt("RELAY_SYNC_PREFIX").unwrap_or_default();
            tracing::info!(bucket = %bucket, prefix = %prefix, "Sync engine enabled");
            Some(Arc::new(SyncEngine::new(
                Arc::new(GcsBackend::new(bucket, token)),
                SyncConfig {
                    prefix,
                    uploads_enabled: env_u64("GCS_ENABLE_UPLOAD", 1) != 0,
                    download_concurrency: env_u64("GCS_DOWNLOAD_CONCURRENCY", 4) as usize,
                    upload_concurrency: env_u64("GCS_UPLOAD_CONCURRENCY", 4) as usize,
                },
            )))
        }
        _ => {
            tracing::warn!("No object store credential, sync disabled");
            None
        }
    };

    let config = StreamConfig {
        upstream_url: env_required("RELAY_UPSTREAM_URL")?,
        token: env_opt("RELAY_UPSTREAM_TOKEN"),
        heartbeat: Duration::from_millis(env_u64("EVENTS_HEARTBEAT_MS", 15_000)),
        reconnect_backoff: Duration::from_millis(env_u64("RECONNECT_BACKOFF_MS", 1_000)),
        since_id: env_opt("RELAY_SINCE_ID"),
        since_time: env_opt("RELAY_SINCE_TIME").and_then(|v| v.parse().ok()),
        sync_on_start: env_u64("SYNC_ON_START", 1) != 0,
        sync_interval: Duration::from_millis(env_u64("SYNC_INTERVAL_MS", 15_000)),
        ..StreamConfig::default()
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            signal_token.cancel();
        }
    });

    let (notes_tx, mut notes_rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(async move {
        while let Some(note) = notes_rx.recv().await {
            tracing::debug!(?note, "Stream note");
        }
    });

    let client = EventStreamClient::new(config, dispatcher, sync, shutdown);
    client.run(&ctx, notes_tx).await?;
    Ok(())
}
