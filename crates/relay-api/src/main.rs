//! `relay-api` binary entrypoint.
//!
//! Loads configuration from environment variables, selects backends, and
//! starts the HTTP server.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::sync::Arc;

use anyhow::Result;

use relay_api::config::Config;
use relay_api::server::{AppState, Server};
use relay_core::docstore::{DocStore, MemoryDocStore};
use relay_core::observability::{init_logging, LogFormat};
use relay_core::storage::{GcsBackend, MemoryBackend, StorageBackend};
use relay_flow::runtime::{DockerRuntime, MemoryJobLauncher};

fn choose_log_format(config: &Config) -> LogFormat {
    if config.debug {
        LogFormat::Pretty
    } else {
        LogFormat::Json
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    init_logging(choose_log_format(&config));

    let storage: Option<Arc<dyn StorageBackend>> =
        match (&config.storage_bucket, &config.storage_token) {
            (Some(bucket), Some(token)) => {
                tracing::info!(bucket = %bucket, "Using GCS object store backend");
                Some(Arc::new(GcsBackend::new(bucket.clone(), token.clone())))
            }
            _ if config.debug => {
                tracing::warn!(
                    "RELAY_STORAGE_BUCKET not set; using in-memory object store (debug only)"
                );
                Some(Arc::new(MemoryBackend::new()))
            }
            _ => {
                tracing::warn!("No object store configured; sandbox sync is disabled");
                None
            }
        };

    // The metadata store contract is pluggable; the in-process
    // implementation is non-durable and suits a single-replica deployment.
    let docs: Arc<dyn DocStore> = Arc::new(MemoryDocStore::new());
    if !config.debug {
        tracing::warn!("Using in-memory metadata store; state does not survive restarts");
    }

    let state = AppState::new(
        config,
        docs,
        storage,
        Arc::new(DockerRuntime::new()),
        Arc::new(MemoryJobLauncher::new()),
    );

    Server::new(state)
        .serve()
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", e.code(), e.message()))?;
    Ok(())
}
