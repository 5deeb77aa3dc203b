//! Server configuration.
//!
//! All options load from the environment in `from_env`. Defaults match the
//! documented contract; unparseable values are configuration errors rather
//! than silent fallbacks.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use relay_core::error::{Error, Result};
use relay_flow::launcher::LauncherConfig;
use relay_flow::stream::StreamConfig;
use relay_sandbox::workroot::{DEFAULT_PREFIX_TEMPLATE, DEFAULT_WORK_ROOT};
use relay_sandbox::{ToolConfig, WorkRootSpec};

/// JWT authentication configuration (used when `debug` is false).
#[derive(Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// HS256 shared secret.
    #[serde(default)]
    pub hs256_secret: Option<String>,
    /// Claim carrying the user identifier.
    #[serde(default = "default_user_claim")]
    pub user_claim: String,
    /// Claim carrying the project identifier.
    #[serde(default = "default_project_claim")]
    pub project_claim: String,
}

fn default_user_claim() -> String {
    "sub".to_string()
}

fn default_project_claim() -> String {
    "projectId".to_string()
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            hs256_secret: None,
            user_claim: default_user_claim(),
            project_claim: default_project_claim(),
        }
    }
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field(
                "hs256_secret",
                &self.hs256_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("user_claim", &self.user_claim)
            .field("project_claim", &self.project_claim)
            .finish()
    }
}

/// Configuration for the Relay API server.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server port.
    pub http_port: u16,

    /// Enable debug mode.
    ///
    /// When enabled, identity comes from `X-User-Id` / `X-Project-Id`
    /// headers (or query parameters) and in-memory backends are allowed.
    /// When disabled, `Authorization` is required and verified.
    pub debug: bool,

    /// Base sandbox mount.
    pub work_root: PathBuf,

    /// Per-request work root template.
    pub work_prefix_template: String,

    /// Keepalive interval for streaming responses, milliseconds.
    pub events_heartbeat_ms: u64,

    /// Initial reconnect backoff for the pull client, milliseconds.
    pub reconnect_backoff_ms: u64,

    /// Subprocess ceiling for `RUN_COMMAND`, seconds.
    pub run_command_timeout_seconds: u64,

    /// Cap on bytes returned by `READ_FILE`.
    pub read_file_max_bytes: usize,

    /// Cap on combined subprocess output bytes.
    pub output_max_bytes: usize,

    /// Whether streams run a sync before consuming events.
    pub sync_on_start: bool,

    /// Interval between periodic syncs, milliseconds.
    pub sync_interval_ms: u64,

    /// Whether the sync upload pass runs.
    pub gcs_enable_upload: bool,

    /// Download parallelism.
    pub gcs_download_concurrency: usize,

    /// Upload parallelism.
    pub gcs_upload_concurrency: usize,

    /// Upper bound on graceful shutdown, milliseconds.
    pub shutdown_timeout_ms: u64,

    /// Upstream workflows service base URL.
    pub upstream_url: String,

    /// Audience for upstream auth.
    #[serde(default)]
    pub upstream_audience: Option<String>,

    /// Bearer token for the upstream.
    #[serde(default)]
    pub upstream_token: Option<String>,

    /// Object store bucket for the sandbox mirror.
    #[serde(default)]
    pub storage_bucket: Option<String>,

    /// Ambient object store credential.
    #[serde(default)]
    pub storage_token: Option<String>,

    /// Template for per-stream object prefixes.
    pub sync_prefix_template: String,

    /// Producer image for local launches.
    pub producer_image: String,

    /// Consumer image for local launches.
    pub consumer_image: String,

    /// Port consumer sidecars listen on.
    pub consumer_port: u16,

    /// JWT authentication configuration.
    #[serde(default)]
    pub jwt: JwtConfig,

    /// CORS allowed origins. Empty disables CORS.
    #[serde(default)]
    pub cors_allowed_origins: Vec<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("http_port", &self.http_port)
            .field("debug", &self.debug)
            .field("work_root", &self.work_root)
            .field("work_prefix_template", &self.work_prefix_template)
            .field("upstream_url", &self.upstream_url)
            .field(
                "upstream_token",
                &self.upstream_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("storage_bucket", &self.storage_bucket)
            .field(
                "storage_token",
                &self.storage_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("jwt", &self.jwt)
            .finish_non_exhaustive()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            debug: false,
            work_root: PathBuf::from(DEFAULT_WORK_ROOT),
            work_prefix_template: DEFAULT_PREFIX_TEMPLATE.to_string(),
            events_heartbeat_ms: 15_000,
            reconnect_backoff_ms: 1_000,
            run_command_timeout_seconds: 120,
            read_file_max_bytes: 200_000,
            output_max_bytes: 50_000,
            sync_on_start: true,
            sync_interval_ms: 15_000,
            gcs_enable_upload: true,
            gcs_download_concurrency: 4,
            gcs_upload_concurrency: 4,
            shutdown_timeout_ms: 10_000,
            upstream_url: "http://localhost:8080".to_string(),
            upstream_audience: None,
            upstream_token: None,
            storage_bucket: None,
            storage_token: None,
            sync_prefix_template: DEFAULT_PREFIX_TEMPLATE.to_string(),
            producer_image: "relay/producer:latest".to_string(),
            consumer_image: "relay/consumer:latest".to_string(),
            consumer_port: 8081,
            jwt: JwtConfig::default(),
            cors_allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparseable values or a failed
    /// validation.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            http_port: env_parse("RELAY_HTTP_PORT", defaults.http_port)?,
            debug: env_flag("RELAY_DEBUG", defaults.debug)?,
            work_root: env_string("WORK_ROOT")
                .map_or(defaults.work_root, PathBuf::from),
            work_prefix_template: env_string("WORK_PREFIX_TEMPLATE")
                .unwrap_or(defaults.work_prefix_template),
            events_heartbeat_ms: env_parse("EVENTS_HEARTBEAT_MS", defaults.events_heartbeat_ms)?,
            reconnect_backoff_ms: env_parse(
                "RECONNECT_BACKOFF_MS",
                defaults.reconnect_backoff_ms,
            )?,
            run_command_timeout_seconds: env_parse(
                "RUN_COMMAND_TIMEOUT_SECONDS",
                defaults.run_command_timeout_seconds,
            )?,
            read_file_max_bytes: env_parse("READ_FILE_MAX_BYTES", defaults.read_file_max_bytes)?,
            output_max_bytes: env_parse("OUTPUT_MAX_BYTES", defaults.output_max_bytes)?,
            sync_on_start: env_flag("SYNC_ON_START", defaults.sync_on_start)?,
            sync_interval_ms: env_parse("SYNC_INTERVAL_MS", defaults.sync_interval_ms)?,
            gcs_enable_upload: env_flag("GCS_ENABLE_UPLOAD", defaults.gcs_enable_upload)?,
            gcs_download_concurrency: env_parse(
                "GCS_DOWNLOAD_CONCURRENCY",
                defaults.gcs_download_concurrency,
            )?,
            gcs_upload_concurrency: env_parse(
                "GCS_UPLOAD_CONCURRENCY",
                defaults.gcs_upload_concurrency,
            )?,
            shutdown_timeout_ms: env_parse("SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout_ms)?,
            upstream_url: env_string("RELAY_UPSTREAM_URL").unwrap_or(defaults.upstream_url),
            upstream_audience: env_string("RELAY_UPSTREAM_AUDIENCE"),
            upstream_token: env_string("RELAY_UPSTREAM_TOKEN"),
            storage_bucket: env_string("RELAY_STORAGE_BUCKET"),
            storage_token: env_string("RELAY_STORAGE_TOKEN"),
            sync_prefix_template: env_string("RELAY_SYNC_PREFIX_TEMPLATE")
                .unwrap_or(defaults.sync_prefix_template),
            producer_image: env_string("RELAY_PRODUCER_IMAGE").unwrap_or(defaults.producer_image),
            consumer_image: env_string("RELAY_CONSUMER_IMAGE").unwrap_or(defaults.consumer_image),
            consumer_port: env_parse("RELAY_CONSUMER_PORT", defaults.consumer_port)?,
            jwt: JwtConfig {
                hs256_secret: env_string("RELAY_JWT_SECRET"),
                user_claim: env_string("RELAY_JWT_USER_CLAIM").unwrap_or_else(default_user_claim),
                project_claim: env_string("RELAY_JWT_PROJECT_CLAIM")
                    .unwrap_or_else(default_project_claim),
            },
            cors_allowed_origins: env_string("RELAY_CORS_ALLOWED_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid combinations.
    pub fn validate(&self) -> Result<()> {
        if !self.debug && self.jwt.hs256_secret.is_none() {
            return Err(Error::config(
                "RELAY_JWT_SECRET is required when RELAY_DEBUG=false",
            ));
        }
        if self.storage_bucket.is_some() && self.storage_token.is_none() && !self.debug {
            return Err(Error::config(
                "RELAY_STORAGE_TOKEN is required with RELAY_STORAGE_BUCKET when RELAY_DEBUG=false",
            ));
        }
        Ok(())
    }

    /// Tool limits derived from this configuration.
    #[must_use]
    pub fn tool_config(&self) -> ToolConfig {
        ToolConfig {
            read_file_max_bytes: self.read_file_max_bytes,
            output_max_bytes: self.output_max_bytes,
            run_command_timeout: Duration::from_secs(self.run_command_timeout_seconds),
        }
    }

    /// Work root derivation spec.
    #[must_use]
    pub fn work_root_spec(&self) -> WorkRootSpec {
        WorkRootSpec::new(self.work_root.clone(), self.work_prefix_template.clone())
    }

    /// Launcher configuration.
    #[must_use]
    pub fn launcher_config(&self) -> LauncherConfig {
        LauncherConfig {
            upstream_url: self.upstream_url.clone(),
            upstream_audience: self.upstream_audience.clone(),
            upstream_token: self.upstream_token.clone(),
            producer_image: self.producer_image.clone(),
            consumer_image: self.consumer_image.clone(),
            consumer_port: self.consumer_port,
        }
    }

    /// Pull-stream configuration seeded with replay cursors.
    #[must_use]
    pub fn stream_config(
        &self,
        since_id: Option<String>,
        since_time: Option<chrono::DateTime<chrono::Utc>>,
    ) -> StreamConfig {
        StreamConfig {
            upstream_url: self.upstream_url.clone(),
            token: self.upstream_token.clone(),
            heartbeat: Duration::from_millis(self.events_heartbeat_ms),
            reconnect_backoff: Duration::from_millis(self.reconnect_backoff_ms),
            since_id,
            since_time,
            sync_on_start: self.sync_on_start,
            sync_interval: Duration::from_millis(self.sync_interval_ms),
            ..StreamConfig::default()
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("invalid {name}: '{raw}'"))),
        None => Ok(default),
    }
}

fn env_flag(name: &str, default: bool) -> Result<bool> {
    match env_string(name) {
        Some(raw) => match raw.trim() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(Error::config(format!("invalid {name}: '{other}'"))),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.events_heartbeat_ms, 15_000);
        assert_eq!(config.reconnect_backoff_ms, 1_000);
        assert_eq!(config.run_command_timeout_seconds, 120);
        assert_eq!(config.read_file_max_bytes, 200_000);
        assert_eq!(config.output_max_bytes, 50_000);
        assert!(config.sync_on_start);
        assert_eq!(config.sync_interval_ms, 15_000);
        assert!(config.gcs_enable_upload);
        assert_eq!(config.gcs_download_concurrency, 4);
        assert_eq!(config.work_prefix_template, "{projectId}/{workspaceId}");
        assert_eq!(config.work_root, PathBuf::from("/mnt/work"));
    }

    #[test]
    fn validate_requires_jwt_secret_outside_debug() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut debug = Config::default();
        debug.debug = true;
        assert!(debug.validate().is_ok());

        let mut with_secret = Config::default();
        with_secret.jwt.hs256_secret = Some("secret".into());
        assert!(with_secret.validate().is_ok());
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = Config::default();
        config.upstream_token = Some("super-secret".into());
        config.jwt.hs256_secret = Some("also-secret".into());

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("also-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
