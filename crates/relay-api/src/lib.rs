//! # relay-api
//!
//! HTTP composition layer for the Relay workflow execution bridge.
//!
//! This crate provides the API surface for Relay, handling:
//!
//! - **Authentication**: identity extraction (debug headers or JWT claims)
//! - **Routing**: producer lifecycle, streaming sessions, exec registry
//! - **Service wiring**: composition of lock, launcher, dispatcher, sync
//! - **Observability**: request-id correlation, tracing, health checks
//!
//! ## Design Principles
//!
//! This crate is a thin composition layer with no domain policy. All
//! business logic lives in `relay-flow` and `relay-sandbox`.
//!
//! ## Endpoints
//!
//! ```text
//! GET  /health             - Liveness check
//! GET  /ready              - Readiness check
//! POST /producer/start     - Start a producer/consumer pair
//! POST /producer/stop      - Stop the project's executor
//! GET  /sessions/consume   - Pull+callback event stream
//! POST /sessions/stream    - NDJSON push stream
//! POST /links/register     - Register an exec parent/child link
//! GET  /links/by-calling/{id}
//! GET  /links/by-triggered/{id}
//! POST /execs/register     - Register an exec
//! POST /status/update      - Report an exec status
//! POST /status             - Latest statuses for a session
//! POST /tree               - Exec tree/forest for a session
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod error;
pub mod openapi;
pub mod routes;
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::RequestScope;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::{AppState, Server};
}
