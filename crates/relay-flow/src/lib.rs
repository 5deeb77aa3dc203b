//! # relay-flow
//!
//! Executor lifecycle orchestration for the Relay workflow execution bridge.
//!
//! This crate implements the consumer-lifecycle core:
//!
//! - **Consumer lock**: lease-based mutual exclusion ensuring at most one
//!   live executor per project, with TTL expiry and owner-scoped release
//! - **Workspaces**: per-project sandbox registrations with heartbeats
//! - **Exec registry**: workflow execution lineage (registrations, links,
//!   statuses, and the derived exec tree)
//! - **Runner launcher**: producer/consumer startup as local containers or
//!   remote jobs, runtime descriptor persistence, and the exit monitor
//! - **Event stream client**: the pull+callback driver with replay cursors
//!   and reconnect backoff
//!
//! ## Guarantees
//!
//! - Lock acquisition is linearizable through the metadata store's CAS;
//!   exactly one acquirer wins per expiry window.
//! - The lock is never orphaned by a clean error path: any failure between
//!   acquisition and a successful producer start triggers cleanup and an
//!   owner-scoped release.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod execs;
pub mod launcher;
pub mod lock;
pub mod runtime;
pub mod stream;
pub mod workspace;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::execs::ExecRegistry;
    pub use crate::launcher::{ProducerLauncher, StartOutcome, StartRequest, StopOutcome};
    pub use crate::lock::{AcquireOutcome, ConsumerLock, ConsumerType, LockManager};
    pub use crate::runtime::{ContainerRuntime, DockerRuntime, JobLauncher, MemoryRuntime};
    pub use crate::workspace::{Workspace, WorkspaceRegistry};
}
