//! # relay-sandbox
//!
//! Sandboxed tool execution for the Relay workflow execution bridge.
//!
//! This crate implements the per-request sandbox in which upstream tool
//! calls run:
//!
//! - **Work roots**: per-request directories derived from a template,
//!   strictly contained under the configured mount
//! - **Tools**: `READ_FILE`, `UPDATE_FILE`, and time/output-bounded
//!   `RUN_COMMAND`
//! - **Dispatch**: event parsing and tool routing where a tool error is a
//!   protocol success
//! - **Sync**: a bidirectional mirror of the work root against an object
//!   store prefix with manifest-based change detection and generation-based
//!   conflict protection
//!
//! ## Guarantees
//!
//! - Every filesystem effect of a tool invocation resides under the derived
//!   work root; escaping paths yield a `path_escape` tool error and no side
//!   effect.
//! - Exactly one result record is produced per dispatched event.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod dispatch;
pub mod event;
pub mod sync;
pub mod tools;
pub mod workroot;

pub use dispatch::{DispatchContext, Dispatcher, ToolConfig};
pub use event::{ToolEvent, ToolResultRecord};
pub use workroot::{WorkRoot, WorkRootSpec};
