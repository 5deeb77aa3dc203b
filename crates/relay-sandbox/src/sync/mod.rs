//! Bidirectional mirror between the work root and an object-store prefix.
//!
//! The engine keeps a manifest at the work root recording, per object, the
//! remote generation and the local file stats observed at the last
//! successful transfer. Change detection and conflict protection both hang
//! off that manifest:
//!
//! - **Download pass**: any object whose remote generation differs from the
//!   manifest is downloaded (remote wins).
//! - **Upload pass**: any file whose local stats differ from the manifest is
//!   uploaded with a generation precondition, unless the remote moved too -
//!   that is a conflict and the upload is skipped.

pub mod engine;
pub mod manifest;

pub use engine::{SyncConfig, SyncEngine, SyncStats, DEFAULT_SYNC_INTERVAL};
pub use manifest::{Manifest, ManifestEntry, MANIFEST_FILE};
