//! HTTP route composition.

use std::sync::Arc;

use axum::Router;

use crate::server::AppState;

pub mod execs;
pub mod producer;
pub mod sessions;

/// Creates the Relay API routes.
#[must_use]
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(producer::routes())
        .merge(sessions::routes())
        .merge(execs::routes())
}
