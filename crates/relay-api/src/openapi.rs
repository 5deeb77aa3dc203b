//! OpenAPI document for the Relay API.

use utoipa::OpenApi;

use crate::error::ApiErrorBody;
use crate::routes::execs::{
    ExecRegisterRequest, LinkRegisterRequest, StatusQueryRequest, StatusUpdateRequest, TreeRequest,
};
use crate::routes::producer::{LockHeldResponse, StartRequest, StartResponse};

/// The aggregated OpenAPI document.
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::producer::start,
        crate::routes::producer::stop,
        crate::routes::sessions::consume,
        crate::routes::sessions::stream,
        crate::routes::execs::exec_register,
        crate::routes::execs::link_register,
        crate::routes::execs::links_by_calling,
        crate::routes::execs::link_by_triggered,
        crate::routes::execs::status_update,
        crate::routes::execs::latest_statuses,
        crate::routes::execs::tree,
    ),
    components(schemas(
        ApiErrorBody,
        StartRequest,
        StartResponse,
        LockHeldResponse,
        ExecRegisterRequest,
        LinkRegisterRequest,
        StatusUpdateRequest,
        StatusQueryRequest,
        TreeRequest,
    )),
    tags(
        (name = "Producer", description = "Executor lifecycle"),
        (name = "Sessions", description = "Event stream endpoints"),
        (name = "Execs", description = "Workflow execution lineage"),
    ),
    info(
        title = "Relay API",
        description = "Workflow execution bridge: tool-call dispatch to sandboxed executors",
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_core_paths() {
        let doc = ApiDoc::openapi();
        let json = serde_json::to_value(&doc).expect("serialize");
        let paths = json["paths"].as_object().expect("paths");

        for path in [
            "/producer/start",
            "/producer/stop",
            "/sessions/consume",
            "/sessions/stream",
            "/links/register",
            "/status/update",
            "/status",
            "/tree",
        ] {
            assert!(paths.contains_key(path), "missing path: {path}");
        }
    }
}
