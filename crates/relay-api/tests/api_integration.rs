//! End-to-end API tests over in-memory backends.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use relay_api::config::Config;
use relay_api::server::{router, AppState};
use relay_core::docstore::MemoryDocStore;
use relay_core::storage::MemoryBackend;
use relay_flow::runtime::{MemoryJobLauncher, MemoryRuntime};

fn test_config(work_root: &Path) -> Config {
    Config {
        debug: true,
        work_root: work_root.to_path_buf(),
        ..Config::default()
    }
}

struct Harness {
    app: Router,
    runtime: Arc<MemoryRuntime>,
    _work_root: tempfile::TempDir,
}

fn harness_with(config_fn: impl FnOnce(Config) -> Config) -> Harness {
    let work_root = tempfile::tempdir().expect("tempdir");
    let config = config_fn(test_config(work_root.path()));
    let runtime = Arc::new(MemoryRuntime::new());
    let state = AppState::new(
        config,
        Arc::new(MemoryDocStore::new()),
        Some(Arc::new(MemoryBackend::new())),
        runtime.clone(),
        Arc::new(MemoryJobLauncher::new()),
    );
    Harness {
        app: router(Arc::new(state)),
        runtime,
        _work_root: work_root,
    }
}

fn harness() -> Harness {
    harness_with(|config| config)
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-id", "u1")
        .header("x-project-id", "p1");

    match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 4 * 1024 * 1024)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

async fn call(app: &Router, req: Request<Body>) -> axum::response::Response {
    app.clone().oneshot(req).await.expect("response")
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let h = harness();
    let response = call(
        &h.app,
        Request::builder()
            .method("POST")
            .uri("/producer/start")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .expect("request"),
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["code"], "MISSING_AUTH");
}

#[tokio::test]
async fn identity_via_query_params_works() {
    let h = harness();
    let response = call(
        &h.app,
        Request::builder()
            .method("POST")
            .uri("/producer/stop?userId=u1&projectId=p1")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// Producer lifecycle (lock contention scenario)
// ============================================================================

#[tokio::test]
async fn lock_contention_round_trip() {
    let h = harness();

    // First start wins the lock.
    let first = call(
        &h.app,
        request("POST", "/producer/start", Some(json!({"sessionId": "s1"}))),
    )
    .await;
    assert_eq!(first.status(), StatusCode::ACCEPTED);
    let first_body = json_body(first).await;
    assert_eq!(first_body["ok"], true);
    assert_eq!(first_body["mode"], "local-sandbox");
    let consumer_id = first_body["consumerId"].as_str().expect("consumerId");

    // Second start reports the holder without starting anything.
    let second = call(
        &h.app,
        request("POST", "/producer/start", Some(json!({"sessionId": "s1"}))),
    )
    .await;
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    let second_body = json_body(second).await;
    assert_eq!(second_body["message"], "Lock held by another consumer");
    assert_eq!(second_body["details"]["currentConsumerId"], consumer_id);

    // The producer container exits; the exit monitor releases the lock.
    h.runtime.finish(&format!("producer-{consumer_id}"), 0).await;

    let mut third_body = Value::Null;
    for _ in 0..100 {
        let third = call(
            &h.app,
            request("POST", "/producer/start", Some(json!({"sessionId": "s1"}))),
        )
        .await;
        third_body = json_body(third).await;
        if third_body["ok"] == true {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(third_body["ok"], true, "third start should eventually win");
}

#[tokio::test]
async fn stop_without_lock_is_a_quiet_success() {
    let h = harness();
    let response = call(&h.app, request("POST", "/producer/stop", None)).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["released"], false);
    assert_eq!(body["results"][0], "no active lock");
}

#[tokio::test]
async fn start_then_stop_releases() {
    let h = harness();
    let start = call(&h.app, request("POST", "/producer/start", Some(json!({})))).await;
    assert_eq!(json_body(start).await["ok"], true);

    let stop = call(&h.app, request("POST", "/producer/stop", None)).await;
    let body = json_body(stop).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["released"], true);
    assert_eq!(body["mode"], "local-sandbox");

    // The scope is immediately startable again.
    let restart = call(&h.app, request("POST", "/producer/start", Some(json!({})))).await;
    assert_eq!(json_body(restart).await["ok"], true);
}

// ============================================================================
// Push streaming
// ============================================================================

async fn stream_lines(app: &Router, ndjson: &str) -> Vec<Value> {
    let response = call(
        app,
        Request::builder()
            .method("POST")
            .uri("/sessions/stream")
            .header("x-user-id", "u1")
            .header("x-project-id", "p1")
            .header("x-session-id", "s1")
            .header("content-type", "application/x-ndjson")
            .body(Body::from(ndjson.to_string()))
            .expect("request"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/x-ndjson")
    );

    let bytes = axum::body::to_bytes(response.into_body(), 4 * 1024 * 1024)
        .await
        .expect("body");
    String::from_utf8_lossy(&bytes)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("response line"))
        .collect()
}

fn result_lines(lines: &[Value]) -> Vec<&Value> {
    lines.iter().filter(|line| line.get("type").is_none()).collect()
}

#[tokio::test]
async fn push_stream_write_read_list_in_order() {
    let h = harness();

    let events = [
        json!({"id": "1", "tool_call": {"function": {"name": "UPDATE_FILE",
            "arguments": {"filepath": "notes/a.txt", "content": "Hello"}}}}),
        json!({"id": "2", "tool_call": {"function": {"name": "READ_FILE",
            "arguments": {"filepath": "notes/a.txt"}}}}),
        json!({"id": "3", "tool_call": {"function": {"name": "RUN_COMMAND",
            "arguments": {"command": "ls -la notes"}}}}),
    ]
    .map(|e| e.to_string())
    .join("\n");

    let lines = stream_lines(&h.app, &format!("{events}\n")).await;
    let results = result_lines(&lines);
    assert_eq!(results.len(), 3);

    assert_eq!(results[0]["event_id"], "1");
    assert_eq!(results[0]["result"]["ok"], true);
    assert_eq!(results[0]["result"]["filepath"], "notes/a.txt");
    assert_eq!(results[0]["result"]["bytes"], 5);
    assert!(results[0]["error"].is_null());

    assert_eq!(results[1]["event_id"], "2");
    assert_eq!(results[1]["result"]["content"], "Hello");
    assert_eq!(results[1]["result"]["truncated"], false);

    assert_eq!(results[2]["event_id"], "3");
    assert_eq!(results[2]["result"]["exitCode"], 0);
    assert!(results[2]["result"]["output"]
        .as_str()
        .expect("output")
        .contains("a.txt"));
    assert_eq!(results[2]["result"]["error"], "");

    // Sync ran on start and at shutdown; each emitted a stats line.
    let sync_lines: Vec<_> = lines
        .iter()
        .filter(|line| line["type"] == "gcs_sync")
        .collect();
    assert!(sync_lines.len() >= 2);
    let last = sync_lines.last().expect("final sync");
    assert_eq!(last["uploaded"], 1);
}

#[tokio::test]
async fn push_stream_path_escape_is_an_error_result() {
    let h = harness();

    let lines = stream_lines(
        &h.app,
        &format!(
            "{}\n",
            json!({"id": "9", "tool_call": {"function": {"name": "READ_FILE",
                "arguments": {"filepath": "../etc/passwd"}}}})
        ),
    )
    .await;

    let results = result_lines(&lines);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["event_id"], "9");
    assert!(results[0]["result"].is_null());
    assert_eq!(results[0]["error"]["message"], "path_escape");
}

#[tokio::test]
async fn push_stream_unknown_tool_still_advances() {
    let h = harness();

    let events = [
        json!({"id": "1", "tool_call": {"function": {"name": "DELETE_FILE", "arguments": {}}}}),
        json!({"id": "2", "tool_call": {"function": {"name": "RUN_COMMAND",
            "arguments": {"command": "true"}}}}),
    ]
    .map(|e| e.to_string())
    .join("\n");

    let lines = stream_lines(&h.app, &format!("{events}\n")).await;
    let results = result_lines(&lines);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["error"]["message"], "unknown_tool");
    assert_eq!(results[1]["result"]["exitCode"], 0);
}

#[tokio::test]
async fn push_stream_command_timeout() {
    let h = harness_with(|mut config| {
        config.run_command_timeout_seconds = 1;
        config.sync_on_start = false;
        config
    });

    let started = Instant::now();
    let lines = stream_lines(
        &h.app,
        &format!(
            "{}\n",
            json!({"id": "1", "tool_call": {"function": {"name": "RUN_COMMAND",
                "arguments": {"command": "sleep 999"}}}})
        ),
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(4));
    let results = result_lines(&lines);
    assert_eq!(results.len(), 1);
    assert!(results[0]["result"]["exitCode"].is_null());
    assert_eq!(results[0]["result"]["error"], "timeout");
    assert_eq!(results[0]["result"]["timeoutMs"], 1000);
}

// ============================================================================
// Exec registry (tree scenario)
// ============================================================================

#[tokio::test]
async fn exec_tree_scenario() {
    let h = harness();

    for (exec_id, at) in [("A", 0), ("B", 1), ("C", 2)] {
        let response = call(
            &h.app,
            request(
                "POST",
                "/execs/register",
                Some(json!({
                    "execId": exec_id,
                    "sessionId": "s1",
                    "createdAt": format!("2024-06-01T00:00:0{at}Z"),
                })),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    for (calling, triggered, at) in [("A", "B", 0), ("A", "C", 1), ("C", "D", 2)] {
        let response = call(
            &h.app,
            request(
                "POST",
                "/links/register",
                Some(json!({
                    "callingExecId": calling,
                    "triggeredExecId": triggered,
                    "sessionId": "s1",
                    "createdAt": format!("2024-06-01T00:01:0{at}Z"),
                })),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Full forest: single root A with children [B, C]; C has no children
    // because D is unknown.
    let tree = call(
        &h.app,
        request("POST", "/tree", Some(json!({"sessionId": "s1"}))),
    )
    .await;
    let forest = json_body(tree).await;
    let forest = forest.as_array().expect("forest");
    assert_eq!(forest.len(), 1);
    assert_eq!(forest[0]["execId"], "A");
    let children = forest[0]["children"].as_array().expect("children");
    assert_eq!(children.len(), 2);
    assert_eq!(children[0]["execId"], "B");
    assert_eq!(children[1]["execId"], "C");
    assert!(children[1]["children"].as_array().expect("C children").is_empty());

    // latestOnly roots at the newest exec.
    let latest = call(
        &h.app,
        request(
            "POST",
            "/tree",
            Some(json!({"sessionId": "s1", "latestOnly": true})),
        ),
    )
    .await;
    let latest_forest = json_body(latest).await;
    assert_eq!(latest_forest[0]["execId"], "C");

    // Link lookups.
    let by_calling = call(&h.app, request("GET", "/links/by-calling/A", None)).await;
    let links = json_body(by_calling).await;
    assert_eq!(links.as_array().expect("links").len(), 2);

    let by_triggered = call(&h.app, request("GET", "/links/by-triggered/C", None)).await;
    let link = json_body(by_triggered).await;
    assert_eq!(link["callingExec"], "A");

    let no_parent = call(&h.app, request("GET", "/links/by-triggered/A", None)).await;
    assert_eq!(no_parent.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_update_and_query_flow() {
    let h = harness();

    call(
        &h.app,
        request(
            "POST",
            "/execs/register",
            Some(json!({"execId": "A", "sessionId": "s1"})),
        ),
    )
    .await;

    // Empty update is rejected.
    let empty = call(
        &h.app,
        request("POST", "/status/update", Some(json!({"execId": "A"}))),
    )
    .await;
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let update = call(
        &h.app,
        request(
            "POST",
            "/status/update",
            Some(json!({
                "execId": "A",
                "status": "RUNNING",
                "workflow": {"name": "ingest"},
            })),
        ),
    )
    .await;
    assert_eq!(update.status(), StatusCode::OK);
    let stored = json_body(update).await;
    assert_eq!(stored["status"], "RUNNING");
    assert_eq!(stored["ended"], false);

    let finish = call(
        &h.app,
        request(
            "POST",
            "/status/update",
            Some(json!({
                "execId": "A",
                "status": "SUCCEEDED",
                "ended": true,
                "result": {"rows": 10},
            })),
        ),
    )
    .await;
    assert_eq!(finish.status(), StatusCode::OK);

    let statuses = call(
        &h.app,
        request("POST", "/status", Some(json!({"sessionId": "s1"}))),
    )
    .await;
    let rows = json_body(statuses).await;
    let rows = rows.as_array().expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["execId"], "A");
    assert_eq!(rows[0]["status"], "SUCCEEDED");
    assert_eq!(rows[0]["ended"], true);
    assert_eq!(rows[0]["result"]["rows"], 10);

    // Execs with no status document report UNKNOWN.
    call(
        &h.app,
        request(
            "POST",
            "/execs/register",
            Some(json!({"execId": "B", "sessionId": "s1"})),
        ),
    )
    .await;
    let statuses = call(
        &h.app,
        request("POST", "/status", Some(json!({"sessionId": "s1"}))),
    )
    .await;
    let rows = json_body(statuses).await;
    let unknown = rows
        .as_array()
        .expect("rows")
        .iter()
        .find(|row| row["execId"] == "B")
        .expect("row B");
    assert_eq!(unknown["status"], "UNKNOWN");
}
