//! Launcher lifecycle tests: start, conflict, exit-monitor release, stop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use relay_core::docstore::MemoryDocStore;
use relay_core::Scope;
use relay_flow::launcher::{
    LaunchMode, LauncherConfig, ProducerLauncher, StartOutcome, StartRequest,
};
use relay_flow::lock::LockManager;
use relay_flow::runtime::{MemoryJobLauncher, MemoryRuntime};
use relay_flow::workspace::WorkspaceRegistry;

struct Harness {
    launcher: ProducerLauncher,
    locks: LockManager,
    runtime: Arc<MemoryRuntime>,
    jobs: Arc<MemoryJobLauncher>,
}

fn harness() -> Harness {
    let docs = Arc::new(MemoryDocStore::new());
    let locks = LockManager::new(docs.clone());
    let workspaces = WorkspaceRegistry::new(docs);
    let runtime = Arc::new(MemoryRuntime::new());
    let jobs = Arc::new(MemoryJobLauncher::new());
    let launcher = ProducerLauncher::new(
        locks.clone(),
        workspaces,
        runtime.clone(),
        jobs.clone(),
        LauncherConfig::default(),
        CancellationToken::new(),
    );
    Harness {
        launcher,
        locks,
        runtime,
        jobs,
    }
}

fn scope() -> Scope {
    Scope::new("u1", "p1").expect("scope")
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn start_brings_up_sidecar_and_producer() {
    let h = harness();

    let outcome = h
        .launcher
        .start(&scope(), &StartRequest::default())
        .await
        .expect("start");

    let StartOutcome::Started {
        consumer_id, lock, ..
    } = outcome
    else {
        panic!("expected started");
    };

    let names = h.runtime.names().await;
    assert_eq!(names.len(), 2);
    assert!(names
        .iter()
        .any(|n| n == &format!("sse-consumer-{consumer_id}")));
    assert!(names.iter().any(|n| n == &format!("producer-{consumer_id}")));

    // Runtime descriptor landed on the lock.
    assert_eq!(lock.runtime["mode"], "local-sandbox");
    assert_eq!(lock.runtime["sidecar"], true);
    assert!(lock.runtime["producerContainer"]
        .as_str()
        .expect("producer container")
        .starts_with("producer-"));

    // The producer env carries the composed identity.
    let producer_name = lock.runtime["producerContainer"].as_str().expect("name");
    let spec = h.runtime.spec_of(producer_name).await.expect("spec");
    let env: std::collections::HashMap<_, _> = spec.env.into_iter().collect();
    assert_eq!(env.get("RELAY_USER_ID").map(String::as_str), Some("u1"));
    assert_eq!(env.get("RELAY_PROJECT_ID").map(String::as_str), Some("p1"));
    assert_eq!(
        env.get("RELAY_CONSUMER_ID").map(String::as_str),
        Some(consumer_id.as_str())
    );
    assert!(env.contains_key("RELAY_WORKSPACE_ID"));
    assert!(env
        .get("RELAY_CONSUMER_BASE_URL")
        .expect("consumer base url")
        .starts_with("http://sse-consumer-"));
}

#[tokio::test]
async fn second_start_reports_lock_held() {
    let h = harness();

    let first = h
        .launcher
        .start(&scope(), &StartRequest::default())
        .await
        .expect("first start");
    let StartOutcome::Started { consumer_id, .. } = first else {
        panic!("expected started");
    };

    let second = h
        .launcher
        .start(&scope(), &StartRequest::default())
        .await
        .expect("second start");
    match second {
        StartOutcome::LockHeld(conflict) => {
            assert_eq!(conflict.current_consumer_id, consumer_id.to_string());
        }
        StartOutcome::Started { .. } => panic!("expected lock held"),
    }

    // Nothing extra was started.
    assert_eq!(h.runtime.names().await.len(), 2);
}

#[tokio::test]
async fn producer_exit_releases_lock_and_stops_sidecar() {
    let h = harness();

    let outcome = h
        .launcher
        .start(&scope(), &StartRequest::default())
        .await
        .expect("start");
    let StartOutcome::Started { lock, .. } = outcome else {
        panic!("expected started");
    };
    let producer_name = lock.runtime["producerContainer"]
        .as_str()
        .expect("name")
        .to_string();

    h.runtime.finish(&producer_name, 0).await;

    let locks = h.locks.clone();
    wait_for(|| {
        let locks = locks.clone();
        async move { locks.get(&scope()).await.expect("get").is_none() }
    })
    .await;

    // A third start now succeeds.
    let third = h
        .launcher
        .start(&scope(), &StartRequest::default())
        .await
        .expect("third start");
    assert!(matches!(third, StartOutcome::Started { .. }));
}

#[tokio::test]
async fn remote_job_start_submits_job() {
    let h = harness();
    let request = StartRequest {
        mode: Some(LaunchMode::RemoteJob),
        ..StartRequest::default()
    };

    let outcome = h.launcher.start(&scope(), &request).await.expect("start");
    let StartOutcome::Started { mode, lock, .. } = outcome else {
        panic!("expected started");
    };

    assert_eq!(mode, LaunchMode::RemoteJob);
    assert!(h.runtime.names().await.is_empty());
    assert_eq!(h.jobs.submitted().await.len(), 1);
    assert!(lock.runtime["operation"]
        .as_str()
        .expect("operation")
        .starts_with("operations/"));
}

#[tokio::test]
async fn stop_local_tears_down_and_releases() {
    let h = harness();
    h.launcher
        .start(&scope(), &StartRequest::default())
        .await
        .expect("start");

    let stopped = h.launcher.stop(&scope()).await.expect("stop");
    assert!(stopped.ok);
    assert_eq!(stopped.mode, Some(LaunchMode::LocalSandbox));
    assert!(stopped.released);
    assert!(h.locks.get(&scope()).await.expect("get").is_none());

    // Stop again: idempotent, nothing to do.
    let again = h.launcher.stop(&scope()).await.expect("stop again");
    assert!(again.ok);
    assert!(!again.released);
    assert_eq!(again.results, vec!["no active lock".to_string()]);
}

#[tokio::test]
async fn stop_remote_marks_stop_requested_before_release() {
    let h = harness();
    h.launcher
        .start(
            &scope(),
            &StartRequest {
                mode: Some(LaunchMode::RemoteJob),
                ..StartRequest::default()
            },
        )
        .await
        .expect("start");

    let stopped = h.launcher.stop(&scope()).await.expect("stop");
    assert!(stopped.ok);
    assert_eq!(stopped.mode, Some(LaunchMode::RemoteJob));
    assert!(stopped.released);
    assert!(stopped
        .results
        .iter()
        .any(|line| line.contains("stop requested")));
}

/// Runtime whose producer starts fail; sidecars start normally.
struct FailingProducerRuntime {
    inner: MemoryRuntime,
}

#[async_trait::async_trait]
impl relay_flow::runtime::ContainerRuntime for FailingProducerRuntime {
    async fn start(
        &self,
        spec: &relay_flow::runtime::ContainerSpec,
    ) -> relay_flow::error::Result<String> {
        if spec.name.starts_with("producer-") {
            return Err(relay_flow::error::Error::runtime("image pull failed"));
        }
        self.inner.start(spec).await
    }

    async fn wait(&self, name: &str) -> relay_flow::error::Result<i64> {
        self.inner.wait(name).await
    }

    async fn stop(&self, name: &str) -> relay_flow::error::Result<()> {
        self.inner.stop(name).await
    }

    async fn remove(&self, name: &str) -> relay_flow::error::Result<()> {
        self.inner.remove(name).await
    }
}

#[tokio::test]
async fn failed_producer_start_cleans_up_and_releases_lock() {
    let docs = Arc::new(MemoryDocStore::new());
    let locks = LockManager::new(docs.clone());
    let workspaces = WorkspaceRegistry::new(docs);
    let runtime = Arc::new(FailingProducerRuntime {
        inner: MemoryRuntime::new(),
    });
    let launcher = ProducerLauncher::new(
        locks.clone(),
        workspaces,
        runtime.clone(),
        Arc::new(MemoryJobLauncher::new()),
        LauncherConfig::default(),
        CancellationToken::new(),
    );

    let result = launcher.start(&scope(), &StartRequest::default()).await;
    assert!(result.is_err());

    // The sidecar that did start was removed and the lock is not orphaned.
    assert!(runtime.inner.names().await.is_empty());
    assert!(locks.get(&scope()).await.expect("get").is_none());

    // The scope is immediately startable elsewhere.
    let retry = ProducerLauncher::new(
        locks.clone(),
        WorkspaceRegistry::new(Arc::new(MemoryDocStore::new())),
        Arc::new(MemoryRuntime::new()),
        Arc::new(MemoryJobLauncher::new()),
        LauncherConfig::default(),
        CancellationToken::new(),
    );
    let outcome = retry
        .start(&scope(), &StartRequest::default())
        .await
        .expect("retry start");
    assert!(matches!(outcome, StartOutcome::Started { .. }));
}

#[tokio::test]
async fn explicit_unknown_workspace_is_rejected_before_locking() {
    let h = harness();
    let request = StartRequest {
        workspace_id: Some("01J00000000000000000000000".to_string()),
        ..StartRequest::default()
    };

    let result = h.launcher.start(&scope(), &request).await;
    assert!(result.is_err());
    assert!(h.locks.get(&scope()).await.expect("get").is_none());
    assert!(h.runtime.names().await.is_empty());
}
