//! Execution backends for producers and consumers.
//!
//! Two abstractions, each with an in-memory implementation for tests:
//!
//! - [`ContainerRuntime`]: local container lifecycle (start, blocking wait,
//!   stop, remove). [`DockerRuntime`] shells out to the local container
//!   runtime; [`MemoryRuntime`] simulates containers whose exit the test
//!   controls.
//! - [`JobLauncher`]: remote job submission for cloud executors.
//!
//! The launcher's exit monitor is a blocking `wait` on the producer
//! container that then triggers cleanup.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};

use crate::error::{Error, Result};

/// Maximum container name length accepted by container runtimes.
pub const MAX_CONTAINER_NAME_LEN: usize = 63;

/// Truncates a container name to the runtime's limit.
#[must_use]
pub fn container_name(prefix: &str, consumer_id: &str) -> String {
    let mut name = format!("{prefix}{consumer_id}");
    name.truncate(MAX_CONTAINER_NAME_LEN);
    name
}

/// Everything needed to start one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name (unique per host).
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub env: Vec<(String, String)>,
}

/// Local container lifecycle operations.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Starts a detached container, returning the runtime's container id.
    async fn start(&self, spec: &ContainerSpec) -> Result<String>;

    /// Blocks until the named container exits, returning its exit code.
    async fn wait(&self, name: &str) -> Result<i64>;

    /// Stops the named container.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Removes the named container. Used on best-effort cleanup paths.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Remote job submission for cloud executors.
#[async_trait]
pub trait JobLauncher: Send + Sync + 'static {
    /// Submits a job, returning the remote operation name.
    async fn submit(&self, spec: &JobSpec) -> Result<String>;
}

/// Everything needed to submit one remote job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Job name.
    pub name: String,
    /// Image override, when the job template allows one.
    pub image: Option<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
}

/// Container runtime backed by the local `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerRuntime {
    /// Creates a runtime using `docker` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Overrides the runtime binary (e.g. `podman`).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    async fn exec(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::runtime(format!("{} {}: {e}", self.binary, args.join(" "))))?;

        if !output.status.success() {
            return Err(Error::runtime(format!(
                "{} {} exited {}: {}",
                self.binary,
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
        ];
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.image.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.exec(&arg_refs).await
    }

    async fn wait(&self, name: &str) -> Result<i64> {
        let stdout = self.exec(&["wait", name]).await?;
        stdout
            .parse()
            .map_err(|_| Error::runtime(format!("unparseable exit code from wait: '{stdout}'")))
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.exec(&["stop", name]).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.exec(&["rm", "-f", name]).await.map(|_| ())
    }
}

struct MemoryContainer {
    spec: ContainerSpec,
    exit_tx: watch::Sender<Option<i64>>,
    exit_rx: watch::Receiver<Option<i64>>,
}

/// In-memory container runtime for tests.
///
/// Containers run until the test finishes them via
/// [`MemoryRuntime::finish`] or the launcher stops them.
#[derive(Default)]
pub struct MemoryRuntime {
    containers: Mutex<HashMap<String, MemoryContainer>>,
}

impl MemoryRuntime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals that the named container exited with `code`.
    pub async fn finish(&self, name: &str, code: i64) {
        let containers = self.containers.lock().await;
        if let Some(container) = containers.get(name) {
            let _ = container.exit_tx.send(Some(code));
        }
    }

    /// Returns the names of containers that have been started and not
    /// removed.
    pub async fn names(&self) -> Vec<String> {
        self.containers.lock().await.keys().cloned().collect()
    }

    /// Returns the spec the named container was started with.
    pub async fn spec_of(&self, name: &str) -> Option<ContainerSpec> {
        self.containers
            .lock()
            .await
            .get(name)
            .map(|c| c.spec.clone())
    }

    /// Returns whether the named container has exited.
    pub async fn exited(&self, name: &str) -> bool {
        self.containers
            .lock()
            .await
            .get(name)
            .is_some_and(|c| c.exit_rx.borrow().is_some())
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<String> {
        let mut containers = self.containers.lock().await;
        if containers.contains_key(&spec.name) {
            return Err(Error::runtime(format!(
                "container name already in use: {}",
                spec.name
            )));
        }
        let (exit_tx, exit_rx) = watch::channel(None);
        containers.insert(
            spec.name.clone(),
            MemoryContainer {
                spec: spec.clone(),
                exit_tx,
                exit_rx,
            },
        );
        Ok(format!("mem-{}", spec.name))
    }

    async fn wait(&self, name: &str) -> Result<i64> {
        let mut rx = {
            let containers = self.containers.lock().await;
            containers
                .get(name)
                .map(|c| c.exit_rx.clone())
                .ok_or_else(|| Error::runtime(format!("no such container: {name}")))?
        };

        loop {
            if let Some(code) = *rx.borrow() {
                return Ok(code);
            }
            rx.changed()
                .await
                .map_err(|_| Error::runtime(format!("container removed while waiting: {name}")))?;
        }
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.finish(name, 137).await;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.containers.lock().await.remove(name);
        Ok(())
    }
}

/// In-memory job launcher for tests.
#[derive(Default)]
pub struct MemoryJobLauncher {
    submitted: Mutex<Vec<JobSpec>>,
}

impl MemoryJobLauncher {
    /// Creates an empty launcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the jobs submitted so far.
    pub async fn submitted(&self) -> Vec<JobSpec> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl JobLauncher for MemoryJobLauncher {
    async fn submit(&self, spec: &JobSpec) -> Result<String> {
        let mut submitted = self.submitted.lock().await;
        submitted.push(spec.clone());
        Ok(format!("operations/{}", spec.name))
    }
}
