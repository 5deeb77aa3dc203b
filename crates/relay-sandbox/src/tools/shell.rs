//! The `RUN_COMMAND` tool: time- and output-bounded shell execution.
//!
//! Commands run under a login shell (`sh -lc`) with the work root as the
//! working directory. On timeout the child receives SIGTERM, then SIGKILL
//! after a 2 second grace window. Combined stdout and stderr are captured
//! into a bounded tail buffer: when the cap is exceeded the oldest bytes are
//! dropped.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::tools::{ToolError, ToolResult};
use crate::workroot::WorkRoot;

/// Default subprocess ceiling.
pub const DEFAULT_RUN_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Default cap on combined stdout/stderr bytes.
pub const DEFAULT_OUTPUT_MAX_BYTES: usize = 50_000;

/// Grace window between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Arguments for `RUN_COMMAND`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunCommandArgs {
    /// Shell command line.
    pub command: String,
}

/// Output of `RUN_COMMAND`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCommandOutput {
    /// Process exit code, `null` on timeout or signal death.
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, capped with oldest bytes dropped.
    pub output: String,
    /// `"timeout"` when the command exceeded its budget, empty otherwise.
    pub error: String,
    /// The timeout that applied, in milliseconds.
    pub timeout_ms: u64,
}

/// Bounded tail buffer: keeps the most recent `cap` bytes.
#[derive(Debug)]
struct Tail {
    buf: Vec<u8>,
    cap: usize,
}

impl Tail {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.cap == 0 {
            return;
        }
        if chunk.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + chunk.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend_from_slice(chunk);
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

/// Runs a shell command inside the work root.
///
/// # Errors
///
/// Returns a tool error when the shell cannot be spawned. Timeouts are not
/// errors at this level: they produce a `RunCommandOutput` with
/// `exit_code: null` and `error: "timeout"`.
pub async fn run_command(
    root: &WorkRoot,
    command: &str,
    timeout: Duration,
    output_cap: usize,
) -> ToolResult<RunCommandOutput> {
    let mut child = Command::new("/bin/sh")
        .arg("-lc")
        .arg(command)
        .current_dir(root.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::new(format!("spawn failed: {e}")))?;

    let tail = Arc::new(Mutex::new(Tail::new(output_cap)));
    let mut readers = Vec::new();

    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(drain(stdout, Arc::clone(&tail))));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(drain(stderr, Arc::clone(&tail))));
    }

    let pid = child.id();
    if let Ok(status) = tokio::time::timeout(timeout, child.wait()).await {
        let status = status.map_err(|e| ToolError::new(format!("wait failed: {e}")))?;
        return Ok(RunCommandOutput {
            exit_code: status.code(),
            output: collect_tail(readers, tail).await,
            error: String::new(),
            timeout_ms: timeout.as_millis() as u64,
        });
    }

    // Budget exceeded: terminate, then hard-kill after the grace window.
    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    Ok(RunCommandOutput {
        exit_code: None,
        output: collect_tail(readers, tail).await,
        error: "timeout".to_string(),
        timeout_ms: timeout.as_millis() as u64,
    })
}

async fn collect_tail(
    readers: Vec<tokio::task::JoinHandle<()>>,
    tail: Arc<Mutex<Tail>>,
) -> String {
    for reader in readers {
        let _ = reader.await;
    }
    Arc::try_unwrap(tail)
        .map(tokio::sync::Mutex::into_inner)
        .unwrap_or_else(|_| Tail::new(0))
        .into_string()
}

async fn drain<R>(mut reader: R, tail: Arc<Mutex<Tail>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => tail.lock().await.push(&chunk[..n]),
        }
    }
}
