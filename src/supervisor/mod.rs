// ABOUTME: Process supervisor that spawns per-project backend processes and owns their lifetime
// Discovers the backend's listen address by scanning its merged stdout/stderr output

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_stream::adapters::Merge;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

type BackendOutput = Merge<
    LinesStream<BufReader<ChildStdout>>,
    LinesStream<BufReader<ChildStderr>>,
>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("backend command is empty")]
    EmptyCommand,

    #[error("failed to start backend process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("backend process produced no output pipes")]
    MissingPipes,

    #[error("backend did not announce a listen address within {0:?}")]
    DiscoveryTimeout(Duration),
}

/// Spawns backend processes and extracts their announced listen address.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    command: Vec<String>,
    discovery_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(command: Vec<String>, discovery_timeout: Duration) -> Self {
        Self {
            command,
            discovery_timeout,
        }
    }

    /// Launch the backend command rooted at `directory` and wait for it to
    /// announce its listen address on stdout or stderr.
    ///
    /// The returned handle exclusively owns the process; cancelling it kills
    /// and reaps the child. On discovery timeout the process is torn down
    /// before the error is returned.
    pub async fn spawn(&self, directory: &Path) -> Result<(ProcessHandle, Url), SupervisorError> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or(SupervisorError::EmptyCommand)?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let stdout = child.stdout.take().ok_or(SupervisorError::MissingPipes)?;
        let stderr = child.stderr.take().ok_or(SupervisorError::MissingPipes)?;
        let mut lines: BackendOutput = LinesStream::new(BufReader::new(stdout).lines())
            .merge(LinesStream::new(BufReader::new(stderr).lines()));

        let discovered = tokio::time::timeout(self.discovery_timeout, async {
            let address = first_address(&mut lines).await;
            match address {
                Some(address) => address,
                // Output ended without an address (the process likely died
                // early); hold until the deadline fires, matching the fixed
                // discovery window.
                None => std::future::pending().await,
            }
        })
        .await;

        let address = match discovered {
            Ok(address) => address,
            Err(_) => {
                kill_and_reap(child).await;
                return Err(SupervisorError::DiscoveryTimeout(self.discovery_timeout));
            }
        };

        let pid = child.id();
        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(monitor_process(child, lines, cancel.clone()));

        debug!("backend for {} announced {address}", directory.display());
        Ok((
            ProcessHandle {
                cancel,
                monitor: Some(monitor),
                pid,
            },
            address,
        ))
    }
}

/// Owned reference to a spawned backend process.
///
/// The cancellation scope is the sole termination path: triggering it stops
/// output consumption, signals the process, and reaps it. `shutdown` is
/// idempotent; dropping the handle cancels the scope as a last resort.
#[derive(Debug)]
pub struct ProcessHandle {
    cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
    pid: Option<u32>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminate the process and wait until it has been reaped.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                warn!("backend monitor task failed during shutdown: {e}");
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // The monitor task finishes the kill/reap on its own.
        self.cancel.cancel();
    }
}

/// Scan merged output lines for the first whitespace-separated token that
/// looks like a URL. Returns `None` when the stream ends without one.
async fn first_address(lines: &mut BackendOutput) -> Option<Url> {
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("error reading backend output: {e}");
                return None;
            }
        };
        debug!("backend: {line}");
        if let Some(token) = extract_address(&line) {
            match Url::parse(token) {
                Ok(url) => return Some(url),
                Err(e) => warn!("ignoring unparsable address token {token:?}: {e}"),
            }
        }
    }
    None
}

fn extract_address(line: &str) -> Option<&str> {
    line.split_whitespace()
        .find(|token| token.starts_with("http://") || token.starts_with("https://"))
}

async fn monitor_process(mut child: Child, mut lines: BackendOutput, cancel: CancellationToken) {
    let mut output_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                match child.wait().await {
                    Ok(status) => debug!("backend process stopped: {status}"),
                    Err(e) => warn!("failed to reap backend process: {e}"),
                }
                return;
            }
            status = child.wait() => {
                match status {
                    Ok(status) => warn!("backend process exited unexpectedly: {status}"),
                    Err(e) => warn!("failed to wait on backend process: {e}"),
                }
                return;
            }
            line = lines.next(), if output_open => {
                match line {
                    Some(Ok(line)) => debug!("backend: {line}"),
                    Some(Err(_)) | None => output_open = false,
                }
            }
        }
    }
}

async fn kill_and_reap(mut child: Child) {
    let _ = child.start_kill();
    if let Err(e) = child.wait().await {
        warn!("failed to reap backend process after discovery failure: {e}");
    }
}
