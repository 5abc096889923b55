//! Process runtimes: where a stage command actually runs.
//!
//! Decouples the executor from the host-vs-container choice. Both
//! backends produce a `tokio::process::Command`; [`execute`] owns the
//! common part (stdin feed, line streaming, deadline, termination).

pub mod docker;
pub mod host;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use foreman_db::models::RuntimeKind;

pub use docker::DockerRuntime;
pub use host::HostRuntime;

/// Grace period between SIGTERM and SIGKILL.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// A bind mount into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// `-v` argument for `docker run`.
    pub fn docker_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Everything needed to launch one candidate command.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    /// Extra environment; values never appear on a command line.
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    /// Project directory on the host.
    pub workdir: PathBuf,
    pub timeout: Duration,
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// The candidate could not be started at all.
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Backend that turns a [`ProcessSpec`] into a runnable command.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Build the command. `label` names the run (container name under
    /// docker).
    fn command(&self, spec: &ProcessSpec, label: &str) -> Command;

    /// Release anything left behind after a killed process.
    async fn cleanup(&self, label: &str);
}

// Compile-time assertion: RuntimeBackend must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn RuntimeBackend) {}
};

/// Run `spec` on `backend`, feeding every output line to `on_line`.
///
/// On timeout the process gets SIGTERM, then SIGKILL after
/// [`TERM_GRACE`], and the backend cleans up.
pub async fn execute(
    backend: &dyn RuntimeBackend,
    spec: &ProcessSpec,
    label: &str,
    mut on_line: impl FnMut(OutputStream, &str) + Send,
) -> Result<ProcessOutcome, SpawnError> {
    let started = Instant::now();
    let mut cmd = backend.command(spec, label);
    cmd.stdin(if spec.stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| SpawnError {
        program: spec.program.clone(),
        source,
    })?;

    if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                debug!(error = %e, "stdin closed before prompt was written");
            }
            let _ = stdin.shutdown().await;
        });
    }

    let deadline = tokio::time::Instant::now() + spec.timeout;
    let mut timed_out = false;

    if let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) {
        let stdout = LinesStream::new(BufReader::new(stdout).lines())
            .map(|line| (OutputStream::Stdout, line));
        let stderr = LinesStream::new(BufReader::new(stderr).lines())
            .map(|line| (OutputStream::Stderr, line));
        let mut lines = futures::stream::select(stdout, stderr);

        loop {
            tokio::select! {
                next = lines.next() => match next {
                    Some((stream, Ok(line))) => on_line(stream, &line),
                    Some((stream, Err(e))) => {
                        warn!(?stream, error = %e, "error reading process output");
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => {
                    timed_out = true;
                    break;
                }
            }
        }
    }

    let exit_code = if timed_out {
        terminate(&mut child).await;
        None
    } else {
        match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                warn!(error = %e, "failed to wait for process");
                None
            }
            Err(_) => {
                timed_out = true;
                terminate(&mut child).await;
                None
            }
        }
    };

    if timed_out {
        backend.cleanup(label).await;
    }

    Ok(ProcessOutcome {
        exit_code,
        timed_out,
        duration: started.elapsed(),
    })
}

/// SIGTERM, wait up to [`TERM_GRACE`], then SIGKILL.
pub async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned and have not reaped.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(TERM_GRACE, child.wait()).await {
        Ok(Ok(_)) => debug!("process exited after SIGTERM"),
        _ => {
            debug!("process did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
}

/// Backend for a runtime kind.
pub fn backend_for(kind: RuntimeKind, docker_image: &str) -> Box<dyn RuntimeBackend> {
    match kind {
        RuntimeKind::Host => Box::new(HostRuntime),
        RuntimeKind::Docker => Box::new(DockerRuntime::new(docker_image)),
    }
}
