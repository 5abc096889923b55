//! Installation discovery for agent CLIs.
//!
//! Probing spawns processes, so it only runs when asked (`POST
//! /discovery/scan`), never per dispatch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use foreman_db::models::{InstallationStatus, RuntimeKind};
use foreman_db::queries::installations::NewInstallation;

use super::{AgentAdapter, AgentManifest, AgentRegistry};

/// How long a version command may run.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of probing one adapter on one runtime.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub agent: String,
    pub runtime: RuntimeKind,
    pub location: Option<String>,
    pub version: Option<String>,
    pub status: InstallationStatus,
    pub detail: Option<String>,
    pub manifest: AgentManifest,
}

impl ProbeResult {
    pub fn to_installation(&self) -> NewInstallation {
        NewInstallation {
            agent: self.agent.clone(),
            runtime: self.runtime,
            location: self.location.clone(),
            version: self.version.clone(),
            status: self.status,
            manifest: serde_json::to_value(&self.manifest).unwrap_or_default(),
            detail: self.detail.clone(),
        }
    }
}

/// Probe every registered adapter.
pub async fn probe_all(
    registry: &AgentRegistry,
    runtime: RuntimeKind,
    docker_image: &str,
    timeout: Duration,
) -> Vec<ProbeResult> {
    let mut results = Vec::with_capacity(registry.len());
    for adapter in registry.adapters() {
        results.push(probe(adapter.as_ref(), runtime, docker_image, timeout).await);
    }
    results
}

/// Locate the adapter's binary and classify the installation.
///
/// * `missing`: binary not found (or docker itself is unavailable).
/// * `degraded`: found, but the version command failed or timed out.
/// * `ready`: version command exited 0.
pub async fn probe(
    adapter: &dyn AgentAdapter,
    runtime: RuntimeKind,
    docker_image: &str,
    timeout: Duration,
) -> ProbeResult {
    let mut result = ProbeResult {
        agent: adapter.name().to_string(),
        runtime,
        location: None,
        version: None,
        status: InstallationStatus::Missing,
        detail: None,
        manifest: adapter.manifest(),
    };

    if !result.manifest.supports_runtime(runtime) {
        result.detail = Some(format!("{} does not support the {runtime} runtime", adapter.name()));
        return result;
    }

    match runtime {
        RuntimeKind::Host => probe_host(adapter, timeout, &mut result).await,
        RuntimeKind::Docker => probe_docker(adapter, docker_image, timeout, &mut result).await,
    }
    debug!(agent = %result.agent, %runtime, status = %result.status, "probed agent");
    result
}

async fn probe_host(adapter: &dyn AgentAdapter, timeout: Duration, result: &mut ProbeResult) {
    let Some(path) = find_in_path(adapter.binary(), std::env::var_os("PATH").as_deref()) else {
        result.detail = Some(format!("{} not found on PATH", adapter.binary()));
        return;
    };
    result.location = Some(path.display().to_string());

    let mut cmd = Command::new(&path);
    cmd.args(adapter.version_args());
    classify_version_output(run_with_timeout(cmd, timeout).await, result);
}

async fn probe_docker(
    adapter: &dyn AgentAdapter,
    image: &str,
    timeout: Duration,
    result: &mut ProbeResult,
) {
    let binary = adapter.binary();
    let script = format!(
        "command -v {bin} || exit 127; {bin} {args}",
        bin = shell_quote(binary),
        args = adapter
            .version_args()
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" "),
    );
    let mut cmd = Command::new("docker");
    cmd.args(["run", "--rm", "--entrypoint", "sh", image, "-c", &script]);

    match run_with_timeout(cmd, timeout).await {
        Err(detail) => {
            result.detail = Some(detail);
        }
        Ok(output) if output.status.code() == Some(127) => {
            result.detail = Some(format!("{binary} not found in image {image}"));
        }
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let mut lines = stdout.lines();
            result.location = lines.next().map(|l| l.trim().to_string());
            let rest: Vec<&str> = lines.collect();
            if output.status.success() {
                result.status = InstallationStatus::Ready;
                result.version = first_nonempty(&rest.join("\n"));
            } else {
                result.status = InstallationStatus::Degraded;
                result.detail = Some(format!(
                    "version check exited with {}",
                    output.status.code().unwrap_or(-1)
                ));
            }
        }
    }
}

fn classify_version_output(
    output: Result<std::process::Output, String>,
    result: &mut ProbeResult,
) {
    match output {
        Ok(output) if output.status.success() => {
            result.status = InstallationStatus::Ready;
            result.version = first_nonempty(&String::from_utf8_lossy(&output.stdout))
                .or_else(|| first_nonempty(&String::from_utf8_lossy(&output.stderr)));
        }
        Ok(output) => {
            result.status = InstallationStatus::Degraded;
            result.detail = Some(format!(
                "version check exited with {}",
                output.status.code().unwrap_or(-1)
            ));
        }
        Err(detail) => {
            result.status = InstallationStatus::Degraded;
            result.detail = Some(detail);
        }
    }
}

async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<std::process::Output, String> {
    cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(format!("failed to run version check: {e}")),
        Err(_) => Err(format!("version check timed out after {}s", timeout.as_secs())),
    }
}

fn first_nonempty(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Resolve `binary` against `path_var` the way a shell would.
///
/// Names containing a `/` are checked as given.
pub fn find_in_path(binary: &str, path_var: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    if binary.contains('/') {
        let path = PathBuf::from(binary);
        return is_executable(&path).then_some(path);
    }
    let path_var = path_var?;
    std::env::split_paths(path_var)
        .map(|dir| dir.join(binary))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
