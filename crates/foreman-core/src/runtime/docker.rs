//! Docker runtime: run the CLI inside a throwaway container.
//!
//! The project is bind-mounted at `/workspace`; credential material is
//! mounted read-only. Environment variables are forwarded by name with
//! `-e NAME` so their values never reach the docker command line.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use foreman_db::models::RuntimeKind;

use super::{ProcessSpec, RuntimeBackend};

/// Mount point of the project inside the container.
pub const WORKSPACE: &str = "/workspace";

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    image: String,
}

impl DockerRuntime {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }
}

/// Container name for a run label (alphanumerics and hyphens only).
pub fn container_name(label: &str) -> String {
    let sanitized: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("foreman-{sanitized}")
}

/// Full `docker` argument vector for `spec`.
pub fn docker_args(spec: &ProcessSpec, image: &str, label: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "-i".to_string(),
        "--name".to_string(),
        container_name(label),
        "-w".to_string(),
        WORKSPACE.to_string(),
        "-v".to_string(),
        format!("{}:{WORKSPACE}", spec.workdir.display()),
    ];
    for mount in &spec.mounts {
        args.push("-v".to_string());
        args.push(mount.docker_arg());
    }
    for (key, _) in &spec.env {
        args.push("-e".to_string());
        args.push(key.clone());
    }
    args.push(image.to_string());
    args.push(spec.program.clone());
    args.extend(spec.args.iter().cloned());
    args
}

#[async_trait]
impl RuntimeBackend for DockerRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }

    fn command(&self, spec: &ProcessSpec, label: &str) -> Command {
        let mut cmd = Command::new("docker");
        cmd.args(docker_args(spec, &self.image, label));
        // `-e NAME` makes docker read the value from its own environment.
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }

    async fn cleanup(&self, label: &str) {
        let name = container_name(label);
        match Command::new("docker").args(["rm", "-f", &name]).output().await {
            Ok(output) if output.status.success() => debug!(container = %name, "removed container"),
            Ok(output) => debug!(
                container = %name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "container already gone"
            ),
            Err(e) => warn!(container = %name, error = %e, "failed to run docker rm"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::*;
    use crate::runtime::Mount;

    fn spec() -> ProcessSpec {
        ProcessSpec {
            program: "codex".into(),
            args: vec!["exec".into(), "-".into()],
            stdin: Some("prompt".into()),
            env: vec![("OPENAI_API_KEY".into(), "sk-live-secret".into())],
            mounts: vec![Mount::read_only("/home/u/.codex", "/root/.codex")],
            workdir: PathBuf::from("/src/project"),
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn args_mount_workspace_and_credentials() {
        let args = docker_args(&spec(), "foreman-agent:latest", "run-7-1");
        assert_eq!(&args[..3], &["run", "--rm", "-i"]);
        assert!(args.contains(&"/src/project:/workspace".to_string()));
        assert!(args.contains(&"/home/u/.codex:/root/.codex:ro".to_string()));
        assert!(args.contains(&"foreman-run-7-1".to_string()));
        let image_at = args.iter().position(|a| a == "foreman-agent:latest").unwrap();
        assert_eq!(&args[image_at + 1..], &["codex", "exec", "-"]);
    }

    #[test]
    fn env_values_stay_off_the_command_line() {
        let args = docker_args(&spec(), "img", "x");
        assert!(args.contains(&"OPENAI_API_KEY".to_string()));
        assert!(args.iter().all(|a| !a.contains("sk-live-secret")));
    }

    #[test]
    fn container_names_are_sanitized() {
        assert_eq!(container_name("run 3/attempt_2"), "foreman-run-3-attempt-2");
    }
}
