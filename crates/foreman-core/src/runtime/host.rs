//! Host runtime: spawn the CLI directly in the project directory.

use async_trait::async_trait;
use tokio::process::Command;

use foreman_db::models::RuntimeKind;

use super::{ProcessSpec, RuntimeBackend};

/// Runs commands as direct children of the harness.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostRuntime;

#[async_trait]
impl RuntimeBackend for HostRuntime {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Host
    }

    fn command(&self, spec: &ProcessSpec, _label: &str) -> Command {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).current_dir(&spec.workdir);
        // Merge, don't replace the entire env.
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd
    }

    async fn cleanup(&self, _label: &str) {}
}
