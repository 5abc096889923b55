//! Adapter for the `codex` CLI.

use foreman_db::models::{AuthMode, Provider, RuntimeKind, Stage};

use super::{AgentAdapter, AgentManifest, CommandCandidate, model_args, strings};

const MARKERS: &[&str] = &[
    "sign in with chatgpt",
    "approve this command",
    "press enter to confirm",
];

/// Runs `codex exec`, falling back to the older quiet-mode invocation.
#[derive(Debug, Clone)]
pub struct CodexAdapter {
    binary: String,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self::with_binary("codex")
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentAdapter for CodexAdapter {
    fn name(&self) -> &str {
        "codex"
    }

    fn provider(&self) -> Provider {
        Provider::Codex
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn manifest(&self) -> AgentManifest {
        AgentManifest {
            auth_modes: vec![AuthMode::ApiKey, AuthMode::Oauth, AuthMode::Native],
            headless: true,
            oauth_requires_browser_callback: true,
            token_mount_supported: true,
            runtime_support: vec![RuntimeKind::Host, RuntimeKind::Docker],
        }
    }

    fn credential_env(&self, mode: AuthMode) -> Option<&'static str> {
        match mode {
            AuthMode::ApiKey | AuthMode::Oauth => Some("OPENAI_API_KEY"),
            _ => None,
        }
    }

    fn needs_input_markers(&self) -> &'static [&'static str] {
        MARKERS
    }

    fn build_stage_command(
        &self,
        stage: Stage,
        model: &str,
        prompt: &str,
    ) -> Vec<CommandCandidate> {
        let sandbox = match stage {
            Stage::Plan => "read-only",
            Stage::Execute | Stage::Test => "workspace-write",
        };
        let model = model_args("--model", model);
        vec![
            CommandCandidate::new(
                &self.binary,
                [
                    strings(&["exec"]),
                    model.clone(),
                    strings(&["--sandbox", sandbox, "-"]),
                ]
                .concat(),
            )
            .with_stdin(prompt),
            CommandCandidate::new(
                &self.binary,
                [strings(&["exec"]), model.clone(), strings(&[prompt])].concat(),
            ),
            CommandCandidate::new(
                &self.binary,
                [
                    strings(&["--approval-mode", "full-auto", "-q"]),
                    model,
                    strings(&[prompt]),
                ]
                .concat(),
            ),
        ]
    }
}
