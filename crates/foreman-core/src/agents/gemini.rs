//! Adapter for the `gemini` CLI.

use foreman_db::models::{AuthMode, Provider, RuntimeKind, Stage};

use super::{AgentAdapter, AgentManifest, CommandCandidate, model_args, strings};

const MARKERS: &[&str] = &[
    "waiting for authentication",
    "login with google",
    "do you want to proceed",
];

#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    binary: String,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self::with_binary("gemini")
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentAdapter for GeminiAdapter {
    fn name(&self) -> &str {
        "gemini"
    }

    fn provider(&self) -> Provider {
        Provider::Gemini
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
            AuthMode::ApiKey => Some("GEMINI_API_KEY"),
            AuthMode::Oauth => Some("GOOGLE_CLOUD_ACCESS_TOKEN"),
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
        let mut first = [model_args("--model", model), strings(&["--prompt", prompt])].concat();
        if stage != Stage::Plan {
            first.push("--yolo".to_string());
        }
        vec![
            CommandCandidate::new(&self.binary, first),
            CommandCandidate::new(
                &self.binary,
                [model_args("-m", model), strings(&["-p", prompt])].concat(),
            ),
            CommandCandidate::new(&self.binary, model_args("--model", model)).with_stdin(prompt),
        ]
    }
}
