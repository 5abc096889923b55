//! Adapter for the `opencode` CLI.

use foreman_db::models::{AuthMode, Provider, RuntimeKind, Stage};

use super::{AgentAdapter, AgentManifest, CommandCandidate, model_args, strings};

const MARKERS: &[&str] = &["opencode auth login", "select a provider"];

#[derive(Debug, Clone)]
pub struct OpencodeAdapter {
    binary: String,
}

impl OpencodeAdapter {
    pub fn new() -> Self {
        Self::with_binary("opencode")
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }
}

impl Default for OpencodeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentAdapter for OpencodeAdapter {
    fn name(&self) -> &str {
        "opencode"
    }

    fn provider(&self) -> Provider {
        Provider::Opencode
    }

    fn binary(&self) -> &str {
        &self.binary
    }

    fn manifest(&self) -> AgentManifest {
        AgentManifest {
            auth_modes: vec![AuthMode::ApiKey, AuthMode::Native],
            headless: true,
            oauth_requires_browser_callback: false,
            token_mount_supported: true,
            runtime_support: vec![RuntimeKind::Host, RuntimeKind::Docker],
        }
    }

    fn credential_env(&self, mode: AuthMode) -> Option<&'static str> {
        match mode {
            AuthMode::ApiKey => Some("OPENCODE_API_KEY"),
            _ => None,
        }
    }

    fn needs_input_markers(&self) -> &'static [&'static str] {
        MARKERS
    }

    fn build_stage_command(
        &self,
        _stage: Stage,
        model: &str,
        prompt: &str,
    ) -> Vec<CommandCandidate> {
        vec![
            CommandCandidate::new(
                &self.binary,
                [strings(&["run"]), model_args("--model", model), strings(&[prompt])].concat(),
            ),
            CommandCandidate::new(&self.binary, strings(&["run", prompt])),
            CommandCandidate::new(&self.binary, strings(&["-p", prompt, "-q"])),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_pass_prompt_as_argument() {
        let candidates = OpencodeAdapter::new().build_stage_command(Stage::Plan, "m", "fix it");
        assert_eq!(candidates.len(), 3);
        assert!(candidates.iter().all(|c| c.args.contains(&"fix it".to_string())));
        assert!(candidates.iter().all(|c| c.stdin.is_none()));
    }

    #[test]
    fn empty_model_skips_the_flag() {
        let candidates = OpencodeAdapter::new().build_stage_command(Stage::Plan, "", "fix it");
        assert_eq!(candidates[0].args, strings(&["run", "fix it"]));
    }
}
