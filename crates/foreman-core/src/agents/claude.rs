//! Adapter for the `claude` CLI.

use foreman_db::models::{AuthMode, Provider, RuntimeKind, Stage};

use super::{AgentAdapter, AgentManifest, CommandCandidate, model_args, strings};

const MARKERS: &[&str] = &[
    "please run /login",
    "do you trust the files in this folder",
    "press enter to continue",
];

/// Runs `claude -p` with the prompt on stdin.
#[derive(Debug, Clone)]
pub struct ClaudeAdapter {
    binary: String,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    /// Use a binary at a non-standard location.
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary: path.into(),
        }
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentAdapter for ClaudeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn provider(&self) -> Provider {
        Provider::Claude
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
            AuthMode::ApiKey => Some("ANTHROPIC_API_KEY"),
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
        let permission_mode = match stage {
            Stage::Plan => "plan",
            Stage::Execute | Stage::Test => "acceptEdits",
        };
        let model = model_args("--model", model);
        let full = [
            strings(&["-p"]),
            model.clone(),
            strings(&["--permission-mode", permission_mode, "--output-format", "text"]),
        ]
        .concat();
        vec![
            CommandCandidate::new(&self.binary, full).with_stdin(prompt),
            // Releases without --permission-mode.
            CommandCandidate::new(&self.binary, [strings(&["-p"]), model].concat())
                .with_stdin(prompt),
            CommandCandidate::new(&self.binary, strings(&["--print", prompt])),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_stage_uses_plan_permission_mode() {
        let candidates = ClaudeAdapter::new().build_stage_command(Stage::Plan, "sonnet", "do it");
        assert_eq!(candidates.len(), 3);
        assert!(candidates[0].args.contains(&"plan".to_string()));
        assert_eq!(candidates[0].stdin.as_deref(), Some("do it"));
        assert!(!candidates[0].args.contains(&"do it".to_string()));
    }

    #[test]
    fn execute_stage_accepts_edits() {
        let candidates =
            ClaudeAdapter::with_binary("/opt/claude").build_stage_command(Stage::Execute, "opus", "x");
        assert_eq!(candidates[0].program, "/opt/claude");
        assert!(candidates[0].args.contains(&"acceptEdits".to_string()));
    }

    #[test]
    fn empty_model_leaves_out_the_model_flag() {
        let candidates = ClaudeAdapter::new().build_stage_command(Stage::Plan, "", "x");
        for candidate in &candidates {
            assert!(!candidate.args.contains(&"--model".to_string()), "{:?}", candidate.args);
            assert!(!candidate.args.iter().any(String::is_empty));
        }
        assert_eq!(candidates[1].args, vec!["-p".to_string()]);
    }

    #[test]
    fn only_api_key_maps_to_an_env_var() {
        let adapter = ClaudeAdapter::new();
        assert_eq!(adapter.credential_env(AuthMode::ApiKey), Some("ANTHROPIC_API_KEY"));
        assert_eq!(adapter.credential_env(AuthMode::Native), None);
        assert!(!adapter.manifest().supports_auth_mode(AuthMode::Oauth));
    }
}
