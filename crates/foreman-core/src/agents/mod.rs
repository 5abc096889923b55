//! Agent adapter interface for external coding-agent CLIs.
//!
//! Each adapter describes one CLI: its capability manifest, where its
//! credentials go, and the ordered command shapes to try for a stage.
//! Adapters never spawn anything themselves; the executor does.
//!
//! ```text
//! Dispatcher
//!     |
//!     v
//! AgentRegistry --get("codex")--> Arc<dyn AgentAdapter>
//!     |                                 |
//!     |   build_stage_command(stage, model, prompt)
//!     |        |
//!     |        v
//!     |   [CommandCandidate, CommandCandidate, ...]  (tried in order)
//!     v
//! StageExecutor
//! ```

pub mod claude;
pub mod codex;
pub mod gemini;
pub mod opencode;
pub mod probe;
pub mod registry;

use serde::Serialize;

use foreman_db::models::{AuthMode, Provider, RuntimeKind, Stage};

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use gemini::GeminiAdapter;
pub use opencode::OpencodeAdapter;
pub use probe::{ProbeResult, probe, probe_all};
pub use registry::AgentRegistry;

/// Static capabilities of an agent CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentManifest {
    pub auth_modes: Vec<AuthMode>,
    /// Can run a stage without a terminal attached.
    pub headless: bool,
    /// OAuth login needs a browser redirect back to the harness.
    pub oauth_requires_browser_callback: bool,
    /// Credential files can be bind-mounted into a container.
    pub token_mount_supported: bool,
    pub runtime_support: Vec<RuntimeKind>,
}

impl AgentManifest {
    pub fn supports_runtime(&self, runtime: RuntimeKind) -> bool {
        self.runtime_support.contains(&runtime)
    }

    pub fn supports_auth_mode(&self, mode: AuthMode) -> bool {
        mode == AuthMode::None || self.auth_modes.contains(&mode)
    }
}

/// One concrete invocation shape for a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandCandidate {
    pub program: String,
    pub args: Vec<String>,
    /// Written to the process's stdin, then stdin is closed.
    #[serde(skip_serializing)]
    pub stdin: Option<String>,
}

impl CommandCandidate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program and flags for logs, with any argument equal to `prompt`
    /// elided.
    pub fn describe(&self, prompt: &str) -> String {
        let mut parts = vec![self.program.clone()];
        for arg in &self.args {
            if !prompt.is_empty() && arg == prompt {
                parts.push("<prompt>".to_string());
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

/// Adapter interface for one external agent CLI.
///
/// # Object Safety
///
/// Every method returns a concrete type, so adapters are stored as
/// `Arc<dyn AgentAdapter>` in the [`AgentRegistry`].
pub trait AgentAdapter: Send + Sync {
    /// Registry key (e.g. "claude").
    fn name(&self) -> &str;

    /// Provider whose credentials this CLI consumes.
    fn provider(&self) -> Provider;

    /// Binary looked up on `PATH` (host) or inside the image (docker).
    fn binary(&self) -> &str;

    fn manifest(&self) -> AgentManifest;

    /// Arguments that print the CLI's version.
    fn version_args(&self) -> Vec<String> {
        vec!["--version".to_string()]
    }

    /// Environment variable that receives the credential for `mode`, if
    /// the CLI reads one.
    fn credential_env(&self, mode: AuthMode) -> Option<&'static str>;

    /// Lower-case output fragments meaning the CLI stopped to ask a human
    /// something.
    fn needs_input_markers(&self) -> &'static [&'static str];

    /// Ordered invocation shapes for `stage`. The executor uses the first
    /// one the installed CLI accepts. An empty `model` means the CLI's own
    /// default.
    fn build_stage_command(&self, stage: Stage, model: &str, prompt: &str)
    -> Vec<CommandCandidate>;
}

// Compile-time assertion: AgentAdapter must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn AgentAdapter) {}
};

/// `true` if any marker occurs in `line`, ignoring case.
pub fn matches_needs_input(markers: &[&str], line: &str) -> bool {
    let lowered = line.to_lowercase();
    markers.iter().any(|marker| lowered.contains(marker))
}

pub(crate) fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// `[flag, model]`, or nothing when the profile leaves the model to the
/// agent's default.
pub(crate) fn model_args(flag: &str, model: &str) -> Vec<String> {
    let model = model.trim();
    if model.is_empty() {
        Vec::new()
    } else {
        strings(&[flag, model])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAdapter;

    impl AgentAdapter for NoopAdapter {
        fn name(&self) -> &str {
            "noop"
        }

        fn provider(&self) -> Provider {
            Provider::Claude
        }

        fn binary(&self) -> &str {
            "true"
        }

        fn manifest(&self) -> AgentManifest {
            AgentManifest {
                auth_modes: vec![],
                headless: true,
                oauth_requires_browser_callback: false,
                token_mount_supported: false,
                runtime_support: vec![RuntimeKind::Host],
            }
        }

        fn credential_env(&self, _mode: AuthMode) -> Option<&'static str> {
            None
        }

        fn needs_input_markers(&self) -> &'static [&'static str] {
            &[]
        }

        fn build_stage_command(
            &self,
            _stage: Stage,
            _model: &str,
            _prompt: &str,
        ) -> Vec<CommandCandidate> {
            vec![CommandCandidate::new("true", vec![])]
        }
    }

    #[test]
    fn adapter_is_object_safe() {
        let adapter: Box<dyn AgentAdapter> = Box::new(NoopAdapter);
        assert_eq!(adapter.name(), "noop");
        assert_eq!(adapter.version_args(), vec!["--version".to_string()]);
    }

    #[test]
    fn auth_mode_none_is_always_supported() {
        let manifest = NoopAdapter.manifest();
        assert!(manifest.supports_auth_mode(AuthMode::None));
        assert!(!manifest.supports_auth_mode(AuthMode::Oauth));
        assert!(manifest.supports_runtime(RuntimeKind::Host));
        assert!(!manifest.supports_runtime(RuntimeKind::Docker));
    }

    #[test]
    fn describe_hides_the_prompt() {
        let candidate = CommandCandidate::new("gemini", strings(&["--prompt", "secret plan"]));
        assert_eq!(candidate.describe("secret plan"), "gemini --prompt <prompt>");
    }

    #[test]
    fn markers_match_case_insensitively() {
        assert!(matches_needs_input(&["please log in"], "ERROR: Please Log In first"));
        assert!(!matches_needs_input(&["please log in"], "all good"));
    }
}
