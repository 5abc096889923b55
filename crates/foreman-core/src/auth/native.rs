//! Native CLI logins.
//!
//! Some agents authenticate through their own interactive login and keep
//! credentials in files under `$HOME`. The harness runs those logins with
//! `HOME` pointed at a dedicated auth home so the resulting files can be
//! checked and, for docker runs, bind-mounted read-only.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use foreman_db::models::{Provider, RuntimeKind};

use crate::error::{HarnessError, HarnessResult};
use crate::runtime::Mount;

/// Bytes of login output kept per session.
pub const OUTPUT_TAIL_BYTES: usize = 20 * 1024;

/// Upper bound on a status command.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(15);

/// Finished login sessions stay queryable this long.
pub const SESSION_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Where one provider's CLI keeps its login, and how to drive it.
#[derive(Debug, Clone)]
pub struct NativeProviderSpec {
    pub provider: Provider,
    /// Relative to the auth home.
    pub credential_dir: PathBuf,
    /// Relative to `credential_dir`; all must exist.
    pub required_files: Vec<String>,
    pub status_command: Option<Vec<String>>,
    pub success_pattern: Option<Regex>,
    pub login_command: Vec<String>,
    /// Credentials are bound to the host keychain or browser and cannot be
    /// mounted into a container.
    pub host_only: bool,
    pub container_target: String,
}

impl NativeProviderSpec {
    pub fn builtin(provider: Provider) -> Self {
        fn argv(parts: &[&str]) -> Vec<String> {
            parts.iter().map(|s| s.to_string()).collect()
        }
        match provider {
            Provider::Claude => Self {
                provider,
                credential_dir: PathBuf::from(".claude"),
                required_files: vec![".credentials.json".into()],
                status_command: None,
                success_pattern: None,
                login_command: argv(&["claude", "setup-token"]),
                host_only: true,
                container_target: "/root/.claude".into(),
            },
            Provider::Codex => Self {
                provider,
                credential_dir: PathBuf::from(".codex"),
                required_files: vec!["auth.json".into()],
                status_command: Some(argv(&["codex", "login", "status"])),
                success_pattern: Regex::new(r"(?i)logged in").ok(),
                login_command: argv(&["codex", "login"]),
                host_only: false,
                container_target: "/root/.codex".into(),
            },
            Provider::Gemini => Self {
                provider,
                credential_dir: PathBuf::from(".gemini"),
                required_files: vec!["oauth_creds.json".into()],
                status_command: None,
                success_pattern: None,
                login_command: argv(&["gemini"]),
                host_only: false,
                container_target: "/root/.gemini".into(),
            },
            Provider::Opencode => Self {
                provider,
                credential_dir: PathBuf::from(".local/share/opencode"),
                required_files: vec!["auth.json".into()],
                status_command: Some(argv(&["opencode", "auth", "list"])),
                success_pattern: Regex::new(r"(?i)credentials?|api|oauth").ok(),
                login_command: argv(&["opencode", "auth", "login"]),
                host_only: false,
                container_target: "/root/.local/share/opencode".into(),
            },
        }
    }
}

/// Result of a native credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeState {
    Authenticated,
    Missing,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct NativeCheck {
    pub provider: Provider,
    pub state: NativeState,
    pub credential_dir: PathBuf,
    pub missing_files: Vec<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginStatus {
    Running,
    Exited,
    Stopped,
    Failed,
}

/// Point-in-time view of a login session.
#[derive(Debug, Clone, Serialize)]
pub struct NativeSessionView {
    pub id: Uuid,
    pub provider: Provider,
    pub command: Vec<String>,
    pub status: LoginStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: String,
}

struct LoginState {
    status: LoginStatus,
    exit_code: Option<i32>,
    ended_at: Option<DateTime<Utc>>,
    pid: Option<u32>,
    output: OutputTail,
}

struct LoginSession {
    id: Uuid,
    provider: Provider,
    command: Vec<String>,
    started_at: DateTime<Utc>,
    state: Mutex<LoginState>,
}

impl LoginSession {
    fn view(&self) -> NativeSessionView {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        NativeSessionView {
            id: self.id,
            provider: self.provider,
            command: self.command.clone(),
            status: state.status,
            exit_code: state.exit_code,
            started_at: self.started_at,
            ended_at: state.ended_at,
            output: state.output.as_str().to_string(),
        }
    }

    fn push_line(&self, line: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.output.push_line(line);
    }
}

/// Rolling buffer that keeps only the newest `cap` bytes.
#[derive(Debug, Default)]
struct OutputTail {
    buf: String,
    cap: usize,
}

impl OutputTail {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        if self.buf.len() > self.cap {
            let mut cut = self.buf.len() - self.cap;
            while !self.buf.is_char_boundary(cut) {
                cut += 1;
            }
            self.buf.drain(..cut);
        }
    }

    fn as_str(&self) -> &str {
        &self.buf
    }
}

/// Tracks native login state for every provider.
pub struct NativeAuthManager {
    auth_home: PathBuf,
    specs: HashMap<Provider, NativeProviderSpec>,
    sessions: Mutex<HashMap<Uuid, Arc<LoginSession>>>,
}

impl std::fmt::Debug for NativeAuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeAuthManager")
            .field("auth_home", &self.auth_home)
            .field("providers", &self.specs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NativeAuthManager {
    pub fn new(auth_home: impl Into<PathBuf>) -> Self {
        let specs = Provider::ALL
            .iter()
            .map(|p| (*p, NativeProviderSpec::builtin(*p)))
            .collect();
        Self::with_specs(auth_home, specs)
    }

    pub fn with_specs(
        auth_home: impl Into<PathBuf>,
        specs: HashMap<Provider, NativeProviderSpec>,
    ) -> Self {
        Self {
            auth_home: auth_home.into(),
            specs,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn auth_home(&self) -> &Path {
        &self.auth_home
    }

    fn spec(&self, provider: Provider) -> HarnessResult<&NativeProviderSpec> {
        self.specs
            .get(&provider)
            .ok_or_else(|| HarnessError::not_found(format!("no native login for {provider}")))
    }

    fn credential_dir(&self, spec: &NativeProviderSpec) -> PathBuf {
        self.auth_home.join(&spec.credential_dir)
    }

    fn missing_files(&self, spec: &NativeProviderSpec) -> Vec<String> {
        let dir = self.credential_dir(spec);
        spec.required_files
            .iter()
            .filter(|f| !dir.join(f).is_file())
            .cloned()
            .collect()
    }

    /// Credential files only; never runs anything.
    pub fn native_state(&self, provider: Provider) -> NativeState {
        match self.specs.get(&provider) {
            Some(spec) if self.missing_files(spec).is_empty() => NativeState::Authenticated,
            Some(_) => NativeState::Missing,
            None => NativeState::Unknown,
        }
    }

    /// Credential files plus the provider's status command, if it has one.
    pub async fn check(&self, provider: Provider) -> HarnessResult<NativeCheck> {
        let spec = self.spec(provider)?;
        let credential_dir = self.credential_dir(spec);
        let missing_files = self.missing_files(spec);
        if !missing_files.is_empty() {
            return Ok(NativeCheck {
                provider,
                state: NativeState::Missing,
                credential_dir,
                missing_files,
                detail: None,
            });
        }

        let Some(argv) = spec.status_command.as_ref().filter(|a| !a.is_empty()) else {
            return Ok(NativeCheck {
                provider,
                state: NativeState::Authenticated,
                credential_dir,
                missing_files,
                detail: None,
            });
        };

        let (state, detail) = match self.run_status(argv).await {
            Ok((success, output)) => {
                let matched = match &spec.success_pattern {
                    Some(re) => re.is_match(&output),
                    None => success,
                };
                let state = if success && matched {
                    NativeState::Authenticated
                } else {
                    NativeState::Missing
                };
                (state, Some(first_line(&output)))
            }
            Err(detail) => (NativeState::Unknown, Some(detail)),
        };

        Ok(NativeCheck {
            provider,
            state,
            credential_dir,
            missing_files,
            detail,
        })
    }

    async fn run_status(&self, argv: &[String]) -> Result<(bool, String), String> {
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env("HOME", &self.auth_home)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(STATUS_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok((output.status.success(), text))
            }
            Ok(Err(e)) => Err(format!("failed to run {}: {e}", argv[0])),
            Err(_) => Err(format!(
                "{} timed out after {}s",
                argv[0],
                STATUS_TIMEOUT.as_secs()
            )),
        }
    }

    /// Launch the provider's login command in the background.
    pub async fn start(&self, provider: Provider) -> HarnessResult<NativeSessionView> {
        let spec = self.spec(provider)?;
        let argv = spec.login_command.clone();
        if argv.is_empty() {
            return Err(HarnessError::validation(format!(
                "{provider} has no login command"
            )));
        }
        std::fs::create_dir_all(&self.auth_home).map_err(|e| {
            HarnessError::Internal(anyhow::anyhow!(
                "failed to create auth home {}: {e}",
                self.auth_home.display()
            ))
        })?;

        let pruned = self.prune_sessions(Utc::now());
        if pruned > 0 {
            debug!(pruned, "dropped finished native login sessions");
        }

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .env("HOME", &self.auth_home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                HarnessError::auth(
                    format!("failed to start `{}`: {e}", argv.join(" ")),
                    Some(format!("install the {provider} CLI on the harness host")),
                )
            })?;

        let session = Arc::new(LoginSession {
            id: Uuid::new_v4(),
            provider,
            command: argv,
            started_at: Utc::now(),
            state: Mutex::new(LoginState {
                status: LoginStatus::Running,
                exit_code: None,
                ended_at: None,
                pid: child.id(),
                output: OutputTail::new(OUTPUT_TAIL_BYTES),
            }),
        });
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id, Arc::clone(&session));
        info!(session_id = %session.id, %provider, "started native login");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let tracked = Arc::clone(&session);
        tokio::spawn(async move {
            let out_reader = {
                let s = Arc::clone(&tracked);
                async move {
                    if let Some(out) = stdout {
                        let mut lines = BufReader::new(out).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            s.push_line(&line);
                        }
                    }
                }
            };
            let err_reader = {
                let s = Arc::clone(&tracked);
                async move {
                    if let Some(err) = stderr {
                        let mut lines = BufReader::new(err).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            s.push_line(&line);
                        }
                    }
                }
            };
            tokio::join!(out_reader, err_reader);
            let result = child.wait().await;

            let mut state = tracked.state.lock().unwrap_or_else(|e| e.into_inner());
            state.pid = None;
            state.ended_at = Some(Utc::now());
            match result {
                Ok(status) => {
                    state.exit_code = status.code();
                    if state.status == LoginStatus::Running {
                        state.status = LoginStatus::Exited;
                    }
                }
                Err(e) => {
                    warn!(session_id = %tracked.id, error = %e, "failed to wait for login");
                    state.status = LoginStatus::Failed;
                }
            }
            debug!(session_id = %tracked.id, status = ?state.status, "native login finished");
        });

        Ok(session.view())
    }

    /// Forget sessions that ended more than [`SESSION_RETENTION`] before
    /// `now`. Running sessions are always kept.
    pub fn prune_sessions(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::seconds(SESSION_RETENTION.as_secs() as i64);
        let cutoff = now - retention;
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let before = sessions.len();
        sessions.retain(|_, session| {
            let state = session.state.lock().unwrap_or_else(|e| e.into_inner());
            state.ended_at.is_none_or(|ended| ended > cutoff)
        });
        before - sessions.len()
    }

    pub fn session(&self, id: Uuid) -> Option<NativeSessionView> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|s| s.view())
    }

    /// SIGTERM a running login.
    pub fn stop(&self, id: Uuid) -> HarnessResult<NativeSessionView> {
        let session = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| HarnessError::not_found(format!("native session {id} not found")))?;

        {
            let mut state = session.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.status == LoginStatus::Running {
                #[cfg(unix)]
                if let Some(pid) = state.pid {
                    // SAFETY: pid is a child we spawned; the waiter clears it
                    // once reaped.
                    let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                    if ret != 0 {
                        warn!(pid, "SIGTERM to native login failed");
                    }
                }
                state.status = LoginStatus::Stopped;
            }
        }
        info!(session_id = %id, "stopped native login");
        Ok(session.view())
    }

    /// Mounts that expose `provider`'s native login to `runtime`.
    ///
    /// Host runs read the auth home directly and get no mounts.
    pub fn resolve_runtime(
        &self,
        provider: Provider,
        runtime: RuntimeKind,
    ) -> HarnessResult<Vec<Mount>> {
        let spec = self.spec(provider)?;
        if runtime == RuntimeKind::Docker && spec.host_only {
            return Err(HarnessError::auth(
                format!("{provider} native login cannot be used inside docker"),
                Some("use the host runtime or an API key for this profile".to_string()),
            ));
        }
        let missing = self.missing_files(spec);
        if !missing.is_empty() {
            return Err(HarnessError::auth(
                format!(
                    "{provider} native credentials missing: {}",
                    missing.join(", ")
                ),
                Some(format!(
                    "run `{}` with HOME={}, or POST /auth/providers/{provider}/native/start",
                    spec.login_command.join(" "),
                    self.auth_home.display()
                )),
            ));
        }
        Ok(match runtime {
            RuntimeKind::Host => Vec::new(),
            RuntimeKind::Docker => vec![Mount::read_only(
                self.credential_dir(spec),
                spec.container_target.clone(),
            )],
        })
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .chars()
        .take(200)
        .collect()
}
