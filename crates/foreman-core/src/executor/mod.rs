//! Stage execution: one run row per attempt, candidates tried in order.
//!
//! Each attempt records a `running` run, resolves credentials, redeems the
//! runtime grant right before spawning, and streams redacted output to
//! `<logs>/run-<id>.log`. The prompt and a result summary land in
//! `<artifacts>/run-<id>/`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use foreman_db::models::{ExecutionProfile, McpProfile, RunStatus, Stage, WorkItem};
use foreman_db::queries::events::insert_event;
use foreman_db::queries::runs::{finish_run, insert_run};

use crate::agents::{AgentAdapter, matches_needs_input};
use crate::auth::AuthResolver;
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::runtime::{self, OutputStream, ProcessSpec};

/// Replacement for secrets in run logs.
pub const REDACTED: &str = "[REDACTED]";

/// Stderr fragments that mean the CLI rejected our arguments, so the next
/// candidate is worth trying.
const USAGE_ERROR_MARKERS: &[&str] = &[
    "unknown flag",
    "unknown option",
    "unexpected argument",
    "unrecognized option",
    "unrecognized arguments",
    "no such option",
];

/// One stage for one work item.
#[derive(Clone, Copy)]
pub struct StageRequest<'a> {
    pub item: &'a WorkItem,
    pub stage: Stage,
    pub profile: &'a ExecutionProfile,
    pub adapter: &'a dyn AgentAdapter,
    pub prompt: &'a str,
    pub mcp: Option<&'a McpProfile>,
}

/// Final result across all attempts.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    pub status: RunStatus,
    pub last_run_id: Option<i64>,
    pub attempts: u32,
    pub timed_out: bool,
    pub exit_code: Option<i64>,
    pub error_text: Option<String>,
}

struct AttemptResult {
    status: RunStatus,
    exit_code: Option<i64>,
    timed_out: bool,
    error_text: Option<String>,
}

#[derive(Serialize)]
struct ResultFile<'a> {
    status: RunStatus,
    candidate_index: Option<usize>,
    program: Option<&'a str>,
    exit_code: Option<i64>,
    timed_out: bool,
    duration_ms: Option<u128>,
    error_text: Option<&'a str>,
}

/// Runs stages through adapters and runtimes.
#[derive(Debug, Clone)]
pub struct StageExecutor {
    pool: SqlitePool,
    config: Arc<HarnessConfig>,
    auth: AuthResolver,
}

impl StageExecutor {
    pub fn new(pool: SqlitePool, config: Arc<HarnessConfig>, auth: AuthResolver) -> Self {
        Self { pool, config, auth }
    }

    pub fn auth(&self) -> &AuthResolver {
        &self.auth
    }

    /// Run `req`, retrying failed attempts up to the profile's
    /// `retry_count`. `needs_input` and `passed` end the loop.
    pub async fn run_stage(&self, req: StageRequest<'_>) -> Result<StageOutcome> {
        let max_attempts = 1 + req.profile.retry_count.max(0) as u32;
        let mut outcome = StageOutcome {
            status: RunStatus::Failed,
            last_run_id: None,
            attempts: 0,
            timed_out: false,
            exit_code: None,
            error_text: None,
        };

        for attempt in 1..=max_attempts {
            let run = insert_run(
                &self.pool,
                req.item.id,
                req.stage,
                Some(req.profile.id),
                i64::from(attempt),
                |id| {
                    (
                        self.log_path(id).display().to_string(),
                        self.artifact_dir(id).display().to_string(),
                    )
                },
            )
            .await?;
            info!(
                work_item_id = req.item.id,
                run_id = run.id,
                stage = %req.stage,
                attempt,
                agent = req.adapter.name(),
                "run started"
            );

            let result = match self.attempt(run.id, &req).await {
                Ok(result) => result,
                Err(e) => {
                    let text = format!("{e:#}");
                    finish_run(&self.pool, run.id, RunStatus::Failed, None, Some(&text)).await?;
                    return Err(e);
                }
            };

            finish_run(
                &self.pool,
                run.id,
                result.status,
                result.exit_code,
                result.error_text.as_deref(),
            )
            .await?;
            insert_event(
                &self.pool,
                "run_finished",
                "run",
                Some(run.id.to_string()),
                json!({
                    "work_item_id": req.item.id,
                    "stage": req.stage,
                    "attempt": attempt,
                    "status": result.status,
                    "exit_code": result.exit_code,
                    "timed_out": result.timed_out,
                }),
            )
            .await?;
            info!(
                work_item_id = req.item.id,
                run_id = run.id,
                status = %result.status,
                exit_code = ?result.exit_code,
                "run finished"
            );

            outcome = StageOutcome {
                status: result.status,
                last_run_id: Some(run.id),
                attempts: attempt,
                timed_out: result.timed_out,
                exit_code: result.exit_code,
                error_text: result.error_text,
            };
            if outcome.status != RunStatus::Failed {
                break;
            }
            if attempt < max_attempts {
                debug!(run_id = run.id, attempt, "retrying failed run");
            }
        }

        Ok(outcome)
    }

    pub fn log_path(&self, run_id: i64) -> PathBuf {
        self.config.logs_dir.join(format!("run-{run_id}.log"))
    }

    pub fn artifact_dir(&self, run_id: i64) -> PathBuf {
        self.config.artifacts_dir.join(format!("run-{run_id}"))
    }

    fn workdir(&self, item: &WorkItem) -> PathBuf {
        if item.project_path.trim().is_empty() {
            self.config.project_path.clone()
        } else {
            PathBuf::from(&item.project_path)
        }
    }

    async fn attempt(&self, run_id: i64, req: &StageRequest<'_>) -> Result<AttemptResult> {
        tokio::fs::create_dir_all(&self.config.logs_dir)
            .await
            .with_context(|| format!("failed to create {}", self.config.logs_dir.display()))?;
        let log = RunLog::open(&self.log_path(run_id)).await?;
        let result = self.run_attempt(run_id, req, &log).await;
        log.close().await;
        result
    }

    async fn run_attempt(
        &self,
        run_id: i64,
        req: &StageRequest<'_>,
        log: &RunLog,
    ) -> Result<AttemptResult> {
        let artifact_dir = self.artifact_dir(run_id);
        tokio::fs::create_dir_all(&artifact_dir)
            .await
            .with_context(|| format!("failed to create {}", artifact_dir.display()))?;
        tokio::fs::write(artifact_dir.join("prompt.md"), req.prompt)
            .await
            .context("failed to write prompt artifact")?;

        let mut env = Vec::new();
        if let Some(mcp) = req.mcp {
            let path = artifact_dir.join("mcp.json");
            let body = serde_json::to_vec_pretty(&mcp.config.0)
                .context("failed to serialize mcp profile")?;
            tokio::fs::write(&path, body)
                .await
                .context("failed to write mcp profile artifact")?;
            env.push(("FOREMAN_MCP_CONFIG".to_string(), path.display().to_string()));
        }

        let adapter = req.adapter;
        let runtime_kind = req.profile.runtime;

        let resolved = match self
            .auth
            .resolve(adapter, req.profile.auth_mode, runtime_kind, run_id)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => return auth_failure(log, e),
        };
        env.extend(resolved.env.iter().cloned());

        let mut secrets = Vec::new();
        if let Some(binding) = &resolved.grant {
            secrets.push(binding.token.clone());
            match self.auth.redeem(binding).await {
                Ok((name, secret)) => {
                    secrets.push(secret.clone());
                    env.push((name, secret));
                }
                Err(e) => return auth_failure(log, e),
            }
        }

        let candidates = adapter.build_stage_command(req.stage, &req.profile.model, req.prompt);
        let backend = runtime::backend_for(runtime_kind, &self.config.docker_image);
        let timeout = Duration::from_secs(req.profile.timeout_secs.max(1) as u64);
        let workdir = self.workdir(req.item);
        let markers = adapter.needs_input_markers();
        let mut last_error = String::from("adapter produced no command candidates");

        for (index, candidate) in candidates.iter().enumerate() {
            let is_last = index + 1 == candidates.len();
            log.line(&format!("$ {}", candidate.describe(req.prompt)));

            let spec = ProcessSpec {
                program: candidate.program.clone(),
                args: candidate.args.clone(),
                stdin: candidate.stdin.clone(),
                env: env.clone(),
                mounts: resolved.mounts.clone(),
                workdir: workdir.clone(),
                timeout,
            };
            let label = format!("run-{run_id}-{index}");

            let mut saw_marker = false;
            let mut usage_error = false;
            let result = runtime::execute(backend.as_ref(), &spec, &label, |stream, line| {
                let line = redact(line, &secrets);
                let tag = match stream {
                    OutputStream::Stdout => "out",
                    OutputStream::Stderr => "err",
                };
                log.line(&format!("[{tag}] {line}"));
                if matches_needs_input(markers, &line) {
                    saw_marker = true;
                }
                if stream == OutputStream::Stderr && is_usage_error(&line) {
                    usage_error = true;
                }
            })
            .await;

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(run_id, candidate = index, error = %e, "candidate failed to spawn");
                    log.line(&format!("[harness] {e}"));
                    last_error = e.to_string();
                    continue;
                }
            };

            if usage_error && !outcome.success() && !outcome.timed_out && !is_last {
                log.line("[harness] usage error, trying next candidate");
                last_error = format!("{} rejected its arguments", candidate.program);
                continue;
            }

            let exit_code = outcome.exit_code.map(i64::from);
            let (status, error_text) = if outcome.success() {
                (RunStatus::Passed, None)
            } else if outcome.timed_out {
                (
                    RunStatus::Failed,
                    Some(format!("timed out after {}s", timeout.as_secs())),
                )
            } else if saw_marker {
                (
                    RunStatus::NeedsInput,
                    Some("agent is waiting for interactive input".to_string()),
                )
            } else {
                let text = match exit_code {
                    Some(code) => format!("exited with code {code}"),
                    None => "terminated by signal".to_string(),
                };
                (RunStatus::Failed, Some(text))
            };

            write_result(
                &artifact_dir,
                &ResultFile {
                    status,
                    candidate_index: Some(index),
                    program: Some(&candidate.program),
                    exit_code,
                    timed_out: outcome.timed_out,
                    duration_ms: Some(outcome.duration.as_millis()),
                    error_text: error_text.as_deref(),
                },
            )
            .await?;

            return Ok(AttemptResult {
                status,
                exit_code,
                timed_out: outcome.timed_out,
                error_text,
            });
        }

        let error_text = format!("no usable command candidate: {last_error}");
        log.line(&format!("[harness] {error_text}"));
        write_result(
            &artifact_dir,
            &ResultFile {
                status: RunStatus::Failed,
                candidate_index: None,
                program: None,
                exit_code: None,
                timed_out: false,
                duration_ms: None,
                error_text: Some(&error_text),
            },
        )
        .await?;
        Ok(AttemptResult {
            status: RunStatus::Failed,
            exit_code: None,
            timed_out: false,
            error_text: Some(error_text),
        })
    }
}

/// Auth problems park the run as `needs_input`; anything else is a real
/// error.
fn auth_failure(log: &RunLog, err: HarnessError) -> Result<AttemptResult> {
    match err {
        HarnessError::Auth { message, hint } => {
            let text = match hint {
                Some(hint) => format!("{message} (hint: {hint})"),
                None => message,
            };
            log.line(&format!("[harness] auth unavailable: {text}"));
            Ok(AttemptResult {
                status: RunStatus::NeedsInput,
                exit_code: None,
                timed_out: false,
                error_text: Some(text),
            })
        }
        other => Err(anyhow::Error::new(other)),
    }
}

/// Append-only run log. Output callbacks only queue lines; a background
/// task owns the file and flushes it on [`RunLog::close`].
struct RunLog {
    tx: mpsc::UnboundedSender<String>,
    writer: JoinHandle<()>,
}

impl RunLog {
    async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open run log {}", path.display()))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            let mut out = BufWriter::new(file);
            while let Some(line) = rx.recv().await {
                if let Err(e) = out.write_all(line.as_bytes()).await {
                    debug!(error = %e, "failed to write run log line");
                }
            }
            if let Err(e) = out.flush().await {
                debug!(error = %e, "failed to flush run log");
            }
        });
        Ok(Self { tx, writer })
    }

    fn line(&self, line: &str) {
        let _ = self.tx.send(format!("{line}\n"));
    }

    async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.writer.await {
            warn!(error = %e, "run log writer stopped");
        }
    }
}

async fn write_result(dir: &Path, result: &ResultFile<'_>) -> Result<()> {
    let body = serde_json::to_vec_pretty(result).context("failed to serialize run result")?;
    tokio::fs::write(dir.join("result.json"), body)
        .await
        .context("failed to write result artifact")
}

/// Whether a stderr line looks like a CLI argument rejection.
pub fn is_usage_error(line: &str) -> bool {
    let lower = line.to_lowercase();
    USAGE_ERROR_MARKERS.iter().any(|m| lower.contains(m))
}

/// Replace every known secret in `line`.
pub fn redact(line: &str, secrets: &[String]) -> String {
    secrets
        .iter()
        .filter(|s| s.len() >= 4)
        .fold(line.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
}
