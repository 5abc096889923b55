use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Implements `Display`, `FromStr` and a dedicated parse error for a
/// unit-only enum stored as text.
macro_rules! text_enum {
    ($ty:ident, $err:ident, $what:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$ty] = &[$(Self::$variant),+];

            /// The stored text form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = $err;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err($err(other.to_owned())),
                }
            }
        }

        #[doc = concat!("Error returned when parsing an invalid [`", stringify!($ty), "`] string.")]
        #[derive(Debug, Clone)]
        pub struct $err(pub String);

        impl fmt::Display for $err {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!("invalid ", $what, ": {:?}"), self.0)
            }
        }

        impl std::error::Error for $err {}
    };
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What a work item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    Bug,
    Finding,
    Story,
    Task,
}

text_enum!(WorkItemKind, WorkItemKindParseError, "work item kind", {
    Bug => "bug",
    Finding => "finding",
    Story => "story",
    Task => "task",
});

// ---------------------------------------------------------------------------

/// Lifecycle status of a work item.
///
/// `new -> triaged -> planned -> executing -> verifying -> completed`, with
/// `blocked`, `failed` and `needs_input` reachable from any non-terminal
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    New,
    Triaged,
    Planned,
    Executing,
    Verifying,
    Completed,
    Blocked,
    Failed,
    NeedsInput,
}

text_enum!(WorkItemStatus, WorkItemStatusParseError, "work item status", {
    New => "new",
    Triaged => "triaged",
    Planned => "planned",
    Executing => "executing",
    Verifying => "verifying",
    Completed => "completed",
    Blocked => "blocked",
    Failed => "failed",
    NeedsInput => "needs_input",
});

impl WorkItemStatus {
    /// `completed` and `failed` end the dispatcher's interest in an item.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses the dispatcher may claim.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::New | Self::Triaged | Self::Planned)
    }
}

// ---------------------------------------------------------------------------

/// Severity of a work item or finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

text_enum!(Severity, SeverityParseError, "severity", {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

// ---------------------------------------------------------------------------

/// Status of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Open,
    Resolved,
}

text_enum!(FindingStatus, FindingStatusParseError, "finding status", {
    Open => "open",
    Resolved => "resolved",
});

// ---------------------------------------------------------------------------

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Plan,
    Execute,
    Test,
}

text_enum!(Stage, StageParseError, "stage", {
    Plan => "plan",
    Execute => "execute",
    Test => "test",
});

// ---------------------------------------------------------------------------

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Passed,
    Failed,
    NeedsInput,
}

text_enum!(RunStatus, RunStatusParseError, "run status", {
    Running => "running",
    Passed => "passed",
    Failed => "failed",
    NeedsInput => "needs_input",
});

// ---------------------------------------------------------------------------

/// Coarse triage bucket used as the profile lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

text_enum!(Complexity, ComplexityParseError, "complexity", {
    Simple => "simple",
    Medium => "medium",
    Complex => "complex",
});

// ---------------------------------------------------------------------------

/// Where a stage command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Host,
    Docker,
}

text_enum!(RuntimeKind, RuntimeKindParseError, "runtime", {
    Host => "host",
    Docker => "docker",
});

// ---------------------------------------------------------------------------

/// How an agent CLI is authenticated for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    None,
    ApiKey,
    Oauth,
    Native,
}

text_enum!(AuthMode, AuthModeParseError, "auth mode", {
    None => "none",
    ApiKey => "api_key",
    Oauth => "oauth",
    Native => "native",
});

// ---------------------------------------------------------------------------

/// Result of probing an agent binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InstallationStatus {
    Ready,
    Degraded,
    Missing,
}

text_enum!(InstallationStatus, InstallationStatusParseError, "installation status", {
    Ready => "ready",
    Degraded => "degraded",
    Missing => "missing",
});

// ---------------------------------------------------------------------------

/// Status of an OAuth PKCE handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuthSessionStatus {
    Pending,
    Completed,
    Failed,
}

text_enum!(AuthSessionStatus, AuthSessionStatusParseError, "auth session status", {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});

// ---------------------------------------------------------------------------

/// Credential providers known to the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
    Opencode,
}

text_enum!(Provider, ProviderParseError, "provider", {
    Claude => "claude",
    Codex => "codex",
    Gemini => "gemini",
    Opencode => "opencode",
});

// ---------------------------------------------------------------------------

/// Origin of a stored credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Oauth,
    ApiKey,
}

text_enum!(TokenKind, TokenKindParseError, "token kind", {
    Oauth => "oauth",
    ApiKey => "api_key",
});

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// A unit of work moving through plan, execute and test.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkItem {
    pub id: i64,
    pub kind: WorkItemKind,
    pub title: String,
    pub body: String,
    pub body_text: String,
    pub status: WorkItemStatus,
    pub priority: i64,
    pub severity: Option<Severity>,
    pub complexity: Complexity,
    pub project_path: String,
    pub parent_id: Option<i64>,
    pub acceptance_criteria: Json<Vec<String>>,
    /// Set while a dispatcher worker owns the item.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// An observation recorded against a run, optionally blocking.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Finding {
    pub id: i64,
    pub work_item_id: i64,
    pub run_id: Option<i64>,
    pub severity: Severity,
    pub title: String,
    pub details: String,
    pub blocking: bool,
    pub status: FindingStatus,
    pub child_work_item_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// One execution attempt of a stage for a work item.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    pub id: i64,
    pub work_item_id: i64,
    pub stage: Stage,
    pub profile_id: Option<i64>,
    pub attempt: i64,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub log_path: Option<String>,
    pub artifact_dir: Option<String>,
    pub error_text: Option<String>,
}

/// Routing rule for one (complexity, stage) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionProfile {
    pub id: i64,
    pub complexity: Complexity,
    pub stage: Stage,
    pub runtime: RuntimeKind,
    pub agent: String,
    pub model: String,
    pub auth_mode: AuthMode,
    pub mcp_profile: Option<String>,
    pub skill_profile: Option<String>,
    pub timeout_secs: i64,
    pub retry_count: i64,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named MCP server configuration handed to agents.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct McpProfile {
    pub id: i64,
    pub name: String,
    pub config: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named bundle of skills and extra instructions for prompts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SkillProfile {
    pub id: i64,
    pub name: String,
    pub skills: Json<Vec<String>>,
    pub instructions: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A discovered agent binary under one runtime.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentInstallation {
    pub id: i64,
    pub agent: String,
    pub runtime: RuntimeKind,
    pub location: Option<String>,
    pub version: Option<String>,
    pub status: InstallationStatus,
    pub manifest: Json<serde_json::Value>,
    pub detail: Option<String>,
    pub probed_at: DateTime<Utc>,
}

/// PKCE handshake state for one OAuth login.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuthSession {
    pub id: i64,
    pub provider: Provider,
    pub runtime: RuntimeKind,
    pub state: String,
    #[serde(skip_serializing)]
    pub code_verifier: String,
    pub code_challenge: String,
    pub status: AuthSessionStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Encrypted credential for a provider. Plaintext never reaches this row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuthTokenRecord {
    pub id: i64,
    pub provider: Provider,
    pub token_kind: TokenKind,
    #[serde(skip_serializing)]
    pub access_token_enc: String,
    #[serde(skip_serializing)]
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A file uploaded against a work item.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Attachment {
    pub id: i64,
    pub work_item_id: i64,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub file_path: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HarnessEvent {
    pub id: i64,
    pub event_type: String,
    pub object_type: String,
    pub object_id: Option<String>,
    pub payload: Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
