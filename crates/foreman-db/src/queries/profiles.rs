//! Database query functions for execution, MCP and skill profiles.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::{
    AuthMode, Complexity, ExecutionProfile, McpProfile, RuntimeKind, SkillProfile, Stage,
};
use crate::queries::events::insert_event;

fn default_timeout_secs() -> i64 {
    1800
}

fn default_enabled() -> bool {
    true
}

/// One execution profile as supplied to a bulk replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionProfileInput {
    pub complexity: Complexity,
    pub stage: Stage,
    pub runtime: RuntimeKind,
    pub agent: String,
    #[serde(default)]
    pub model: String,
    pub auth_mode: AuthMode,
    pub mcp_profile: Option<String>,
    pub skill_profile: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: i64,
    #[serde(default)]
    pub retry_count: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// One MCP profile as supplied to a bulk replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpProfileInput {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One skill profile as supplied to a bulk replace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillProfileInput {
    pub name: String,
    #[serde(default)]
    pub skills: Vec<String>,
    pub instructions: Option<String>,
}

/// The complete routing configuration, replaced as a unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileSet {
    #[serde(default)]
    pub execution: Vec<ExecutionProfileInput>,
    #[serde(default)]
    pub mcp: Vec<McpProfileInput>,
    #[serde(default)]
    pub skills: Vec<SkillProfileInput>,
}

/// Every stored profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub execution: Vec<ExecutionProfile>,
    pub mcp: Vec<McpProfile>,
    pub skills: Vec<SkillProfile>,
}

/// Resolve the routing rule for `(complexity, stage)`.
///
/// Returns the highest-id enabled row, or `None` when nothing is
/// configured. Callers must not substitute a default.
pub async fn get_execution_profile(
    pool: &SqlitePool,
    complexity: Complexity,
    stage: Stage,
) -> Result<Option<ExecutionProfile>> {
    let profile = sqlx::query_as::<_, ExecutionProfile>(
        "SELECT * FROM execution_profiles \
         WHERE complexity = ? AND stage = ? AND enabled = 1 \
         ORDER BY id DESC \
         LIMIT 1",
    )
    .bind(complexity)
    .bind(stage)
    .fetch_optional(pool)
    .await
    .context("failed to resolve execution profile")?;

    Ok(profile)
}

/// Fetch a skill profile by name.
pub async fn get_skill_profile(pool: &SqlitePool, name: &str) -> Result<Option<SkillProfile>> {
    let profile = sqlx::query_as::<_, SkillProfile>("SELECT * FROM skill_profiles WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch skill profile")?;

    Ok(profile)
}

/// Fetch an MCP profile by name.
pub async fn get_mcp_profile(pool: &SqlitePool, name: &str) -> Result<Option<McpProfile>> {
    let profile = sqlx::query_as::<_, McpProfile>("SELECT * FROM mcp_profiles WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch mcp profile")?;

    Ok(profile)
}

/// Load every stored profile.
pub async fn list_profiles(pool: &SqlitePool) -> Result<ProfileSnapshot> {
    let execution = sqlx::query_as::<_, ExecutionProfile>(
        "SELECT * FROM execution_profiles ORDER BY complexity, stage, id",
    )
    .fetch_all(pool)
    .await
    .context("failed to list execution profiles")?;

    let mcp = sqlx::query_as::<_, McpProfile>("SELECT * FROM mcp_profiles ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to list mcp profiles")?;

    let skills = sqlx::query_as::<_, SkillProfile>("SELECT * FROM skill_profiles ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to list skill profiles")?;

    Ok(ProfileSnapshot {
        execution,
        mcp,
        skills,
    })
}

/// Replace all profiles with `set` in one transaction.
///
/// Rows matching a unique key are updated in place (keeping their id),
/// new keys are inserted and rows absent from `set` are deleted. Callers
/// validate `set` first; a failure here rolls back every table.
pub async fn upsert_profiles(pool: &SqlitePool, set: &ProfileSet) -> Result<ProfileSnapshot> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    // MCP profiles.
    for mcp in &set.mcp {
        sqlx::query(
            "INSERT INTO mcp_profiles (name, config, created_at, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT (name) DO UPDATE SET \
                 config = excluded.config, updated_at = excluded.updated_at",
        )
        .bind(&mcp.name)
        .bind(Json(&mcp.config))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to upsert mcp profile {}", mcp.name))?;
    }
    let keep: HashSet<&str> = set.mcp.iter().map(|m| m.name.as_str()).collect();
    let existing: Vec<(String,)> = sqlx::query_as("SELECT name FROM mcp_profiles")
        .fetch_all(&mut *tx)
        .await
        .context("failed to list mcp profile names")?;
    for (name,) in existing.iter().filter(|(n,)| !keep.contains(n.as_str())) {
        sqlx::query("DELETE FROM mcp_profiles WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to delete mcp profile {name}"))?;
    }

    // Skill profiles.
    for skill in &set.skills {
        sqlx::query(
            "INSERT INTO skill_profiles (name, skills, instructions, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (name) DO UPDATE SET \
                 skills = excluded.skills, instructions = excluded.instructions, \
                 updated_at = excluded.updated_at",
        )
        .bind(&skill.name)
        .bind(Json(&skill.skills))
        .bind(&skill.instructions)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to upsert skill profile {}", skill.name))?;
    }
    let keep: HashSet<&str> = set.skills.iter().map(|s| s.name.as_str()).collect();
    let existing: Vec<(String,)> = sqlx::query_as("SELECT name FROM skill_profiles")
        .fetch_all(&mut *tx)
        .await
        .context("failed to list skill profile names")?;
    for (name,) in existing.iter().filter(|(n,)| !keep.contains(n.as_str())) {
        sqlx::query("DELETE FROM skill_profiles WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to delete skill profile {name}"))?;
    }

    // Execution profiles.
    for p in &set.execution {
        sqlx::query(
            "INSERT INTO execution_profiles \
             (complexity, stage, runtime, agent, model, auth_mode, mcp_profile, skill_profile, \
              timeout_secs, retry_count, enabled, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (complexity, stage) DO UPDATE SET \
                 runtime = excluded.runtime, agent = excluded.agent, model = excluded.model, \
                 auth_mode = excluded.auth_mode, mcp_profile = excluded.mcp_profile, \
                 skill_profile = excluded.skill_profile, timeout_secs = excluded.timeout_secs, \
                 retry_count = excluded.retry_count, enabled = excluded.enabled, \
                 updated_at = excluded.updated_at",
        )
        .bind(p.complexity)
        .bind(p.stage)
        .bind(p.runtime)
        .bind(&p.agent)
        .bind(&p.model)
        .bind(p.auth_mode)
        .bind(&p.mcp_profile)
        .bind(&p.skill_profile)
        .bind(p.timeout_secs)
        .bind(p.retry_count)
        .bind(p.enabled)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .with_context(|| {
            format!(
                "failed to upsert execution profile ({}, {})",
                p.complexity, p.stage
            )
        })?;
    }
    let keep: HashSet<(Complexity, Stage)> =
        set.execution.iter().map(|p| (p.complexity, p.stage)).collect();
    let existing: Vec<(i64, Complexity, Stage)> =
        sqlx::query_as("SELECT id, complexity, stage FROM execution_profiles")
            .fetch_all(&mut *tx)
            .await
            .context("failed to list execution profile keys")?;
    for (id, _, _) in existing
        .iter()
        .filter(|(_, c, s)| !keep.contains(&(*c, *s)))
    {
        sqlx::query("DELETE FROM execution_profiles WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to delete execution profile {id}"))?;
    }

    insert_event(
        &mut *tx,
        "profiles_updated",
        "profiles",
        None,
        json!({
            "execution": set.execution.len(),
            "mcp": set.mcp.len(),
            "skills": set.skills.len(),
        }),
    )
    .await?;

    tx.commit().await.context("failed to commit profile update")?;
    list_profiles(pool).await
}
