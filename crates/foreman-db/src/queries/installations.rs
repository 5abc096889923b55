//! Database query functions for the `agent_installations` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::{AgentInstallation, InstallationStatus, RuntimeKind};

/// Result of one discovery probe, ready to persist.
#[derive(Debug, Clone)]
pub struct NewInstallation {
    pub agent: String,
    pub runtime: RuntimeKind,
    pub location: Option<String>,
    pub version: Option<String>,
    pub status: InstallationStatus,
    pub manifest: serde_json::Value,
    pub detail: Option<String>,
}

/// Insert or refresh the installation row for `(agent, runtime)`.
pub async fn upsert_installation(
    pool: &SqlitePool,
    new: &NewInstallation,
) -> Result<AgentInstallation> {
    let installation = sqlx::query_as::<_, AgentInstallation>(
        "INSERT INTO agent_installations \
         (agent, runtime, location, version, status, manifest, detail, probed_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (agent, runtime) DO UPDATE SET \
             location = excluded.location, version = excluded.version, \
             status = excluded.status, manifest = excluded.manifest, \
             detail = excluded.detail, probed_at = excluded.probed_at \
         RETURNING *",
    )
    .bind(&new.agent)
    .bind(new.runtime)
    .bind(&new.location)
    .bind(&new.version)
    .bind(new.status)
    .bind(Json(&new.manifest))
    .bind(&new.detail)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert installation for {}", new.agent))?;

    Ok(installation)
}

/// All known installations.
pub async fn list_installations(pool: &SqlitePool) -> Result<Vec<AgentInstallation>> {
    let rows = sqlx::query_as::<_, AgentInstallation>(
        "SELECT * FROM agent_installations ORDER BY agent, runtime",
    )
    .fetch_all(pool)
    .await
    .context("failed to list installations")?;

    Ok(rows)
}
