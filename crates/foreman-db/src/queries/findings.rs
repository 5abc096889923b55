//! Database query functions for the `findings` table and the
//! blocking-findings gate over the work item tree.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;

use crate::models::{Finding, Severity};
use crate::queries::events::insert_event;
use crate::queries::work_items::subtree_ids;

/// Fields for a new finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFinding {
    pub work_item_id: i64,
    pub run_id: Option<i64>,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub details: String,
    #[serde(default)]
    pub blocking: bool,
}

/// Insert a finding and its `finding_created` event.
pub async fn insert_finding(pool: &SqlitePool, new: &NewFinding) -> Result<Finding> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let finding = sqlx::query_as::<_, Finding>(
        "INSERT INTO findings \
         (work_item_id, run_id, severity, title, details, blocking, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, 'open', ?) \
         RETURNING *",
    )
    .bind(new.work_item_id)
    .bind(new.run_id)
    .bind(new.severity)
    .bind(&new.title)
    .bind(&new.details)
    .bind(new.blocking)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert finding")?;

    insert_event(
        &mut *tx,
        "finding_created",
        "finding",
        Some(finding.id.to_string()),
        json!({
            "work_item_id": finding.work_item_id,
            "run_id": finding.run_id,
            "blocking": finding.blocking,
            "severity": finding.severity,
        }),
    )
    .await?;

    tx.commit().await.context("failed to commit finding")?;
    Ok(finding)
}

/// Point a finding at the remediation work item spawned for it.
pub async fn link_child_work_item(
    pool: &SqlitePool,
    finding_id: i64,
    child_work_item_id: i64,
) -> Result<()> {
    let result = sqlx::query("UPDATE findings SET child_work_item_id = ? WHERE id = ?")
        .bind(child_work_item_id)
        .bind(finding_id)
        .execute(pool)
        .await
        .context("failed to link finding to child work item")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("finding {finding_id} not found");
    }
    Ok(())
}

/// Fetch a single finding by ID.
pub async fn get_finding(pool: &SqlitePool, id: i64) -> Result<Option<Finding>> {
    let finding = sqlx::query_as::<_, Finding>("SELECT * FROM findings WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch finding")?;

    Ok(finding)
}

/// All findings recorded against a work item, oldest first.
pub async fn list_findings_for_work_item(
    pool: &SqlitePool,
    work_item_id: i64,
) -> Result<Vec<Finding>> {
    let findings = sqlx::query_as::<_, Finding>(
        "SELECT * FROM findings WHERE work_item_id = ? ORDER BY id ASC",
    )
    .bind(work_item_id)
    .fetch_all(pool)
    .await
    .context("failed to list findings")?;

    Ok(findings)
}

/// Open findings recorded against a work item.
pub async fn list_open_findings_for_work_item(
    pool: &SqlitePool,
    work_item_id: i64,
) -> Result<Vec<Finding>> {
    let findings = sqlx::query_as::<_, Finding>(
        "SELECT * FROM findings WHERE work_item_id = ? AND status = 'open' ORDER BY id ASC",
    )
    .bind(work_item_id)
    .fetch_all(pool)
    .await
    .context("failed to list open findings")?;

    Ok(findings)
}

/// Whether any node of the subtree rooted at `work_item_id` (the root
/// included) has an open blocking finding.
///
/// The tree is materialised once as an adjacency list and walked
/// breadth-first; the open blocking findings are loaded in one query and
/// intersected with the walked ids.
pub async fn has_open_blocking_findings(pool: &SqlitePool, work_item_id: i64) -> Result<bool> {
    Ok(!open_blocking_findings_in_subtree(pool, work_item_id)
        .await?
        .is_empty())
}

/// The open blocking findings anywhere in the subtree rooted at
/// `work_item_id`.
pub async fn open_blocking_findings_in_subtree(
    pool: &SqlitePool,
    work_item_id: i64,
) -> Result<Vec<Finding>> {
    let subtree: HashSet<i64> = subtree_ids(pool, work_item_id).await?.into_iter().collect();

    let open = sqlx::query_as::<_, Finding>(
        "SELECT * FROM findings WHERE status = 'open' AND blocking = 1 ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to load open blocking findings")?;

    Ok(open
        .into_iter()
        .filter(|f| subtree.contains(&f.work_item_id))
        .collect())
}

/// Resolve a single finding. Returns `None` if it does not exist; an
/// already-resolved finding is returned unchanged.
pub async fn resolve_finding(pool: &SqlitePool, id: i64) -> Result<Option<Finding>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE findings SET status = 'resolved', resolved_at = ? \
         WHERE id = ? AND status = 'open'",
    )
    .bind(Utc::now())
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("failed to resolve finding")?;

    if result.rows_affected() > 0 {
        insert_event(
            &mut *tx,
            "finding_resolved",
            "finding",
            Some(id.to_string()),
            json!({ "via": "explicit" }),
        )
        .await?;
    }

    let finding = sqlx::query_as::<_, Finding>("SELECT * FROM findings WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to fetch resolved finding")?;

    tx.commit().await.context("failed to commit finding resolution")?;
    Ok(finding)
}

/// Resolve every open finding whose remediation child is `child_work_item_id`.
///
/// Returns the findings that were resolved by this call.
pub async fn resolve_findings_by_child_work_item(
    pool: &SqlitePool,
    child_work_item_id: i64,
) -> Result<Vec<Finding>> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let resolved = sqlx::query_as::<_, Finding>(
        "UPDATE findings SET status = 'resolved', resolved_at = ? \
         WHERE child_work_item_id = ? AND status = 'open' \
         RETURNING *",
    )
    .bind(Utc::now())
    .bind(child_work_item_id)
    .fetch_all(&mut *tx)
    .await
    .context("failed to resolve findings by child work item")?;

    for finding in &resolved {
        insert_event(
            &mut *tx,
            "finding_resolved",
            "finding",
            Some(finding.id.to_string()),
            json!({ "via": "child_work_item", "child_work_item_id": child_work_item_id }),
        )
        .await?;
    }

    tx.commit().await.context("failed to commit finding resolution")?;
    Ok(resolved)
}
