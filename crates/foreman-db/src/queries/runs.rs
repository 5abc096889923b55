//! Database query functions for the append-only `runs` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{Run, RunStatus, Stage};

/// Insert a `running` run, then let `paths` derive its log path and
/// artifact directory from the new id. Both writes share one transaction.
pub async fn insert_run(
    pool: &SqlitePool,
    work_item_id: i64,
    stage: Stage,
    profile_id: Option<i64>,
    attempt: i64,
    paths: impl FnOnce(i64) -> (String, String),
) -> Result<Run> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO runs (work_item_id, stage, profile_id, attempt, status, started_at) \
         VALUES (?, ?, ?, ?, 'running', ?) \
         RETURNING id",
    )
    .bind(work_item_id)
    .bind(stage)
    .bind(profile_id)
    .bind(attempt)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert run")?;

    let (log_path, artifact_dir) = paths(id);
    let run = sqlx::query_as::<_, Run>(
        "UPDATE runs SET log_path = ?, artifact_dir = ? WHERE id = ? RETURNING *",
    )
    .bind(log_path)
    .bind(artifact_dir)
    .bind(id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to record run paths")?;

    tx.commit().await.context("failed to commit run")?;
    Ok(run)
}

/// Move a run from `running` to a terminal status.
///
/// Returns the number of rows affected; 0 means the run was not running.
pub async fn finish_run(
    pool: &SqlitePool,
    id: i64,
    status: RunStatus,
    exit_code: Option<i64>,
    error_text: Option<&str>,
) -> Result<u64> {
    if status == RunStatus::Running {
        anyhow::bail!("cannot finish run {id} with status running");
    }

    let result = sqlx::query(
        "UPDATE runs SET status = ?, ended_at = ?, exit_code = ?, error_text = ? \
         WHERE id = ? AND status = 'running'",
    )
    .bind(status)
    .bind(Utc::now())
    .bind(exit_code)
    .bind(error_text)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish run")?;

    Ok(result.rows_affected())
}

/// Fetch a single run by ID.
pub async fn get_run(pool: &SqlitePool, id: i64) -> Result<Option<Run>> {
    let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch run")?;

    Ok(run)
}

/// All runs for a work item, oldest first.
pub async fn list_runs_for_work_item(pool: &SqlitePool, work_item_id: i64) -> Result<Vec<Run>> {
    let runs = sqlx::query_as::<_, Run>(
        "SELECT * FROM runs WHERE work_item_id = ? ORDER BY id ASC",
    )
    .bind(work_item_id)
    .fetch_all(pool)
    .await
    .context("failed to list runs")?;

    Ok(runs)
}

/// Whether a work item has at least one passed run for `stage`.
pub async fn has_passed_run(pool: &SqlitePool, work_item_id: i64, stage: Stage) -> Result<bool> {
    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM runs WHERE work_item_id = ? AND stage = ? AND status = 'passed'",
    )
    .bind(work_item_id)
    .bind(stage)
    .fetch_one(pool)
    .await
    .context("failed to count passed runs")?;

    Ok(count > 0)
}

/// Fail every run still marked `running`. Called once at startup: a
/// process that died mid-run leaves no one to finish those rows.
pub async fn fail_orphaned_runs(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE runs SET status = 'failed', ended_at = ?, \
             error_text = 'harness restarted while run was in flight' \
         WHERE status = 'running'",
    )
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to fail orphaned runs")?;

    Ok(result.rows_affected())
}
