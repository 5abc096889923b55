//! Semantic wrappers around [`super::WorkItemStateMachine`] transitions
//! used by the dispatcher. A claimed item always sits in `triaged`.

use anyhow::Result;
use sqlx::SqlitePool;

use foreman_db::models::WorkItemStatus;

use super::WorkItemStateMachine;

/// Plan stage passed: `triaged -> planned`.
pub async fn finish_plan(pool: &SqlitePool, id: i64) -> Result<()> {
    WorkItemStateMachine::transition(
        pool,
        id,
        WorkItemStatus::Triaged,
        WorkItemStatus::Planned,
        Some("plan passed"),
    )
    .await
}

/// Execute stage starting: `triaged -> executing`.
pub async fn begin_execute(pool: &SqlitePool, id: i64) -> Result<()> {
    WorkItemStateMachine::transition(
        pool,
        id,
        WorkItemStatus::Triaged,
        WorkItemStatus::Executing,
        None,
    )
    .await
}

/// Execute stage passed: `executing -> verifying`.
pub async fn begin_verify(pool: &SqlitePool, id: i64) -> Result<()> {
    WorkItemStateMachine::transition(
        pool,
        id,
        WorkItemStatus::Executing,
        WorkItemStatus::Verifying,
        Some("execute passed"),
    )
    .await
}

/// Test stage passed: `verifying -> completed`.
pub async fn complete(pool: &SqlitePool, id: i64) -> Result<()> {
    WorkItemStateMachine::transition(
        pool,
        id,
        WorkItemStatus::Verifying,
        WorkItemStatus::Completed,
        Some("test passed"),
    )
    .await
}

/// Take a side exit (`blocked`, `failed` or `needs_input`) from wherever
/// the item currently is.
pub async fn park(
    pool: &SqlitePool,
    id: i64,
    from: WorkItemStatus,
    to: WorkItemStatus,
    reason: &str,
) -> Result<()> {
    WorkItemStateMachine::transition(pool, id, from, to, Some(reason)).await
}
