//! Work item state machine.
//!
//! Dispatcher-driven transitions go through [`WorkItemStateMachine`], which
//! enforces the transition graph and optimistic locking. Operator patches
//! bypass it and may set any status.

pub mod dispatch;

use anyhow::{Context, Result, bail};
use sqlx::SqlitePool;
use tracing::info;

use foreman_db::models::{Stage, WorkItemStatus};
use foreman_db::queries::findings::has_open_blocking_findings;
use foreman_db::queries::runs::has_passed_run;
use foreman_db::queries::work_items as db;

/// The work item state machine.
///
/// ```text
/// new       -> triaged
/// triaged   -> planned | executing
/// planned   -> triaged
/// executing -> verifying
/// verifying -> completed
/// any non-terminal            -> blocked | failed | needs_input
/// blocked | needs_input | failed -> triaged | planned
/// ```
pub struct WorkItemStateMachine;

impl WorkItemStateMachine {
    /// Whether `from -> to` is an edge of the graph.
    pub fn is_valid_transition(from: WorkItemStatus, to: WorkItemStatus) -> bool {
        use WorkItemStatus::*;

        if from == to {
            return false;
        }
        match (from, to) {
            (New, Triaged)
            | (Triaged, Planned)
            | (Planned, Triaged)
            | (Triaged, Executing)
            | (Executing, Verifying)
            | (Verifying, Completed) => true,
            (Blocked | NeedsInput | Failed, Triaged | Planned) => true,
            (from, Blocked | Failed | NeedsInput) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Move `id` from `from` to `to` with optimistic locking.
    ///
    /// Errors if the edge is not in the graph, the item does not exist, or
    /// its current status is not `from`.
    pub async fn transition(
        pool: &SqlitePool,
        id: i64,
        from: WorkItemStatus,
        to: WorkItemStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!("invalid state transition: {from} -> {to} for work item {id}");
        }

        let rows = db::transition_work_item(pool, id, from, to, reason)
            .await
            .with_context(|| format!("failed to transition work item {id} from {from} to {to}"))?;

        if rows == 0 {
            match db::get_work_item(pool, id).await? {
                None => bail!("work item {id} not found"),
                Some(item) => bail!(
                    "optimistic lock failed: work item {id} has status {}, expected {from}",
                    item.status
                ),
            }
        }
        Ok(())
    }
}

/// Return every `blocked` item whose subtree is clear of open blocking
/// findings to the dispatch queue.
///
/// Items with a passed plan run go back to `planned`, the rest to
/// `triaged`. Returns the released ids.
pub async fn release_unblocked_work_items(pool: &SqlitePool) -> Result<Vec<i64>> {
    let blocked = db::list_work_items(pool, Some(WorkItemStatus::Blocked)).await?;
    let mut released = Vec::new();

    for item in blocked {
        if has_open_blocking_findings(pool, item.id).await? {
            continue;
        }
        let to = if has_passed_run(pool, item.id, Stage::Plan).await? {
            WorkItemStatus::Planned
        } else {
            WorkItemStatus::Triaged
        };
        let rows = db::transition_work_item(
            pool,
            item.id,
            WorkItemStatus::Blocked,
            to,
            Some("blocking findings resolved"),
        )
        .await?;
        if rows > 0 {
            info!(work_item_id = item.id, to = %to, "released blocked work item");
            released.push(item.id);
        }
    }
    Ok(released)
}
