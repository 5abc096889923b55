//! Database query functions for the `work_items` table, including the
//! dispatcher's claim primitive and the decomposition-tree walk.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use sqlx::types::Json;

use crate::models::{Complexity, Severity, WorkItem, WorkItemKind, WorkItemStatus};
use crate::queries::events::insert_event;

/// Priority assigned when the caller does not give one.
pub const DEFAULT_PRIORITY: i64 = 3;

/// Fields for a new work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub kind: WorkItemKind,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_text: String,
    pub priority: Option<i64>,
    pub severity: Option<Severity>,
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub project_path: String,
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl NewWorkItem {
    /// A bare item of `kind` with `title`; everything else defaulted.
    pub fn new(kind: WorkItemKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            body: String::new(),
            body_text: String::new(),
            priority: None,
            severity: None,
            complexity: None,
            project_path: String::new(),
            parent_id: None,
            acceptance_criteria: Vec::new(),
        }
    }
}

/// Partial update for a work item. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkItemPatch {
    pub kind: Option<WorkItemKind>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub body_text: Option<String>,
    pub status: Option<WorkItemStatus>,
    pub priority: Option<i64>,
    pub severity: Option<Severity>,
    pub complexity: Option<Complexity>,
    pub project_path: Option<String>,
    pub acceptance_criteria: Option<Vec<String>>,
}

impl WorkItemPatch {
    /// Names of the fields this patch sets.
    pub fn touched_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.kind.is_some() {
            fields.push("kind");
        }
        if self.title.is_some() {
            fields.push("title");
        }
        if self.body.is_some() {
            fields.push("body");
        }
        if self.body_text.is_some() {
            fields.push("body_text");
        }
        if self.status.is_some() {
            fields.push("status");
        }
        if self.priority.is_some() {
            fields.push("priority");
        }
        if self.severity.is_some() {
            fields.push("severity");
        }
        if self.complexity.is_some() {
            fields.push("complexity");
        }
        if self.project_path.is_some() {
            fields.push("project_path");
        }
        if self.acceptance_criteria.is_some() {
            fields.push("acceptance_criteria");
        }
        fields
    }
}

/// A work item returned by a claim, together with the status it had
/// before the claim flipped it to `triaged`.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimedWorkItem {
    pub item: WorkItem,
    pub previous_status: WorkItemStatus,
}

/// Insert a new work item and its `work_item_created` event in one
/// transaction.
pub async fn insert_work_item(
    pool: &SqlitePool,
    new: &NewWorkItem,
    default_complexity: Complexity,
) -> Result<WorkItem> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let item = sqlx::query_as::<_, WorkItem>(
        "INSERT INTO work_items \
         (kind, title, body, body_text, status, priority, severity, complexity, \
          project_path, parent_id, acceptance_criteria, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'new', ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.kind)
    .bind(&new.title)
    .bind(&new.body)
    .bind(&new.body_text)
    .bind(new.priority.unwrap_or(DEFAULT_PRIORITY))
    .bind(new.severity)
    .bind(new.complexity.unwrap_or(default_complexity))
    .bind(&new.project_path)
    .bind(new.parent_id)
    .bind(Json(&new.acceptance_criteria))
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert work item")?;

    insert_event(
        &mut *tx,
        "work_item_created",
        "work_item",
        Some(item.id.to_string()),
        json!({
            "kind": item.kind,
            "priority": item.priority,
            "parent_id": item.parent_id,
        }),
    )
    .await?;

    tx.commit().await.context("failed to commit work item")?;
    Ok(item)
}

/// Fetch a single work item by ID.
pub async fn get_work_item(pool: &SqlitePool, id: i64) -> Result<Option<WorkItem>> {
    let item = sqlx::query_as::<_, WorkItem>("SELECT * FROM work_items WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch work item")?;

    Ok(item)
}

/// List work items in dispatch order, optionally filtered by status.
pub async fn list_work_items(
    pool: &SqlitePool,
    status: Option<WorkItemStatus>,
) -> Result<Vec<WorkItem>> {
    let items = sqlx::query_as::<_, WorkItem>(
        "SELECT * FROM work_items \
         WHERE (? IS NULL OR status = ?) \
         ORDER BY priority ASC, created_at ASC, id ASC",
    )
    .bind(status)
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list work items")?;

    Ok(items)
}

/// Direct children of a work item.
pub async fn list_children(pool: &SqlitePool, parent_id: i64) -> Result<Vec<WorkItem>> {
    let items = sqlx::query_as::<_, WorkItem>(
        "SELECT * FROM work_items WHERE parent_id = ? ORDER BY id ASC",
    )
    .bind(parent_id)
    .fetch_all(pool)
    .await
    .context("failed to list child work items")?;

    Ok(items)
}

/// Result of [`update_work_item`].
#[derive(Debug)]
pub enum PatchOutcome {
    Updated(WorkItem),
    NotFound,
    /// A worker holds the claim, so the status cannot change under it.
    Claimed,
}

/// Apply a partial patch and return the merged row.
///
/// Setting `status` to `completed` stamps `closed_at`; setting any other
/// status clears it. A status patch on a claimed item is refused; the claim
/// itself is only released by dispatcher transitions.
pub async fn update_work_item(
    pool: &SqlitePool,
    id: i64,
    patch: &WorkItemPatch,
) -> Result<PatchOutcome> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let Some(current) = sqlx::query_as::<_, WorkItem>("SELECT * FROM work_items WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .context("failed to fetch work item for update")?
    else {
        return Ok(PatchOutcome::NotFound);
    };
    if patch.status.is_some() && current.claimed_at.is_some() {
        return Ok(PatchOutcome::Claimed);
    }

    let now = Utc::now();
    let closed_at = match patch.status {
        Some(WorkItemStatus::Completed) => Some(now),
        Some(_) => None,
        None => current.closed_at,
    };
    let criteria = patch
        .acceptance_criteria
        .clone()
        .unwrap_or_else(|| current.acceptance_criteria.0.clone());

    let updated = sqlx::query_as::<_, WorkItem>(
        "UPDATE work_items SET \
             kind = ?, title = ?, body = ?, body_text = ?, status = ?, priority = ?, \
             severity = ?, complexity = ?, project_path = ?, acceptance_criteria = ?, \
             updated_at = ?, closed_at = ? \
         WHERE id = ? \
         RETURNING *",
    )
    .bind(patch.kind.unwrap_or(current.kind))
    .bind(patch.title.as_deref().unwrap_or(&current.title))
    .bind(patch.body.as_deref().unwrap_or(&current.body))
    .bind(patch.body_text.as_deref().unwrap_or(&current.body_text))
    .bind(patch.status.unwrap_or(current.status))
    .bind(patch.priority.unwrap_or(current.priority))
    .bind(patch.severity.or(current.severity))
    .bind(patch.complexity.unwrap_or(current.complexity))
    .bind(patch.project_path.as_deref().unwrap_or(&current.project_path))
    .bind(Json(criteria))
    .bind(now)
    .bind(closed_at)
    .bind(id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to update work item")?;

    insert_event(
        &mut *tx,
        "work_item_updated",
        "work_item",
        Some(id.to_string()),
        json!({
            "fields": patch.touched_fields(),
            "from_status": current.status,
            "to_status": updated.status,
        }),
    )
    .await?;

    tx.commit().await.context("failed to commit work item update")?;
    Ok(PatchOutcome::Updated(updated))
}

// -----------------------------------------------------------------------
// Dispatcher primitives
// -----------------------------------------------------------------------

/// Claim the most urgent eligible work item.
///
/// Picks the lowest `(priority, created_at, id)` unclaimed row whose status
/// is `new`, `triaged` or `planned`, flips it to `triaged` and stamps
/// `claimed_at`. The claim holds until the worker parks or finishes the item.
///
/// The select and the conditional update run in one transaction on the
/// store's single connection, so concurrent callers never claim the same
/// row.
pub async fn claim_next_work_item(pool: &SqlitePool) -> Result<Option<ClaimedWorkItem>> {
    let mut tx = pool.begin().await.context("failed to begin claim transaction")?;

    let candidate = sqlx::query_as::<_, WorkItem>(
        "SELECT * FROM work_items \
         WHERE status IN ('new', 'triaged', 'planned') AND claimed_at IS NULL \
         ORDER BY priority ASC, created_at ASC, id ASC \
         LIMIT 1",
    )
    .fetch_optional(&mut *tx)
    .await
    .context("failed to select claimable work item")?;

    let Some(candidate) = candidate else {
        return Ok(None);
    };

    let claimed = flip_to_triaged(&mut tx, candidate).await?;
    tx.commit().await.context("failed to commit claim")?;
    Ok(claimed)
}

/// Claim one specific work item if it is currently claimable.
pub async fn claim_work_item(pool: &SqlitePool, id: i64) -> Result<Option<ClaimedWorkItem>> {
    let mut tx = pool.begin().await.context("failed to begin claim transaction")?;

    let candidate = sqlx::query_as::<_, WorkItem>(
        "SELECT * FROM work_items \
         WHERE id = ? AND status IN ('new', 'triaged', 'planned') AND claimed_at IS NULL",
    )
    .bind(id)
    .fetch_optional(&mut *tx)
    .await
    .context("failed to select work item for claim")?;

    let Some(candidate) = candidate else {
        return Ok(None);
    };

    let claimed = flip_to_triaged(&mut tx, candidate).await?;
    tx.commit().await.context("failed to commit claim")?;
    Ok(claimed)
}

async fn flip_to_triaged(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    candidate: WorkItem,
) -> Result<Option<ClaimedWorkItem>> {
    let previous_status = candidate.status;
    let now = Utc::now();

    let result = sqlx::query(
        "UPDATE work_items SET status = 'triaged', claimed_at = ?, updated_at = ?, closed_at = NULL \
         WHERE id = ? AND status = ? AND claimed_at IS NULL",
    )
    .bind(now)
    .bind(now)
    .bind(candidate.id)
    .bind(previous_status)
    .execute(&mut **tx)
    .await
    .context("failed to flip work item to triaged")?;

    if result.rows_affected() == 0 {
        return Ok(None);
    }

    insert_event(
        &mut **tx,
        "work_item_claimed",
        "work_item",
        Some(candidate.id.to_string()),
        json!({ "previous_status": previous_status }),
    )
    .await?;

    let mut item = candidate;
    item.status = WorkItemStatus::Triaged;
    item.claimed_at = Some(now);
    item.updated_at = now;
    item.closed_at = None;
    Ok(Some(ClaimedWorkItem {
        item,
        previous_status,
    }))
}

/// Atomically move a work item from `from` to `to`.
///
/// Optimistic lock on the current status; returns the number of rows
/// affected (0 means the status did not match). The dispatcher claim is
/// kept while the item moves through `executing` and `verifying` and is
/// released by any other transition. Records a `work_item_transition`
/// event when the row changes.
pub async fn transition_work_item(
    pool: &SqlitePool,
    id: i64,
    from: WorkItemStatus,
    to: WorkItemStatus,
    reason: Option<&str>,
) -> Result<u64> {
    let now = Utc::now();
    let closed_at = (to == WorkItemStatus::Completed).then_some(now);
    let keeps_claim = matches!(to, WorkItemStatus::Executing | WorkItemStatus::Verifying);
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let result = sqlx::query(
        "UPDATE work_items SET status = ?, updated_at = ?, closed_at = ?, \
             claimed_at = CASE WHEN ? THEN claimed_at ELSE NULL END \
         WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(now)
    .bind(closed_at)
    .bind(keeps_claim)
    .bind(id)
    .bind(from)
    .execute(&mut *tx)
    .await
    .context("failed to transition work item")?;

    if result.rows_affected() > 0 {
        insert_event(
            &mut *tx,
            "work_item_transition",
            "work_item",
            Some(id.to_string()),
            json!({ "from": from, "to": to, "reason": reason }),
        )
        .await?;
    }

    tx.commit().await.context("failed to commit transition")?;
    Ok(result.rows_affected())
}

/// Drop a claim without changing status.
pub async fn release_claim(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE work_items SET claimed_at = NULL WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to release work item claim")?;

    Ok(())
}

/// Release claims and in-flight statuses left by a previous process.
///
/// `executing` and `verifying` only exist while a worker owns the item, so
/// after a restart they fall back to `planned` and the execute stage runs
/// again. Returns the ids that were touched.
pub async fn recover_interrupted_work_items(pool: &SqlitePool) -> Result<Vec<i64>> {
    let now = Utc::now();
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let rows: Vec<(i64, WorkItemStatus)> = sqlx::query_as(
        "SELECT id, status FROM work_items \
         WHERE claimed_at IS NOT NULL OR status IN ('executing', 'verifying')",
    )
    .fetch_all(&mut *tx)
    .await
    .context("failed to find interrupted work items")?;

    for (id, status) in &rows {
        let to = match status {
            WorkItemStatus::Executing | WorkItemStatus::Verifying => WorkItemStatus::Planned,
            other => *other,
        };
        sqlx::query(
            "UPDATE work_items SET status = ?, claimed_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(to)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to recover work item")?;

        insert_event(
            &mut *tx,
            "work_item_recovered",
            "work_item",
            Some(id.to_string()),
            json!({ "from": status, "to": to }),
        )
        .await?;
    }

    tx.commit().await.context("failed to commit recovery")?;
    Ok(rows.into_iter().map(|(id, _)| id).collect())
}

// -----------------------------------------------------------------------
// Decomposition tree
// -----------------------------------------------------------------------

/// Load the whole parent -> children adjacency list.
async fn load_children_map(pool: &SqlitePool) -> Result<HashMap<i64, Vec<i64>>> {
    let edges: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT id, parent_id FROM work_items WHERE parent_id IS NOT NULL",
    )
    .fetch_all(pool)
    .await
    .context("failed to load work item tree")?;

    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
    for (id, parent) in edges {
        children.entry(parent).or_default().push(id);
    }
    Ok(children)
}

/// Ids of the subtree rooted at `root`, root first, breadth-first.
pub async fn subtree_ids(pool: &SqlitePool, root: i64) -> Result<Vec<i64>> {
    let children = load_children_map(pool).await?;
    Ok(walk_subtree(&children, root))
}

/// Breadth-first walk over an adjacency list. A visited set keeps the walk
/// finite even if a cycle was introduced by hand-edited data.
pub fn walk_subtree(children: &HashMap<i64, Vec<i64>>, root: i64) -> Vec<i64> {
    let mut seen = HashSet::from([root]);
    let mut order = vec![root];
    let mut queue = VecDeque::from([root]);

    while let Some(node) = queue.pop_front() {
        for &child in children.get(&node).map(Vec::as_slice).unwrap_or(&[]) {
            if seen.insert(child) {
                order.push(child);
                queue.push_back(child);
            }
        }
    }
    order
}

/// Number of ancestors above a work item (0 for a root item).
pub async fn ancestor_depth(pool: &SqlitePool, id: i64) -> Result<usize> {
    let mut depth = 0;
    let mut seen = HashSet::from([id]);
    let mut current = id;

    loop {
        let parent: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT parent_id FROM work_items WHERE id = ?")
                .bind(current)
                .fetch_optional(pool)
                .await
                .context("failed to walk work item ancestors")?;

        match parent {
            Some((Some(parent_id),)) if seen.insert(parent_id) => {
                depth += 1;
                current = parent_id;
            }
            _ => return Ok(depth),
        }
    }
}
