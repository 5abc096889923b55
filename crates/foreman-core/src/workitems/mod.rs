//! Work item intake, patching and read models.
//!
//! Text fields pass through the prompt-injection guard on create and on
//! patch (touched fields only). A blocked write still leaves a
//! `prompt_injection_blocked` event behind.

use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tracing::warn;

use foreman_db::models::{Attachment, Complexity, Finding, Run, WorkItem};
use foreman_db::queries::attachments::list_attachments_for_work_item;
use foreman_db::queries::events::insert_event;
use foreman_db::queries::findings::{
    get_finding, list_findings_for_work_item, open_blocking_findings_in_subtree,
    resolve_finding as resolve_finding_row,
};
use foreman_db::queries::runs::list_runs_for_work_item;
use foreman_db::queries::work_items::{
    NewWorkItem, PatchOutcome, WorkItemPatch, get_work_item, insert_work_item, list_children,
    update_work_item,
};

use crate::error::{HarnessError, HarnessResult};
use crate::guard::{GuardVerdict, PromptGuard, pattern_names};

/// A work item with everything hanging off it.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItemDetail {
    #[serde(flatten)]
    pub item: WorkItem,
    pub findings: Vec<Finding>,
    pub runs: Vec<Run>,
    pub attachments: Vec<Attachment>,
    pub children: Vec<WorkItem>,
}

/// Result of the blocking-findings gate for one item.
#[derive(Debug, Clone, Serialize)]
pub struct BlockingReport {
    pub work_item_id: i64,
    pub blocked: bool,
    pub findings: Vec<Finding>,
}

/// Validate, screen and insert a new work item.
pub async fn create_work_item(
    pool: &SqlitePool,
    guard: &PromptGuard,
    default_complexity: Complexity,
    mut new: NewWorkItem,
) -> HarnessResult<WorkItem> {
    new.title = new.title.trim().to_string();
    if new.title.is_empty() {
        return Err(HarnessError::validation("title must not be empty"));
    }
    if let Some(priority) = new.priority {
        if priority < 0 {
            return Err(HarnessError::validation("priority must not be negative"));
        }
    }
    if let Some(parent) = new.parent_id {
        if get_work_item(pool, parent).await?.is_none() {
            return Err(HarnessError::validation(format!(
                "parent work item {parent} does not exist"
            )));
        }
    }

    let criteria: Vec<String> = new
        .acceptance_criteria
        .iter()
        .enumerate()
        .map(|(i, _)| format!("acceptance_criteria[{i}]"))
        .collect();
    let mut fields: Vec<(&str, &str)> = vec![
        ("title", new.title.as_str()),
        ("body", new.body.as_str()),
        ("body_text", new.body_text.as_str()),
    ];
    for (name, text) in criteria.iter().zip(&new.acceptance_criteria) {
        fields.push((name.as_str(), text.as_str()));
    }
    screen(pool, guard, &fields, None).await?;

    Ok(insert_work_item(pool, &new, default_complexity).await?)
}

/// Apply an operator patch. Any status may be set on an unclaimed item.
pub async fn patch_work_item(
    pool: &SqlitePool,
    guard: &PromptGuard,
    id: i64,
    mut patch: WorkItemPatch,
) -> HarnessResult<WorkItem> {
    if let Some(title) = patch.title.as_mut() {
        *title = title.trim().to_string();
        if title.is_empty() {
            return Err(HarnessError::validation("title must not be empty"));
        }
    }
    if patch.priority.is_some_and(|p| p < 0) {
        return Err(HarnessError::validation("priority must not be negative"));
    }
    if patch.touched_fields().is_empty() {
        return Err(HarnessError::validation("patch sets no fields"));
    }

    let criteria_names: Vec<String> = patch
        .acceptance_criteria
        .iter()
        .flatten()
        .enumerate()
        .map(|(i, _)| format!("acceptance_criteria[{i}]"))
        .collect();
    let mut fields: Vec<(&str, &str)> = Vec::new();
    if let Some(title) = &patch.title {
        fields.push(("title", title.as_str()));
    }
    if let Some(body) = &patch.body {
        fields.push(("body", body.as_str()));
    }
    if let Some(body_text) = &patch.body_text {
        fields.push(("body_text", body_text.as_str()));
    }
    for (name, text) in criteria_names
        .iter()
        .zip(patch.acceptance_criteria.iter().flatten())
    {
        fields.push((name.as_str(), text.as_str()));
    }
    screen(pool, guard, &fields, Some(id)).await?;

    match update_work_item(pool, id, &patch).await? {
        PatchOutcome::Updated(item) => Ok(item),
        PatchOutcome::NotFound => Err(HarnessError::not_found(format!(
            "work item {id} not found"
        ))),
        PatchOutcome::Claimed => Err(HarnessError::Conflict(format!(
            "work item {id} is being dispatched; its status cannot change until the run ends"
        ))),
    }
}

/// Run the guard and record what it found.
async fn screen(
    pool: &SqlitePool,
    guard: &PromptGuard,
    fields: &[(&str, &str)],
    work_item_id: Option<i64>,
) -> HarnessResult<()> {
    let object_id = work_item_id.map(|id| id.to_string());
    match guard.evaluate(fields) {
        GuardVerdict::Clean => Ok(()),
        GuardVerdict::Warned(findings) => {
            let patterns = pattern_names(&findings);
            warn!(patterns = ?patterns, "prompt injection patterns allowed in warn mode");
            insert_event(
                pool,
                "prompt_injection_warning",
                "work_item",
                object_id,
                json!({ "patterns": patterns, "findings": findings }),
            )
            .await?;
            Ok(())
        }
        GuardVerdict::Blocked(findings) => {
            let patterns = pattern_names(&findings);
            warn!(patterns = ?patterns, "blocked work item text with prompt injection patterns");
            insert_event(
                pool,
                "prompt_injection_blocked",
                "work_item",
                object_id,
                json!({ "patterns": patterns, "findings": findings }),
            )
            .await?;
            Err(HarnessError::Security { patterns, findings })
        }
    }
}

pub async fn get_detail(pool: &SqlitePool, id: i64) -> HarnessResult<WorkItemDetail> {
    let item = get_work_item(pool, id)
        .await?
        .ok_or_else(|| HarnessError::not_found(format!("work item {id} not found")))?;
    Ok(WorkItemDetail {
        findings: list_findings_for_work_item(pool, id).await?,
        runs: list_runs_for_work_item(pool, id).await?,
        attachments: list_attachments_for_work_item(pool, id).await?,
        children: list_children(pool, id).await?,
        item,
    })
}

/// The blocking gate as the dispatcher would see it.
pub async fn blocking_report(pool: &SqlitePool, id: i64) -> HarnessResult<BlockingReport> {
    if get_work_item(pool, id).await?.is_none() {
        return Err(HarnessError::not_found(format!("work item {id} not found")));
    }
    let findings = open_blocking_findings_in_subtree(pool, id).await?;
    Ok(BlockingReport {
        work_item_id: id,
        blocked: !findings.is_empty(),
        findings,
    })
}

/// Resolve one finding. Resolving a resolved finding returns it unchanged.
pub async fn resolve_finding(pool: &SqlitePool, id: i64) -> HarnessResult<Finding> {
    if get_finding(pool, id).await?.is_none() {
        return Err(HarnessError::not_found(format!("finding {id} not found")));
    }
    resolve_finding_row(pool, id)
        .await?
        .ok_or_else(|| HarnessError::not_found(format!("finding {id} not found")))
}
