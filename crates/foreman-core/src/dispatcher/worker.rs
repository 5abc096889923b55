//! Processing of one claimed work item.

use anyhow::Result;
use serde_json::json;
use tracing::{error, info, warn};

use foreman_db::models::{RunStatus, Severity, Stage, WorkItem, WorkItemKind, WorkItemStatus};
use foreman_db::queries::attachments::list_attachments_for_work_item;
use foreman_db::queries::events::insert_event;
use foreman_db::queries::findings::{
    NewFinding, insert_finding, link_child_work_item, list_open_findings_for_work_item,
    open_blocking_findings_in_subtree, resolve_findings_by_child_work_item,
};
use foreman_db::queries::profiles::{get_execution_profile, get_mcp_profile, get_skill_profile};
use foreman_db::queries::work_items::{
    ClaimedWorkItem, NewWorkItem, ancestor_depth, get_work_item, insert_work_item, release_claim,
};

use super::DispatchContext;
use crate::error::HarnessError;
use crate::executor::{StageOutcome, StageRequest};
use crate::prompt::{PromptContext, build_stage_prompt};
use crate::state::{WorkItemStateMachine, dispatch};

/// How a single stage ended for the pipeline.
enum StageEnd {
    Passed,
    /// The item was parked (`needs_input`, `blocked` or `failed`).
    Parked,
}

/// Drive a claimed item through the stage its pre-claim status calls for.
///
/// `new`/`triaged` run plan; `planned` runs execute then test.
pub(crate) async fn process_claimed(ctx: &DispatchContext, claimed: &ClaimedWorkItem) -> Result<()> {
    let pool = &ctx.pool;
    let item = &claimed.item;

    let blocking = open_blocking_findings_in_subtree(pool, item.id).await?;
    if !blocking.is_empty() {
        let ids: Vec<i64> = blocking.iter().map(|f| f.id).collect();
        dispatch::park(
            pool,
            item.id,
            WorkItemStatus::Triaged,
            WorkItemStatus::Blocked,
            "open blocking findings in subtree",
        )
        .await?;
        insert_event(
            pool,
            "work_item_blocked",
            "work_item",
            Some(item.id.to_string()),
            json!({ "finding_ids": ids }),
        )
        .await?;
        info!(work_item_id = item.id, findings = ?ids, "work item blocked by open findings");
        return Ok(());
    }

    match claimed.previous_status {
        WorkItemStatus::Planned => {
            dispatch::begin_execute(pool, item.id).await?;
            if let StageEnd::Parked =
                run_stage(ctx, item, Stage::Execute, WorkItemStatus::Executing).await?
            {
                return Ok(());
            }
            dispatch::begin_verify(pool, item.id).await?;
            if let StageEnd::Parked =
                run_stage(ctx, item, Stage::Test, WorkItemStatus::Verifying).await?
            {
                return Ok(());
            }
            dispatch::complete(pool, item.id).await?;
            let resolved = resolve_findings_by_child_work_item(pool, item.id).await?;
            info!(
                work_item_id = item.id,
                resolved_findings = resolved.len(),
                "work item completed"
            );
        }
        _ => {
            if let StageEnd::Parked =
                run_stage(ctx, item, Stage::Plan, WorkItemStatus::Triaged).await?
            {
                return Ok(());
            }
            dispatch::finish_plan(pool, item.id).await?;
            info!(work_item_id = item.id, "work item planned");
        }
    }
    Ok(())
}

/// Resolve routing for `stage`, run it and park the item on anything but
/// success. `status` is the item's status while the stage runs.
async fn run_stage(
    ctx: &DispatchContext,
    item: &WorkItem,
    stage: Stage,
    status: WorkItemStatus,
) -> Result<StageEnd> {
    let pool = &ctx.pool;

    let Some(profile) = get_execution_profile(pool, item.complexity, stage).await? else {
        let reason = format!(
            "no execution profile for complexity {} and stage {stage}",
            item.complexity
        );
        park_needs_input(ctx, item.id, status, &reason).await?;
        return Ok(StageEnd::Parked);
    };

    let Some(adapter) = ctx.registry.get(&profile.agent) else {
        let reason = format!("execution profile names unknown agent {}", profile.agent);
        park_needs_input(ctx, item.id, status, &reason).await?;
        return Ok(StageEnd::Parked);
    };

    if let Err(e) = ctx
        .executor
        .auth()
        .preflight(adapter.as_ref(), profile.auth_mode, profile.runtime)
        .await
    {
        match e {
            HarnessError::Auth { message, hint } => {
                let reason = match hint {
                    Some(hint) => format!("{message} (hint: {hint})"),
                    None => message,
                };
                park_needs_input(ctx, item.id, status, &reason).await?;
                return Ok(StageEnd::Parked);
            }
            other => return Err(other.into()),
        }
    }

    let open_findings = list_open_findings_for_work_item(pool, item.id).await?;
    let attachments = list_attachments_for_work_item(pool, item.id).await?;
    let skill = match &profile.skill_profile {
        Some(name) => get_skill_profile(pool, name).await?,
        None => None,
    };
    let mcp = match &profile.mcp_profile {
        Some(name) => get_mcp_profile(pool, name).await?,
        None => None,
    };
    let prompt = build_stage_prompt(&PromptContext {
        stage,
        item,
        open_findings: &open_findings,
        attachments: &attachments,
        skill: skill.as_ref(),
    });

    let outcome = ctx
        .executor
        .run_stage(StageRequest {
            item,
            stage,
            profile: &profile,
            adapter: adapter.as_ref(),
            prompt: &prompt,
            mcp: mcp.as_ref(),
        })
        .await?;

    match outcome.status {
        RunStatus::Passed => Ok(StageEnd::Passed),
        RunStatus::NeedsInput => {
            let reason = outcome
                .error_text
                .clone()
                .unwrap_or_else(|| format!("{stage} run needs input"));
            park_needs_input(ctx, item.id, status, &reason).await?;
            Ok(StageEnd::Parked)
        }
        RunStatus::Failed | RunStatus::Running => {
            apply_failure_policy(ctx, item, stage, status, &outcome).await?;
            Ok(StageEnd::Parked)
        }
    }
}

async fn park_needs_input(
    ctx: &DispatchContext,
    id: i64,
    from: WorkItemStatus,
    reason: &str,
) -> Result<()> {
    dispatch::park(&ctx.pool, id, from, WorkItemStatus::NeedsInput, reason).await?;
    warn!(work_item_id = id, reason, "work item needs input");
    Ok(())
}

/// Record a finding for the failed stage and park the item.
async fn apply_failure_policy(
    ctx: &DispatchContext,
    item: &WorkItem,
    stage: Stage,
    status: WorkItemStatus,
    outcome: &StageOutcome,
) -> Result<()> {
    let pool = &ctx.pool;
    let policy = &ctx.config.failure_policy;
    let blocking = policy.is_blocking(stage, outcome.timed_out);
    let error_text = outcome
        .error_text
        .clone()
        .unwrap_or_else(|| "stage failed".to_string());

    let finding = insert_finding(
        pool,
        &NewFinding {
            work_item_id: item.id,
            run_id: outcome.last_run_id,
            severity: if blocking {
                Severity::High
            } else {
                Severity::Medium
            },
            title: format!("{stage} stage failed"),
            details: format!("{error_text} after {} attempt(s)", outcome.attempts),
            blocking,
        },
    )
    .await?;

    if blocking {
        let depth = ancestor_depth(pool, item.id).await?;
        if policy.may_remediate(depth) {
            let child = spawn_remediation(ctx, item, stage, &error_text).await?;
            link_child_work_item(pool, finding.id, child.id).await?;
            insert_event(
                pool,
                "remediation_spawned",
                "work_item",
                Some(item.id.to_string()),
                json!({ "finding_id": finding.id, "child_work_item_id": child.id }),
            )
            .await?;
            info!(
                work_item_id = item.id,
                child_work_item_id = child.id,
                "spawned remediation task"
            );
        }
    }

    let to = if blocking {
        WorkItemStatus::Blocked
    } else {
        WorkItemStatus::Failed
    };
    dispatch::park(pool, item.id, status, to, &error_text).await?;
    warn!(work_item_id = item.id, %stage, to = %to, "stage failed");
    Ok(())
}

async fn spawn_remediation(
    ctx: &DispatchContext,
    item: &WorkItem,
    stage: Stage,
    error_text: &str,
) -> Result<WorkItem> {
    let mut new = NewWorkItem::new(
        WorkItemKind::Task,
        format!("Remediate {stage} failure: {}", item.title),
    );
    new.body = format!(
        "The {stage} stage of work item #{} failed: {error_text}\n\n\
         Fix the underlying problem so the parent can proceed.",
        item.id
    );
    new.priority = Some(item.priority);
    new.severity = Some(Severity::High);
    new.complexity = Some(item.complexity);
    new.project_path = item.project_path.clone();
    new.parent_id = Some(item.id);
    new.acceptance_criteria = item.acceptance_criteria.0.clone();
    insert_work_item(&ctx.pool, &new, ctx.config.default_complexity).await
}

/// Convert a worker error into item state plus a `dispatch_error` event.
pub(crate) async fn handle_worker_error(ctx: &DispatchContext, id: i64, err: &anyhow::Error) {
    let message = format!("{err:#}");
    error!(work_item_id = id, error = %message, "dispatch failed");

    if let Err(e) = insert_event(
        &ctx.pool,
        "dispatch_error",
        "work_item",
        Some(id.to_string()),
        json!({ "error": message }),
    )
    .await
    {
        error!(work_item_id = id, error = %e, "failed to record dispatch error");
    }

    match get_work_item(&ctx.pool, id).await {
        Ok(Some(item)) if !item.status.is_terminal() => {
            let parked = WorkItemStateMachine::transition(
                &ctx.pool,
                id,
                item.status,
                WorkItemStatus::Failed,
                Some(&message),
            )
            .await;
            if let Err(e) = parked {
                error!(work_item_id = id, error = %e, "failed to mark work item failed");
                let _ = release_claim(&ctx.pool, id).await;
            }
        }
        Ok(Some(_)) => {
            let _ = release_claim(&ctx.pool, id).await;
        }
        Ok(None) => {}
        Err(e) => error!(work_item_id = id, error = %e, "failed to reload work item"),
    }
}
