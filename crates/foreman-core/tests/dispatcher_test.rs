//! Dispatcher scenarios driven through `tick()` with `sh -c` adapters.

mod common;

use std::sync::Arc;

use foreman_core::dispatcher::Dispatcher;
use foreman_db::models::{
    Complexity, FindingStatus, RunStatus, Severity, Stage, WorkItemKind, WorkItemStatus,
};
use foreman_db::queries::events::count_events_of_type;
use foreman_db::queries::findings::{
    NewFinding, insert_finding, list_findings_for_work_item,
};
use foreman_db::queries::profiles::{ProfileSet, get_execution_profile, upsert_profiles};
use foreman_db::queries::runs::list_runs_for_work_item;
use foreman_core::workitems::patch_work_item;
use foreman_db::queries::work_items::{
    NewWorkItem, WorkItemPatch, claim_next_work_item, get_work_item, insert_work_item,
    list_children, release_claim,
};

use common::{ShAdapter, harness, harness_with, profile, route_all_stages};

async fn new_item(pool: &sqlx::SqlitePool, title: &str) -> i64 {
    insert_work_item(pool, &NewWorkItem::new(WorkItemKind::Task, title), Complexity::Simple)
        .await
        .expect("insert")
        .id
}

async fn status_of(pool: &sqlx::SqlitePool, id: i64) -> WorkItemStatus {
    get_work_item(pool, id).await.unwrap().unwrap().status
}

async fn tick_and_wait(dispatcher: &Arc<Dispatcher>) -> usize {
    let spawned = dispatcher.tick().await.expect("tick");
    dispatcher.wait_idle().await;
    spawned
}

#[tokio::test]
async fn item_moves_through_plan_execute_test() {
    let h = harness(ShAdapter::passing()).await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let id = new_item(pool, "add a flag").await;
    let d = &h.foreman.dispatcher;

    assert_eq!(tick_and_wait(d).await, 1);
    assert_eq!(status_of(pool, id).await, WorkItemStatus::Planned);

    assert_eq!(tick_and_wait(d).await, 1);
    let item = get_work_item(pool, id).await.unwrap().unwrap();
    assert_eq!(item.status, WorkItemStatus::Completed);
    assert!(item.closed_at.is_some());
    assert!(item.claimed_at.is_none());

    let runs = list_runs_for_work_item(pool, id).await.unwrap();
    let stages: Vec<Stage> = runs.iter().map(|r| r.stage).collect();
    assert_eq!(stages, vec![Stage::Plan, Stage::Execute, Stage::Test]);
    assert!(runs.iter().all(|r| r.status == RunStatus::Passed));

    let artifacts = h.foreman.config.artifacts_dir.join(format!("run-{}", runs[0].id));
    assert!(artifacts.join("prompt.md").is_file());
    assert!(artifacts.join("result.json").is_file());
    let queue: serde_json::Value = serde_json::from_slice(
        &std::fs::read(h.foreman.config.queue_dir.join("queue.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(queue["items"][0]["id"], id);

    assert_eq!(tick_and_wait(d).await, 0);
}

#[tokio::test]
async fn story_is_claimed_routed_and_planned() {
    let h = harness(ShAdapter::passing()).await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let mut story = NewWorkItem::new(WorkItemKind::Story, "X");
    story.priority = Some(3);
    let id = insert_work_item(pool, &story, Complexity::Simple).await.unwrap().id;

    let claimed = claim_next_work_item(pool).await.unwrap().unwrap();
    assert_eq!(claimed.item.id, id);
    assert_eq!(claimed.item.status, WorkItemStatus::Triaged);
    assert_eq!(claimed.previous_status, WorkItemStatus::New);
    let profile = get_execution_profile(pool, Complexity::Simple, Stage::Plan)
        .await
        .unwrap()
        .expect("plan profile");
    assert_eq!(profile.agent, "fake");
    release_claim(pool, id).await.unwrap();

    let accepted = h.foreman.dispatcher.dispatch_now(id).await.unwrap();
    assert_eq!(accepted.stage, Stage::Plan);
    h.foreman.dispatcher.wait_idle().await;

    let runs = list_runs_for_work_item(pool, id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].stage, Stage::Plan);
    assert_eq!(runs[0].status, RunStatus::Passed);
    assert_eq!(status_of(pool, id).await, WorkItemStatus::Planned);
}

#[tokio::test]
async fn missing_profile_parks_item_as_needs_input() {
    let h = harness(ShAdapter::passing()).await;
    let pool = h.pool();
    let id = new_item(pool, "no routing").await;

    tick_and_wait(&h.foreman.dispatcher).await;
    assert_eq!(status_of(pool, id).await, WorkItemStatus::NeedsInput);
    assert!(list_runs_for_work_item(pool, id).await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_credentials_park_item_before_any_run() {
    let h = harness(ShAdapter::passing()).await;
    let pool = h.pool();
    let mut plan = profile(Stage::Plan, 10, 0);
    plan.auth_mode = foreman_db::models::AuthMode::ApiKey;
    upsert_profiles(pool, &ProfileSet { execution: vec![plan], ..ProfileSet::default() })
        .await
        .unwrap();
    let id = new_item(pool, "needs a key").await;

    tick_and_wait(&h.foreman.dispatcher).await;
    assert_eq!(status_of(pool, id).await, WorkItemStatus::NeedsInput);
    assert!(list_runs_for_work_item(pool, id).await.unwrap().is_empty());
}

#[tokio::test]
async fn interactive_prompt_marks_run_needs_input() {
    let h = harness(ShAdapter::new(
        "echo 'Please run /login' >&2; exit 1",
        "exit 0",
        "exit 0",
    ))
    .await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let id = new_item(pool, "login wall").await;

    tick_and_wait(&h.foreman.dispatcher).await;
    assert_eq!(status_of(pool, id).await, WorkItemStatus::NeedsInput);
    let runs = list_runs_for_work_item(pool, id).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::NeedsInput);
}

#[tokio::test]
async fn plan_failure_is_not_blocking() {
    let h = harness(ShAdapter::new("exit 3", "exit 0", "exit 0")).await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let id = new_item(pool, "bad plan").await;

    tick_and_wait(&h.foreman.dispatcher).await;
    assert_eq!(status_of(pool, id).await, WorkItemStatus::Failed);

    let runs = list_runs_for_work_item(pool, id).await.unwrap();
    assert_eq!(runs[0].exit_code, Some(3));
    let findings = list_findings_for_work_item(pool, id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert!(!findings[0].blocking);
    assert_eq!(findings[0].run_id, Some(runs[0].id));
    assert!(list_children(pool, id).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_runs_are_retried() {
    let h = harness(ShAdapter::new("exit 1", "exit 0", "exit 0")).await;
    let pool = h.pool();
    upsert_profiles(
        pool,
        &ProfileSet {
            execution: vec![profile(Stage::Plan, 10, 2)],
            ..ProfileSet::default()
        },
    )
    .await
    .unwrap();
    let id = new_item(pool, "flaky").await;

    tick_and_wait(&h.foreman.dispatcher).await;
    let runs = list_runs_for_work_item(pool, id).await.unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(
        runs.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test]
async fn timeout_kills_run_and_blocks_item() {
    let h = harness_with(ShAdapter::new("sleep 30", "exit 0", "exit 0"), |c| {
        c.failure_policy.spawn_remediation = false;
    })
    .await;
    let pool = h.pool();
    upsert_profiles(
        pool,
        &ProfileSet {
            execution: vec![profile(Stage::Plan, 1, 0)],
            ..ProfileSet::default()
        },
    )
    .await
    .unwrap();
    let id = new_item(pool, "hangs").await;

    let started = std::time::Instant::now();
    tick_and_wait(&h.foreman.dispatcher).await;
    assert!(started.elapsed() < std::time::Duration::from_secs(20));

    let runs = list_runs_for_work_item(pool, id).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].error_text.as_deref().unwrap().contains("timed out after 1s"));

    assert_eq!(status_of(pool, id).await, WorkItemStatus::Blocked);
    let findings = list_findings_for_work_item(pool, id).await.unwrap();
    assert!(findings[0].blocking);
    assert!(list_children(pool, id).await.unwrap().is_empty());
}

#[tokio::test]
async fn remediation_child_unblocks_parent() {
    // Execute fails the first time it runs and passes afterwards.
    let execute = "if [ -f .attempted ]; then exit 0; else touch .attempted; exit 1; fi";
    let h = harness(ShAdapter::new("exit 0", execute, "exit 0")).await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let parent = new_item(pool, "parent").await;
    let d = &h.foreman.dispatcher;

    tick_and_wait(d).await;
    assert_eq!(status_of(pool, parent).await, WorkItemStatus::Planned);

    tick_and_wait(d).await;
    assert_eq!(status_of(pool, parent).await, WorkItemStatus::Blocked);
    let findings = list_findings_for_work_item(pool, parent).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert!(findings[0].blocking);
    let children = list_children(pool, parent).await.unwrap();
    assert_eq!(children.len(), 1);
    let child = children[0].id;
    assert_eq!(findings[0].child_work_item_id, Some(child));
    assert_eq!(count_events_of_type(pool, "remediation_spawned").await.unwrap(), 1);

    tick_and_wait(d).await;
    assert_eq!(status_of(pool, child).await, WorkItemStatus::Planned);
    assert_eq!(status_of(pool, parent).await, WorkItemStatus::Blocked);

    tick_and_wait(d).await;
    assert_eq!(status_of(pool, child).await, WorkItemStatus::Completed);
    let findings = list_findings_for_work_item(pool, parent).await.unwrap();
    assert_eq!(findings[0].status, FindingStatus::Resolved);

    tick_and_wait(d).await;
    assert_eq!(status_of(pool, parent).await, WorkItemStatus::Completed);
}

#[tokio::test]
async fn open_blocking_finding_in_subtree_blocks_parent() {
    let h = harness(ShAdapter::passing()).await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let parent = new_item(pool, "parent").await;
    let mut child = NewWorkItem::new(WorkItemKind::Finding, "child");
    child.parent_id = Some(parent);
    child.priority = Some(9);
    let child = insert_work_item(pool, &child, Complexity::Simple).await.unwrap();
    let finding = insert_finding(
        pool,
        &NewFinding {
            work_item_id: child.id,
            run_id: None,
            severity: Severity::High,
            title: "broken".into(),
            details: String::new(),
            blocking: true,
        },
    )
    .await
    .unwrap();

    let report = foreman_core::workitems::blocking_report(pool, parent).await.unwrap();
    assert!(report.blocked);
    assert_eq!(report.findings[0].id, finding.id);

    // max_parallel_runs = 2, so parent and child are both claimed.
    tick_and_wait(&h.foreman.dispatcher).await;
    assert_eq!(status_of(pool, parent).await, WorkItemStatus::Blocked);
    assert_eq!(status_of(pool, child.id).await, WorkItemStatus::Blocked);

    foreman_core::workitems::resolve_finding(pool, finding.id).await.unwrap();
    tick_and_wait(&h.foreman.dispatcher).await;
    assert_eq!(status_of(pool, parent).await, WorkItemStatus::Planned);
}

#[tokio::test]
async fn parallelism_cap_limits_claims() {
    let h = harness_with(ShAdapter::new("sleep 1", "exit 0", "exit 0"), |c| {
        c.max_parallel_runs = 1;
    })
    .await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let first = new_item(pool, "first").await;
    let second = new_item(pool, "second").await;
    let d = &h.foreman.dispatcher;

    assert_eq!(d.tick().await.unwrap(), 1);
    assert_eq!(d.status().await.in_flight, 1);
    let err = d.dispatch_now(second).await.unwrap_err();
    assert!(matches!(err, foreman_core::HarnessError::Conflict(_)));
    d.wait_idle().await;

    assert_eq!(status_of(pool, first).await, WorkItemStatus::Planned);
    assert_eq!(status_of(pool, second).await, WorkItemStatus::New);
}

#[tokio::test]
async fn operator_status_patch_cannot_requeue_an_item_in_flight() {
    let h = harness_with(ShAdapter::new("sleep 1", "sleep 1", "exit 0"), |c| {
        c.max_parallel_runs = 4;
    })
    .await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let id = new_item(pool, "long plan").await;
    let d = &h.foreman.dispatcher;
    let requeue = || WorkItemPatch {
        status: Some(WorkItemStatus::Triaged),
        ..WorkItemPatch::default()
    };

    assert_eq!(d.tick().await.unwrap(), 1);
    let err = patch_work_item(pool, &h.foreman.guard, id, requeue())
        .await
        .unwrap_err();
    assert!(matches!(err, foreman_core::HarnessError::Conflict(_)), "{err:?}");
    assert_eq!(d.tick().await.unwrap(), 0);
    d.wait_idle().await;
    assert_eq!(status_of(pool, id).await, WorkItemStatus::Planned);

    // Executing holds the claim too.
    assert_eq!(d.tick().await.unwrap(), 1);
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(status_of(pool, id).await, WorkItemStatus::Executing);
    assert!(patch_work_item(pool, &h.foreman.guard, id, requeue()).await.is_err());
    assert_eq!(d.tick().await.unwrap(), 0);
    d.wait_idle().await;

    let runs = list_runs_for_work_item(pool, id).await.unwrap();
    let stages: Vec<Stage> = runs.iter().map(|r| r.stage).collect();
    assert_eq!(stages, vec![Stage::Plan, Stage::Execute, Stage::Test]);
    assert_eq!(status_of(pool, id).await, WorkItemStatus::Completed);
}

#[tokio::test]
async fn force_dispatch_requeues_failed_item() {
    let h = harness(ShAdapter::new("exit 1", "exit 0", "exit 0")).await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let id = new_item(pool, "retry me").await;
    let d = &h.foreman.dispatcher;

    tick_and_wait(d).await;
    assert_eq!(status_of(pool, id).await, WorkItemStatus::Failed);

    let accepted = d.dispatch_now(id).await.unwrap();
    assert_eq!(accepted.stage, Stage::Plan);
    assert_eq!(accepted.previous_status, WorkItemStatus::Triaged);
    d.wait_idle().await;
    assert_eq!(list_runs_for_work_item(pool, id).await.unwrap().len(), 2);
    assert_eq!(count_events_of_type(pool, "dispatch_forced").await.unwrap(), 1);
}

#[tokio::test]
async fn force_dispatch_rejects_completed_and_unknown_items() {
    let h = harness(ShAdapter::passing()).await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let id = new_item(pool, "done soon").await;
    let d = &h.foreman.dispatcher;
    tick_and_wait(d).await;
    tick_and_wait(d).await;

    assert!(matches!(
        d.dispatch_now(id).await.unwrap_err(),
        foreman_core::HarnessError::Conflict(_)
    ));
    assert!(matches!(
        d.dispatch_now(9999).await.unwrap_err(),
        foreman_core::HarnessError::NotFound(_)
    ));
}

#[tokio::test]
async fn loop_start_stop_is_idempotent() {
    let h = harness(ShAdapter::passing()).await;
    let pool = h.pool();
    route_all_stages(pool).await;
    let id = new_item(pool, "looped").await;
    let d = &h.foreman.dispatcher;

    assert!(d.start().await.unwrap().running);
    assert!(d.start().await.unwrap().running);

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(20);
    while status_of(pool, id).await != WorkItemStatus::Completed {
        assert!(std::time::Instant::now() < deadline, "loop did not finish the item");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    let status = d.stop().await.unwrap();
    assert!(!status.running);
    assert!(status.ticks > 0);
    assert!(!d.stop().await.unwrap().running);
    assert_eq!(count_events_of_type(pool, "loop_started").await.unwrap(), 1);
}

#[tokio::test]
async fn stored_api_key_reaches_the_agent_environment() {
    let h = harness(ShAdapter::new(
        "[ \"$FAKE_API_KEY\" = \"sk-live\" ]",
        "exit 0",
        "exit 0",
    ))
    .await;
    let pool = h.pool();
    let mut plan = profile(Stage::Plan, 10, 0);
    plan.auth_mode = foreman_db::models::AuthMode::ApiKey;
    upsert_profiles(pool, &ProfileSet { execution: vec![plan], ..ProfileSet::default() })
        .await
        .unwrap();
    h.foreman
        .broker
        .store_credential(foreman_db::models::Provider::Claude, "sk-live")
        .await
        .unwrap();
    let id = new_item(pool, "keyed").await;

    tick_and_wait(&h.foreman.dispatcher).await;
    assert_eq!(status_of(pool, id).await, WorkItemStatus::Planned);
    assert_eq!(count_events_of_type(pool, "runtime_grant_consumed").await.unwrap(), 1);

    let run = &list_runs_for_work_item(pool, id).await.unwrap()[0];
    let log = std::fs::read_to_string(run.log_path.as_deref().unwrap()).unwrap();
    assert!(!log.contains("sk-live"));
}
