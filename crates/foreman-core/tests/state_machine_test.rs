//! Work item state machine against a real database.

use foreman_core::state::{WorkItemStateMachine, dispatch, release_unblocked_work_items};
use foreman_db::models::{
    Complexity, RunStatus, Severity, Stage, WorkItemKind, WorkItemStatus,
};
use foreman_db::queries::events::count_events_of_type;
use foreman_db::queries::findings::{NewFinding, insert_finding, resolve_finding};
use foreman_db::queries::runs::{finish_run, insert_run};
use foreman_db::queries::work_items::{
    NewWorkItem, claim_next_work_item, get_work_item, insert_work_item,
};
use foreman_test_utils::create_test_db;

async fn item(pool: &sqlx::SqlitePool, title: &str) -> i64 {
    insert_work_item(pool, &NewWorkItem::new(WorkItemKind::Task, title), Complexity::Simple)
        .await
        .unwrap()
        .id
}

async fn status(pool: &sqlx::SqlitePool, id: i64) -> WorkItemStatus {
    get_work_item(pool, id).await.unwrap().unwrap().status
}

async fn blocking_finding(pool: &sqlx::SqlitePool, work_item_id: i64) -> i64 {
    insert_finding(
        pool,
        &NewFinding {
            work_item_id,
            run_id: None,
            severity: Severity::High,
            title: "tests fail".into(),
            details: String::new(),
            blocking: true,
        },
    )
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn happy_path_walks_the_pipeline() {
    let (pool, _dir) = create_test_db().await;
    let id = item(&pool, "walk").await;

    let claimed = claim_next_work_item(&pool).await.unwrap().unwrap();
    assert_eq!(claimed.previous_status, WorkItemStatus::New);
    dispatch::finish_plan(&pool, id).await.unwrap();
    assert_eq!(status(&pool, id).await, WorkItemStatus::Planned);

    claim_next_work_item(&pool).await.unwrap().unwrap();
    dispatch::begin_execute(&pool, id).await.unwrap();
    dispatch::begin_verify(&pool, id).await.unwrap();
    dispatch::complete(&pool, id).await.unwrap();

    let done = get_work_item(&pool, id).await.unwrap().unwrap();
    assert_eq!(done.status, WorkItemStatus::Completed);
    assert!(done.closed_at.is_some());
    assert!(claim_next_work_item(&pool).await.unwrap().is_none());
}

#[tokio::test]
async fn stale_from_status_is_rejected() {
    let (pool, _dir) = create_test_db().await;
    let id = item(&pool, "stale").await;

    let err = WorkItemStateMachine::transition(
        &pool,
        id,
        WorkItemStatus::Triaged,
        WorkItemStatus::Planned,
        None,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("expected triaged"), "{err}");
    assert_eq!(status(&pool, id).await, WorkItemStatus::New);
}

#[tokio::test]
async fn invalid_edge_is_rejected_before_touching_the_row() {
    let (pool, _dir) = create_test_db().await;
    let id = item(&pool, "skip").await;
    let err = WorkItemStateMachine::transition(
        &pool,
        id,
        WorkItemStatus::New,
        WorkItemStatus::Completed,
        None,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("invalid state transition"), "{err}");
}

#[tokio::test]
async fn transitions_are_recorded_as_events() {
    let (pool, _dir) = create_test_db().await;
    let id = item(&pool, "evented").await;
    claim_next_work_item(&pool).await.unwrap();
    dispatch::park(&pool, id, WorkItemStatus::Triaged, WorkItemStatus::NeedsInput, "no profile")
        .await
        .unwrap();
    assert!(count_events_of_type(&pool, "work_item_transition").await.unwrap() >= 1);
}

#[tokio::test]
async fn blocked_item_is_released_once_findings_resolve() {
    let (pool, _dir) = create_test_db().await;
    let id = item(&pool, "blocked").await;
    claim_next_work_item(&pool).await.unwrap();
    let finding = blocking_finding(&pool, id).await;
    dispatch::park(&pool, id, WorkItemStatus::Triaged, WorkItemStatus::Blocked, "gate")
        .await
        .unwrap();

    assert!(release_unblocked_work_items(&pool).await.unwrap().is_empty());
    assert_eq!(status(&pool, id).await, WorkItemStatus::Blocked);

    resolve_finding(&pool, finding).await.unwrap();
    assert_eq!(release_unblocked_work_items(&pool).await.unwrap(), vec![id]);
    assert_eq!(status(&pool, id).await, WorkItemStatus::Triaged);
}

#[tokio::test]
async fn released_item_skips_plan_when_it_already_passed() {
    let (pool, _dir) = create_test_db().await;
    let id = item(&pool, "planned before").await;
    let run = insert_run(&pool, id, Stage::Plan, None, 1, |id| {
        (format!("/tmp/run-{id}.log"), format!("/tmp/run-{id}"))
    })
    .await
    .unwrap();
    finish_run(&pool, run.id, RunStatus::Passed, Some(0), None).await.unwrap();

    claim_next_work_item(&pool).await.unwrap();
    dispatch::park(&pool, id, WorkItemStatus::Triaged, WorkItemStatus::Blocked, "gate")
        .await
        .unwrap();
    assert_eq!(release_unblocked_work_items(&pool).await.unwrap(), vec![id]);
    assert_eq!(status(&pool, id).await, WorkItemStatus::Planned);
}
