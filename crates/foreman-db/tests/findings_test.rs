//! Integration tests for findings and the blocking-findings gate.

use foreman_db::models::{Complexity, FindingStatus, Severity, WorkItemKind};
use foreman_db::queries::findings::{self, NewFinding};
use foreman_db::queries::work_items::{self, NewWorkItem};
use foreman_test_utils::{create_test_db, drop_test_db};
use sqlx::SqlitePool;

async fn item(pool: &SqlitePool, title: &str, parent: Option<i64>) -> i64 {
    let mut new = NewWorkItem::new(WorkItemKind::Task, title);
    new.parent_id = parent;
    work_items::insert_work_item(pool, &new, Complexity::Simple)
        .await
        .unwrap()
        .id
}

fn finding(work_item_id: i64, blocking: bool) -> NewFinding {
    NewFinding {
        work_item_id,
        run_id: None,
        severity: Severity::High,
        title: "broken".into(),
        details: String::new(),
        blocking,
    }
}

#[tokio::test]
async fn gate_is_false_without_findings() {
    let (pool, dir) = create_test_db().await;
    let root = item(&pool, "root", None).await;

    assert!(!findings::has_open_blocking_findings(&pool, root).await.unwrap());

    drop_test_db(pool, dir).await;
}

#[tokio::test]
async fn gate_sees_blocking_findings_on_root_and_descendants() {
    let (pool, dir) = create_test_db().await;
    let root = item(&pool, "root", None).await;
    let child = item(&pool, "child", Some(root)).await;
    let grandchild = item(&pool, "grandchild", Some(child)).await;
    let sibling = item(&pool, "unrelated", None).await;

    findings::insert_finding(&pool, &finding(grandchild, true)).await.unwrap();

    assert!(findings::has_open_blocking_findings(&pool, root).await.unwrap());
    assert!(findings::has_open_blocking_findings(&pool, child).await.unwrap());
    assert!(findings::has_open_blocking_findings(&pool, grandchild).await.unwrap());
    assert!(!findings::has_open_blocking_findings(&pool, sibling).await.unwrap());

    drop_test_db(pool, dir).await;
}

#[tokio::test]
async fn advisory_findings_do_not_block() {
    let (pool, dir) = create_test_db().await;
    let root = item(&pool, "root", None).await;

    findings::insert_finding(&pool, &finding(root, false)).await.unwrap();
    assert!(!findings::has_open_blocking_findings(&pool, root).await.unwrap());

    drop_test_db(pool, dir).await;
}

#[tokio::test]
async fn resolving_last_blocker_opens_the_gate() {
    let (pool, dir) = create_test_db().await;
    let root = item(&pool, "root", None).await;
    let child = item(&pool, "child", Some(root)).await;

    let a = findings::insert_finding(&pool, &finding(root, true)).await.unwrap();
    let b = findings::insert_finding(&pool, &finding(child, true)).await.unwrap();

    findings::resolve_finding(&pool, a.id).await.unwrap();
    assert!(findings::has_open_blocking_findings(&pool, root).await.unwrap());

    let resolved = findings::resolve_finding(&pool, b.id).await.unwrap().unwrap();
    assert_eq!(resolved.status, FindingStatus::Resolved);
    assert!(resolved.resolved_at.is_some());
    assert!(!findings::has_open_blocking_findings(&pool, root).await.unwrap());

    drop_test_db(pool, dir).await;
}

#[tokio::test]
async fn resolve_by_child_only_touches_linked_findings() {
    let (pool, dir) = create_test_db().await;
    let parent = item(&pool, "parent", None).await;
    let remediation = item(&pool, "fix it", Some(parent)).await;

    let linked = findings::insert_finding(&pool, &finding(parent, true)).await.unwrap();
    findings::link_child_work_item(&pool, linked.id, remediation).await.unwrap();
    let unlinked = findings::insert_finding(&pool, &finding(parent, true)).await.unwrap();

    let resolved = findings::resolve_findings_by_child_work_item(&pool, remediation)
        .await
        .unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].id, linked.id);
    assert!(resolved[0].resolved_at.is_some());

    let still_open = findings::get_finding(&pool, unlinked.id).await.unwrap().unwrap();
    assert_eq!(still_open.status, FindingStatus::Open);
    assert!(findings::has_open_blocking_findings(&pool, parent).await.unwrap());

    // A second call finds nothing left to resolve.
    let again = findings::resolve_findings_by_child_work_item(&pool, remediation)
        .await
        .unwrap();
    assert!(again.is_empty());

    drop_test_db(pool, dir).await;
}
