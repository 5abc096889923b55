//! One-way file mirror of the work queue.
//!
//! `<queue_dir>/queue.json` holds every work item plus per-status counts.
//! The file is replaced atomically (write to a sibling temp file, then
//! rename). The store stays authoritative; nothing reads it back.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use foreman_db::models::{WorkItem, WorkItemStatus};
use foreman_db::queries::work_items::list_work_items;

#[derive(Serialize)]
struct QueueFile<'a> {
    generated_at: chrono::DateTime<Utc>,
    counts: BTreeMap<&'static str, usize>,
    items: &'a [WorkItem],
}

/// Rewrite the projection from the store.
pub async fn refresh_projection(pool: &SqlitePool, queue_dir: &Path) -> Result<()> {
    let items = list_work_items(pool, None).await?;

    tokio::fs::create_dir_all(queue_dir)
        .await
        .with_context(|| format!("failed to create queue dir {}", queue_dir.display()))?;

    let mut counts = BTreeMap::new();
    for status in WorkItemStatus::ALL {
        counts.insert(
            status.as_str(),
            items.iter().filter(|i| i.status == *status).count(),
        );
    }
    let json = serde_json::to_vec_pretty(&QueueFile {
        generated_at: Utc::now(),
        counts,
        items: &items,
    })
    .context("failed to serialize queue projection")?;
    write_atomic(&queue_dir.join("queue.json"), &json).await?;

    debug!(items = items.len(), dir = %queue_dir.display(), "queue projection refreshed");
    Ok(())
}

/// [`refresh_projection`], logging instead of failing.
pub async fn refresh_projection_best_effort(pool: &SqlitePool, queue_dir: &Path) {
    if let Err(e) = refresh_projection(pool, queue_dir).await {
        warn!(error = %format!("{e:#}"), "failed to refresh queue projection");
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    tokio::fs::write(&temp, content)
        .await
        .with_context(|| format!("failed to write {}", temp.display()))?;
    tokio::fs::rename(&temp, path)
        .await
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
