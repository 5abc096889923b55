//! Database query functions for the append-only `harness_events` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::types::Json;
use sqlx::{SqliteExecutor, SqlitePool};

use crate::models::HarnessEvent;

/// Hard ceiling on a single page of events.
pub const MAX_PAGE_SIZE: i64 = 500;

/// Append an audit event.
///
/// Accepts any executor so callers can record the event inside the same
/// transaction as the change it describes.
pub async fn insert_event<'e>(
    executor: impl SqliteExecutor<'e>,
    event_type: &str,
    object_type: &str,
    object_id: Option<String>,
    payload: serde_json::Value,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO harness_events (event_type, object_type, object_id, payload, created_at) \
         VALUES (?, ?, ?, ?, ?) \
         RETURNING id",
    )
    .bind(event_type)
    .bind(object_type)
    .bind(object_id)
    .bind(Json(payload))
    .bind(Utc::now())
    .fetch_one(executor)
    .await
    .with_context(|| format!("failed to insert {event_type} event"))?;

    Ok(id)
}

/// Page through events, newest first.
///
/// `before` is an exclusive id cursor taken from the last row of the
/// previous page. `limit` is clamped to `1..=MAX_PAGE_SIZE`.
pub async fn list_events(
    pool: &SqlitePool,
    limit: i64,
    before: Option<i64>,
) -> Result<Vec<HarnessEvent>> {
    let limit = limit.clamp(1, MAX_PAGE_SIZE);
    let events = sqlx::query_as::<_, HarnessEvent>(
        "SELECT * FROM harness_events \
         WHERE (? IS NULL OR id < ?) \
         ORDER BY id DESC \
         LIMIT ?",
    )
    .bind(before)
    .bind(before)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list events")?;

    Ok(events)
}

/// All events recorded against one object, oldest first.
pub async fn list_events_for_object(
    pool: &SqlitePool,
    object_type: &str,
    object_id: &str,
) -> Result<Vec<HarnessEvent>> {
    let events = sqlx::query_as::<_, HarnessEvent>(
        "SELECT * FROM harness_events \
         WHERE object_type = ? AND object_id = ? \
         ORDER BY id ASC",
    )
    .bind(object_type)
    .bind(object_id)
    .fetch_all(pool)
    .await
    .context("failed to list events for object")?;

    Ok(events)
}

/// Count events of a given type.
pub async fn count_events_of_type(pool: &SqlitePool, event_type: &str) -> Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM harness_events WHERE event_type = ?")
            .bind(event_type)
            .fetch_one(pool)
            .await
            .context("failed to count events")?;

    Ok(count)
}
