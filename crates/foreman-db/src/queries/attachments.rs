//! Database query functions for the `attachments` table.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::Attachment;

/// Metadata for a stored upload.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub work_item_id: i64,
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub file_path: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

/// Insert an attachment row. Identical content yields a new row each time.
pub async fn insert_attachment(pool: &SqlitePool, new: &NewAttachment) -> Result<Attachment> {
    let attachment = sqlx::query_as::<_, Attachment>(
        "INSERT INTO attachments \
         (work_item_id, file_name, mime_type, size_bytes, sha256, file_path, width, height, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(new.work_item_id)
    .bind(&new.file_name)
    .bind(&new.mime_type)
    .bind(new.size_bytes)
    .bind(&new.sha256)
    .bind(&new.file_path)
    .bind(new.width)
    .bind(new.height)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert attachment")?;

    Ok(attachment)
}

/// Attachments for a work item, oldest first.
pub async fn list_attachments_for_work_item(
    pool: &SqlitePool,
    work_item_id: i64,
) -> Result<Vec<Attachment>> {
    let rows = sqlx::query_as::<_, Attachment>(
        "SELECT * FROM attachments WHERE work_item_id = ? ORDER BY id ASC",
    )
    .bind(work_item_id)
    .fetch_all(pool)
    .await
    .context("failed to list attachments")?;

    Ok(rows)
}
