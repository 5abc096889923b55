//! Content-addressed attachment storage.
//!
//! Files land at `<uploads>/<sha[0..2]>/<sha256>`; identical content is
//! written once but every upload gets its own row.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{debug, info};

use foreman_db::models::Attachment;
use foreman_db::queries::attachments::{NewAttachment, insert_attachment};
use foreman_db::queries::events::insert_event;
use foreman_db::queries::work_items::get_work_item;

use crate::error::{HarnessError, HarnessResult};

const FALLBACK_MIME: &str = "application/octet-stream";

/// A file received from a client.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// JSON form of an upload.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonUpload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub content_base64: String,
}

impl TryFrom<JsonUpload> for Upload {
    type Error = HarnessError;

    fn try_from(json: JsonUpload) -> HarnessResult<Self> {
        let bytes = STANDARD
            .decode(json.content_base64.trim())
            .map_err(|e| HarnessError::validation(format!("content_base64 is not valid base64: {e}")))?;
        Ok(Self {
            file_name: json.file_name,
            mime_type: json.mime_type,
            bytes,
        })
    }
}

/// Where content with `sha256` is stored.
pub fn content_path(uploads_dir: &Path, sha256: &str) -> PathBuf {
    let prefix = sha256.get(..2).unwrap_or("00");
    uploads_dir.join(prefix).join(sha256)
}

/// Validate, store and record an upload for `work_item_id`.
pub async fn store_attachment(
    pool: &SqlitePool,
    uploads_dir: &Path,
    max_bytes: usize,
    work_item_id: i64,
    upload: Upload,
) -> HarnessResult<Attachment> {
    if get_work_item(pool, work_item_id).await?.is_none() {
        return Err(HarnessError::not_found(format!(
            "work item {work_item_id} not found"
        )));
    }

    let file_name = sanitize_file_name(&upload.file_name)
        .ok_or_else(|| HarnessError::validation("file_name must not be empty"))?;
    if upload.bytes.is_empty() {
        return Err(HarnessError::validation("attachment is empty"));
    }
    if upload.bytes.len() > max_bytes {
        return Err(HarnessError::validation(format!(
            "attachment is {} bytes; the limit is {max_bytes}",
            upload.bytes.len()
        )));
    }

    let sha256 = hex::encode(Sha256::digest(&upload.bytes));
    let path = content_path(uploads_dir, &sha256);
    if tokio::fs::try_exists(&path).await.unwrap_or(false) {
        debug!(sha256 = %sha256, "attachment content already stored");
    } else {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&path, &upload.bytes)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }

    let probe = probe_image(&upload.bytes);
    let mime_type = upload
        .mime_type
        .filter(|m| !m.trim().is_empty())
        .or_else(|| probe.as_ref().map(|p| p.mime_type.to_string()))
        .unwrap_or_else(|| FALLBACK_MIME.to_string());

    let attachment = insert_attachment(
        pool,
        &NewAttachment {
            work_item_id,
            file_name,
            mime_type,
            size_bytes: upload.bytes.len() as i64,
            sha256,
            file_path: path.display().to_string(),
            width: probe.as_ref().map(|p| i64::from(p.width)),
            height: probe.as_ref().map(|p| i64::from(p.height)),
        },
    )
    .await?;

    insert_event(
        pool,
        "attachment_added",
        "work_item",
        Some(work_item_id.to_string()),
        json!({
            "attachment_id": attachment.id,
            "sha256": attachment.sha256,
            "size_bytes": attachment.size_bytes,
        }),
    )
    .await?;
    info!(
        work_item_id,
        attachment_id = attachment.id,
        size_bytes = attachment.size_bytes,
        "attachment stored"
    );
    Ok(attachment)
}

struct ImageProbe {
    mime_type: &'static str,
    width: u32,
    height: u32,
}

/// Format and dimensions, if `bytes` is a decodable image.
fn probe_image(bytes: &[u8]) -> Option<ImageProbe> {
    let reader = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let format = reader.format()?;
    let (width, height) = reader.into_dimensions().ok()?;
    Some(ImageProbe {
        mime_type: format.to_mime_type(),
        width,
        height,
    })
}

/// Last path component, trimmed. `None` when nothing usable remains.
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() || base == "." || base == ".." {
        None
    } else {
        Some(base.to_string())
    }
}
