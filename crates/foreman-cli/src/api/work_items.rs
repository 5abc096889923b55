//! Work item, attachment, dispatch and finding handlers.

use axum::extract::{FromRequest, Multipart, Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use foreman_core::attachments::{JsonUpload, Upload, store_attachment};
use foreman_core::workitems;
use foreman_core::Foreman;
use foreman_db::models::WorkItemStatus;
use foreman_db::queries::work_items::{NewWorkItem, WorkItemPatch, list_work_items};

use super::{ApiResult, AppError};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<WorkItemStatus>,
}

pub async fn list(
    State(foreman): State<Foreman>,
    Query(query): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let items = list_work_items(&foreman.pool, query.status).await?;
    Ok(Json(items))
}

pub async fn create(
    State(foreman): State<Foreman>,
    Json(new): Json<NewWorkItem>,
) -> ApiResult<impl IntoResponse> {
    let item = workitems::create_work_item(
        &foreman.pool,
        &foreman.guard,
        foreman.config.default_complexity,
        new,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn detail(
    State(foreman): State<Foreman>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(workitems::get_detail(&foreman.pool, id).await?))
}

pub async fn patch(
    State(foreman): State<Foreman>,
    Path(id): Path<i64>,
    Json(patch): Json<WorkItemPatch>,
) -> ApiResult<impl IntoResponse> {
    let item = workitems::patch_work_item(&foreman.pool, &foreman.guard, id, patch).await?;
    Ok(Json(item))
}

/// Accepts `multipart/form-data` with a `file` part, or a JSON body with
/// base64 content.
pub async fn upload_attachment(
    State(foreman): State<Foreman>,
    Path(id): Path<i64>,
    request: Request,
) -> ApiResult<impl IntoResponse> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let upload = if is_multipart {
        let multipart = Multipart::from_request(request, &foreman)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        read_multipart(multipart).await?
    } else {
        let Json(json) = Json::<JsonUpload>::from_request(request, &foreman)
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        Upload::try_from(json)?
    };

    let attachment = store_attachment(
        &foreman.pool,
        &foreman.config.uploads_dir,
        foreman.config.max_upload_bytes,
        id,
        upload,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

async fn read_multipart(mut multipart: Multipart) -> ApiResult<Upload> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let mime_type = field.content_type().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::bad_request(e.body_text()))?;
        return Ok(Upload {
            file_name,
            mime_type,
            bytes: bytes.to_vec(),
        });
    }
    Err(AppError::bad_request("multipart body has no `file` part"))
}

pub async fn dispatch(
    State(foreman): State<Foreman>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let accepted = foreman.dispatcher.dispatch_now(id).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

pub async fn blocking(
    State(foreman): State<Foreman>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(workitems::blocking_report(&foreman.pool, id).await?))
}

pub async fn resolve_finding(
    State(foreman): State<Foreman>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(workitems::resolve_finding(&foreman.pool, id).await?))
}
