//! HTTP API over a running [`Foreman`].
//!
//! Handlers are thin: they parse the request, call into `foreman-core`
//! and map [`HarnessError`] onto a status code. Bodies are JSON except the
//! OAuth callback page and run logs.

mod auth;
mod system;
mod work_items;

use std::net::IpAddr;

use axum::extract::DefaultBodyLimit;
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use foreman_core::guard::GuardFinding;
use foreman_core::{Foreman, HarnessError};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    hint: Option<String>,
    findings: Option<Vec<GuardFinding>>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    findings: Option<&'a [GuardFinding]>,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            hint: None,
            findings: None,
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn internal(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{err:#}"), "request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

impl From<HarnessError> for AppError {
    fn from(err: HarnessError) -> Self {
        match err {
            HarnessError::Validation(msg) => Self::bad_request(msg),
            HarnessError::NotFound(msg) => Self::not_found(msg),
            HarnessError::Auth { message, hint } => Self {
                hint,
                ..Self::bad_request(message)
            },
            HarnessError::Security { patterns, findings } => Self {
                findings: Some(findings),
                ..Self::bad_request(format!(
                    "prompt injection patterns detected: {}",
                    patterns.join(", ")
                ))
            },
            HarnessError::Conflict(msg) => Self::new(StatusCode::CONFLICT, msg),
            HarnessError::Internal(err) => Self::internal(err),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = ErrorBody {
            error: &self.message,
            hint: self.hint.as_deref(),
            findings: self.findings.as_deref(),
        };
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, AppError>;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Room for base64 inflation and multipart framing on top of the raw
/// upload limit.
fn upload_body_limit(max_upload_bytes: usize) -> usize {
    max_upload_bytes
        .saturating_mul(4)
        .saturating_div(3)
        .saturating_add(64 * 1024)
}

/// Host part of an `Origin` header value, without brackets for IPv6.
fn origin_host(origin: &str) -> Option<&str> {
    let rest = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))?;
    match rest.strip_prefix('[') {
        Some(v6) => v6.split(']').next(),
        None => rest.split(':').next(),
    }
}

/// Loopback pages and the OAuth callback host may call the API from a
/// browser. Everything else gets no CORS headers.
fn is_allowed_origin(origin: &str, callback_host: &str) -> bool {
    let Some(host) = origin_host(origin) else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost")
        || host.eq_ignore_ascii_case(callback_host)
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

fn cors_layer(callback_host: &str) -> CorsLayer {
    let callback_host = callback_host.to_string();
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _: &Parts| {
                origin
                    .to_str()
                    .is_ok_and(|o| is_allowed_origin(o, &callback_host))
            },
        ))
        .allow_methods(Any)
        .allow_headers(Any)
}

pub fn build_router(foreman: Foreman) -> Router {
    let upload_limit = upload_body_limit(foreman.config.max_upload_bytes);
    let cors = cors_layer(&foreman.config.oauth_callback_host);

    Router::new()
        .route("/health", get(system::health))
        // Work items
        .route(
            "/work-items",
            get(work_items::list).post(work_items::create),
        )
        .route(
            "/work-items/{id}",
            get(work_items::detail).patch(work_items::patch),
        )
        .route(
            "/work-items/{id}/attachments",
            post(work_items::upload_attachment).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/work-items/{id}/dispatch", post(work_items::dispatch))
        .route("/work-items/{id}/blocking", get(work_items::blocking))
        .route("/findings/{id}/resolve", post(work_items::resolve_finding))
        // Runs
        .route("/runs/{id}", get(system::run))
        .route("/runs/{id}/log", get(system::run_log))
        .route("/runs/{id}/artifacts", get(system::run_artifacts))
        // Profiles and agents
        .route(
            "/profiles",
            get(system::list_profiles).put(system::replace_profiles),
        )
        .route("/agents", get(system::agents))
        .route("/discovery/scan", post(system::scan))
        // Credentials
        .route("/auth/sessions", post(auth::start_session))
        .route("/auth/callback/{provider}", get(auth::callback))
        .route("/auth/providers/{provider}", get(auth::provider_status))
        .route("/auth/providers/{provider}/api-key", put(auth::store_api_key))
        .route(
            "/auth/providers/{provider}/credential",
            delete(auth::clear_credential),
        )
        .route(
            "/auth/providers/{provider}/native/start",
            post(auth::native_start),
        )
        .route(
            "/auth/providers/{provider}/native/check",
            post(auth::native_check),
        )
        .route("/auth/native/sessions/{id}", get(auth::native_session))
        .route("/auth/native/sessions/{id}/stop", post(auth::native_stop))
        // Dispatcher
        .route("/loop/start", post(system::loop_start))
        .route("/loop/stop", post(system::loop_stop))
        .route("/loop/status", get(system::loop_status))
        .route("/events", get(system::events))
        .layer(cors)
        .with_state(foreman)
}
