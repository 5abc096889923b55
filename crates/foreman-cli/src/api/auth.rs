//! Credential handlers: OAuth sessions and callback, API keys, native
//! logins and runtime grant redemption.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use foreman_core::Foreman;
use foreman_core::auth::broker::ProviderAuthStatus;
use foreman_core::auth::native::NativeState;
use foreman_db::models::{Provider, RuntimeKind};

use super::{ApiResult, AppError};

fn parse_provider(raw: &str) -> ApiResult<Provider> {
    raw.parse()
        .map_err(|e: foreman_db::models::ProviderParseError| AppError::bad_request(e.to_string()))
}

// ---------------------------------------------------------------------------
// OAuth
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub provider: Provider,
    pub runtime: Option<RuntimeKind>,
}

pub async fn start_session(
    State(foreman): State<Foreman>,
    Json(request): Json<StartSessionRequest>,
) -> ApiResult<impl IntoResponse> {
    let runtime = request.runtime.unwrap_or(foreman.config.default_runtime);
    let session = foreman.broker.start_session(request.provider, runtime).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub state: Option<String>,
    pub code: Option<String>,
    pub error: Option<String>,
}

fn callback_page(status: StatusCode, title: &str, detail: &str) -> axum::response::Response {
    let body = format!(
        "<!doctype html><html><head><title>foreman: {title}</title></head>\
         <body><h1>{title}</h1><p>{}</p></body></html>",
        escape_html(detail)
    );
    (status, Html(body)).into_response()
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Browser redirect target. Always answers with a page a human can read.
pub async fn callback(
    State(foreman): State<Foreman>,
    Path(provider): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> axum::response::Response {
    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(e) => return callback_page(StatusCode::BAD_REQUEST, "Login failed", &e.message),
    };
    let Some(state) = query.state.as_deref() else {
        return callback_page(StatusCode::BAD_REQUEST, "Login failed", "missing state");
    };

    if let Some(error) = query.error.as_deref() {
        if let Err(e) = foreman.broker.reject_callback(provider, state, error).await {
            tracing::warn!(%provider, error = %e, "could not record rejected OAuth callback");
        }
        return callback_page(
            StatusCode::BAD_REQUEST,
            "Login failed",
            &format!("{provider} returned: {error}"),
        );
    }
    let Some(code) = query.code.as_deref() else {
        return callback_page(StatusCode::BAD_REQUEST, "Login failed", "missing code");
    };

    match foreman.broker.handle_callback(provider, state, code).await {
        Ok(_) => callback_page(
            StatusCode::OK,
            "Login complete",
            &format!("{provider} credentials are stored. You can close this window."),
        ),
        Err(e) => {
            let e = AppError::from(e);
            callback_page(e.status, "Login failed", &e.message)
        }
    }
}

// ---------------------------------------------------------------------------
// Stored credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ProviderView {
    #[serde(flatten)]
    pub status: ProviderAuthStatus,
    pub native_state: NativeState,
}

pub async fn provider_status(
    State(foreman): State<Foreman>,
    Path(provider): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let provider = parse_provider(&provider)?;
    Ok(Json(ProviderView {
        status: foreman.broker.provider_status(provider).await?,
        native_state: foreman.native.native_state(provider),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ApiKeyRequest {
    pub api_key: String,
}

pub async fn store_api_key(
    State(foreman): State<Foreman>,
    Path(provider): Path<String>,
    Json(request): Json<ApiKeyRequest>,
) -> ApiResult<impl IntoResponse> {
    let provider = parse_provider(&provider)?;
    foreman.broker.store_credential(provider, &request.api_key).await?;
    Ok(Json(foreman.broker.provider_status(provider).await?))
}

pub async fn clear_credential(
    State(foreman): State<Foreman>,
    Path(provider): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let provider = parse_provider(&provider)?;
    let removed = foreman.broker.clear_credential(provider).await?;
    Ok(Json(serde_json::json!({ "provider": provider, "removed": removed })))
}

// ---------------------------------------------------------------------------
// Native login
// ---------------------------------------------------------------------------

pub async fn native_start(
    State(foreman): State<Foreman>,
    Path(provider): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let provider = parse_provider(&provider)?;
    let session = foreman.native.start(provider).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn native_check(
    State(foreman): State<Foreman>,
    Path(provider): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let provider = parse_provider(&provider)?;
    Ok(Json(foreman.native.check(provider).await?))
}

pub async fn native_session(
    State(foreman): State<Foreman>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    foreman
        .native
        .session(id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("native session {id} not found")))
}

pub async fn native_stop(
    State(foreman): State<Foreman>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(foreman.native.stop(id)?))
}

// ---------------------------------------------------------------------------
// Runtime grants
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use foreman_db::models::{Provider, Stage, WorkItemKind};
    use foreman_db::queries::runs::insert_run;
    use foreman_db::queries::work_items::{NewWorkItem, insert_work_item};

    use super::escape_html;
    use crate::api::test_support::{body_json, body_text, get, json, send, test_app};

    #[test]
    fn callback_detail_is_escaped() {
        assert_eq!(escape_html("<b>&\"x\"</b>"), "&lt;b&gt;&amp;&quot;x&quot;&lt;/b&gt;");
    }

    #[tokio::test]
    async fn api_key_round_trip_never_echoes_the_secret() {
        let app = test_app().await;
        let response = json(
            &app.router,
            "PUT",
            "/auth/providers/codex/api-key",
            json!({ "api_key": "sk-very-secret" }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = body_text(response).await;
        assert!(!text.contains("sk-very-secret"));

        let body = body_json(get(&app.router, "/auth/providers/codex").await).await;
        assert_eq!(body["stored"], true);
        assert_eq!(body["token_kind"], "api_key");
        assert!(body["native_state"].is_string());

        let response = send(
            &app.router,
            axum::http::Request::builder()
                .method("DELETE")
                .uri("/auth/providers/codex/credential")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
        let body = body_json(response).await;
        assert_eq!(body["removed"], true);

        let body = body_json(get(&app.router, "/auth/providers/codex").await).await;
        assert_eq!(body["stored"], false);
    }

    #[tokio::test]
    async fn unknown_provider_is_a_bad_request() {
        let app = test_app().await;
        let response = get(&app.router, "/auth/providers/copilot").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(
            body_json(response).await["error"]
                .as_str()
                .unwrap()
                .contains("copilot")
        );
    }

    #[tokio::test]
    async fn oauth_start_without_client_is_rejected() {
        let app = test_app().await;
        let response = json(
            &app.router,
            "POST",
            "/auth/sessions",
            json!({ "provider": "gemini" }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = json(
            &app.router,
            "POST",
            "/auth/sessions",
            json!({ "provider": "claude" }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("does not support callback OAuth"));
    }

    #[tokio::test]
    async fn callback_with_unknown_state_renders_a_failure_page() {
        let app = test_app().await;
        let response = get(&app.router, "/auth/callback/gemini?state=nope&code=abc").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let page = body_text(response).await;
        assert!(page.contains("Login failed"));
        assert!(page.contains("unknown OAuth state"));

        let response = get(&app.router, "/auth/callback/gemini?code=abc").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn grants_cannot_be_redeemed_over_http() {
        let app = test_app().await;
        app.foreman
            .broker
            .store_credential(Provider::Codex, "sk-live")
            .await
            .unwrap();
        let item = insert_work_item(
            &app.foreman.pool,
            &NewWorkItem::new(WorkItemKind::Task, "t"),
            app.foreman.config.default_complexity,
        )
        .await
        .unwrap();
        let run = insert_run(&app.foreman.pool, item.id, Stage::Execute, None, 1, |id| {
            (format!("/tmp/{id}.log"), format!("/tmp/run-{id}"))
        })
        .await
        .unwrap();
        let grant = app
            .foreman
            .broker
            .mint_runtime_grant(run.id, Provider::Codex)
            .await
            .unwrap();

        let response = json(
            &app.router,
            "POST",
            "/auth/grants/consume",
            json!({ "token": grant.token }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let consumed = app
            .foreman
            .broker
            .consume_runtime_grant(&grant.token)
            .await
            .unwrap();
        assert_eq!(consumed.secret, "sk-live");
    }

    #[tokio::test]
    async fn unknown_native_session_is_not_found() {
        let app = test_app().await;
        let id = uuid::Uuid::new_v4();
        let response = get(&app.router, &format!("/auth/native/sessions/{id}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = json(
            &app.router,
            "POST",
            &format!("/auth/native/sessions/{id}/stop"),
            json!({}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn native_check_reports_missing_credentials() {
        let app = test_app().await;
        let response = json(
            &app.router,
            "POST",
            "/auth/providers/gemini/native/check",
            json!({}),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["provider"], "gemini");
        assert_eq!(body["state"], "missing");
    }
}
