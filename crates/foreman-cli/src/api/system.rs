//! Health, run output, profiles, agents, discovery, loop control and the
//! event log.

use std::path::{Path as FsPath, PathBuf};

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;

use foreman_core::Foreman;
use foreman_core::agents::AgentManifest;
use foreman_core::profiles;
use foreman_db::models::{AgentInstallation, Provider, Run, RuntimeKind};
use foreman_db::queries::events::list_events;
use foreman_db::queries::installations::list_installations;
use foreman_db::queries::profiles::{ProfileSet, list_profiles as list_profile_rows};
use foreman_db::queries::runs::get_run;

use super::{ApiResult, AppError};

/// Default page size for `/events`.
const DEFAULT_EVENT_LIMIT: i64 = 100;

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

async fn load_run(foreman: &Foreman, id: i64) -> ApiResult<Run> {
    get_run(&foreman.pool, id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("run {id} not found")))
}

pub async fn run(State(foreman): State<Foreman>, Path(id): Path<i64>) -> ApiResult<Json<Run>> {
    Ok(Json(load_run(&foreman, id).await?))
}

/// Redacted run log as plain text.
pub async fn run_log(
    State(foreman): State<Foreman>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let run = load_run(&foreman, id).await?;
    let path = run
        .log_path
        .ok_or_else(|| AppError::not_found(format!("run {id} has no log")))?;
    let text = match tokio::fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::not_found(format!("log for run {id} is gone")));
        }
        Err(e) => return Err(anyhow::Error::new(e).context(format!("failed to read {path}")).into()),
    };
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text))
}

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    /// Return this file's contents instead of the listing.
    pub file: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub size_bytes: u64,
}

/// List a run's artifact directory, or fetch one file from it.
pub async fn run_artifacts(
    State(foreman): State<Foreman>,
    Path(id): Path<i64>,
    Query(query): Query<ArtifactQuery>,
) -> ApiResult<axum::response::Response> {
    let run = load_run(&foreman, id).await?;
    let Some(dir) = run.artifact_dir.map(PathBuf::from) else {
        return Ok(Json(Vec::<ArtifactEntry>::new()).into_response());
    };

    match query.file {
        Some(name) => {
            if !is_plain_file_name(&name) {
                return Err(AppError::bad_request(format!("invalid artifact name {name:?}")));
            }
            let path = dir.join(&name);
            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let mime = if name.ends_with(".json") {
                        "application/json"
                    } else {
                        "text/plain; charset=utf-8"
                    };
                    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AppError::not_found(
                    format!("run {id} has no artifact {name}"),
                )),
                Err(e) => Err(anyhow::Error::new(e)
                    .context(format!("failed to read {}", path.display()))
                    .into()),
            }
        }
        None => Ok(Json(list_artifacts(&dir).await?).into_response()),
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

async fn list_artifacts(dir: &FsPath) -> anyhow::Result<Vec<ArtifactEntry>> {
    let mut entries = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = read_dir.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            entries.push(ArtifactEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size_bytes: metadata.len(),
            });
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Profiles and agents
// ---------------------------------------------------------------------------

pub async fn list_profiles(State(foreman): State<Foreman>) -> ApiResult<impl IntoResponse> {
    Ok(Json(list_profile_rows(&foreman.pool).await?))
}

pub async fn replace_profiles(
    State(foreman): State<Foreman>,
    Json(set): Json<ProfileSet>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = profiles::replace_profiles(
        &foreman.pool,
        &foreman.registry,
        &foreman.config,
        &foreman.broker,
        &set,
    )
    .await?;
    Ok(Json(snapshot))
}

#[derive(Debug, Serialize)]
pub struct AgentView {
    pub name: String,
    pub provider: Provider,
    pub binary: String,
    pub manifest: AgentManifest,
    pub installations: Vec<AgentInstallation>,
}

pub async fn agents(State(foreman): State<Foreman>) -> ApiResult<impl IntoResponse> {
    let mut installations = list_installations(&foreman.pool).await?;
    let views: Vec<AgentView> = foreman
        .registry
        .adapters()
        .into_iter()
        .map(|adapter| {
            let name = adapter.name().to_string();
            let (mine, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut installations)
                .into_iter()
                .partition(|i| i.agent == name);
            installations = rest;
            AgentView {
                provider: adapter.provider(),
                binary: adapter.binary().to_string(),
                manifest: adapter.manifest(),
                installations: mine,
                name,
            }
        })
        .collect();
    Ok(Json(views))
}

#[derive(Debug, Default, Deserialize)]
pub struct ScanRequest {
    pub runtime: Option<RuntimeKind>,
}

/// Probe every adapter. An empty body scans the default runtime.
pub async fn scan(State(foreman): State<Foreman>, body: Bytes) -> ApiResult<impl IntoResponse> {
    let request: ScanRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ScanRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("invalid scan request: {e}")))?
    };
    let runtime = request.runtime.unwrap_or(foreman.config.default_runtime);
    Ok(Json(foreman.scan(runtime).await?))
}

// ---------------------------------------------------------------------------
// Dispatcher loop
// ---------------------------------------------------------------------------

pub async fn loop_start(State(foreman): State<Foreman>) -> ApiResult<impl IntoResponse> {
    Ok(Json(foreman.dispatcher.start().await?))
}

pub async fn loop_stop(State(foreman): State<Foreman>) -> ApiResult<impl IntoResponse> {
    Ok(Json(foreman.dispatcher.stop().await?))
}

pub async fn loop_status(State(foreman): State<Foreman>) -> impl IntoResponse {
    Json(foreman.dispatcher.status().await)
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
    pub before: Option<i64>,
}

pub async fn events(
    State(foreman): State<Foreman>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    if limit < 1 {
        return Err(AppError::bad_request("limit must be at least 1"));
    }
    Ok(Json(list_events(&foreman.pool, limit, query.before).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use foreman_db::models::{RunStatus, Stage, WorkItemKind};
    use foreman_db::queries::runs::insert_run;
    use foreman_db::queries::work_items::{NewWorkItem, insert_work_item};

    use foreman_core::agents::{AgentAdapter, AgentManifest, AgentRegistry, CommandCandidate};
    use foreman_db::models::{AuthMode, Provider, RuntimeKind};

    use super::is_plain_file_name;
    use crate::api::test_support::{
        body_json, body_text, get, json, test_app, test_app_with_registry,
    };

    /// An agent whose manifest only allows the host runtime.
    struct HostOnly;

    impl AgentAdapter for HostOnly {
        fn name(&self) -> &str {
            "hostonly"
        }

        fn provider(&self) -> Provider {
            Provider::Claude
        }

        fn binary(&self) -> &str {
            "hostonly"
        }

        fn manifest(&self) -> AgentManifest {
            AgentManifest {
                auth_modes: vec![AuthMode::Native],
                headless: true,
                oauth_requires_browser_callback: false,
                token_mount_supported: false,
                runtime_support: vec![RuntimeKind::Host],
            }
        }

        fn credential_env(&self, _mode: AuthMode) -> Option<&'static str> {
            None
        }

        fn needs_input_markers(&self) -> &'static [&'static str] {
            &[]
        }

        fn build_stage_command(
            &self,
            _stage: Stage,
            _model: &str,
            _prompt: &str,
        ) -> Vec<CommandCandidate> {
            Vec::new()
        }
    }

    #[test]
    fn artifact_names_cannot_escape_the_run_dir() {
        assert!(is_plain_file_name("result.json"));
        assert!(!is_plain_file_name("../secrets"));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name(""));
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let app = test_app().await;
        for uri in ["/runs/7", "/runs/7/log", "/runs/7/artifacts"] {
            assert_eq!(get(&app.router, uri).await.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn run_output_is_served() {
        let app = test_app().await;
        let item = insert_work_item(
            &app.foreman.pool,
            &NewWorkItem::new(WorkItemKind::Task, "t"),
            app.foreman.config.default_complexity,
        )
        .await
        .unwrap();
        let run_dir = app.dir.path().join("artifacts").join("run-x");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("result.json"), "{\"ok\":true}").unwrap();
        std::fs::write(run_dir.join("prompt.md"), "# plan").unwrap();
        let log = app.dir.path().join("logs").join("run-x.log");
        std::fs::write(&log, "[stdout] hello\n").unwrap();

        let run = insert_run(
            &app.foreman.pool,
            item.id,
            Stage::Plan,
            None,
            1,
            |_| (log.display().to_string(), run_dir.display().to_string()),
        )
        .await
        .unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let body = body_json(get(&app.router, &format!("/runs/{}", run.id)).await).await;
        assert_eq!(body["stage"], "plan");

        let text = body_text(get(&app.router, &format!("/runs/{}/log", run.id)).await).await;
        assert_eq!(text, "[stdout] hello\n");

        let listing =
            body_json(get(&app.router, &format!("/runs/{}/artifacts", run.id)).await).await;
        let names: Vec<&str> = listing
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["prompt.md", "result.json"]);

        let result = body_json(
            get(&app.router, &format!("/runs/{}/artifacts?file=result.json", run.id)).await,
        )
        .await;
        assert_eq!(result["ok"], true);

        let response = get(
            &app.router,
            &format!("/runs/{}/artifacts?file=..%2Fsecret", run.id),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn docker_profile_for_host_only_agent_changes_nothing() {
        let mut registry = AgentRegistry::builtin();
        registry.register(HostOnly);
        let app = test_app_with_registry(registry).await;

        let host_profile = json!({
            "execution": [{
                "complexity": "simple", "stage": "plan", "runtime": "host",
                "agent": "hostonly", "auth_mode": "none",
            }],
        });
        let response = json(&app.router, "PUT", "/profiles", host_profile).await;
        assert_eq!(response.status(), StatusCode::OK);
        let before = body_json(get(&app.router, "/profiles").await).await;

        let response = json(
            &app.router,
            "PUT",
            "/profiles",
            json!({
                "execution": [{
                    "complexity": "simple", "stage": "plan", "runtime": "docker",
                    "agent": "hostonly", "auth_mode": "none",
                }, {
                    "complexity": "simple", "stage": "execute", "runtime": "host",
                    "agent": "hostonly", "auth_mode": "none",
                }],
                "skills": [{ "name": "rust", "skills": ["cargo"] }],
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .contains("does not support runtime docker"),
            "{body}"
        );

        let after = body_json(get(&app.router, "/profiles").await).await;
        assert_eq!(before, after);
        assert_eq!(after["execution"].as_array().unwrap().len(), 1);
        assert_eq!(after["execution"][0]["runtime"], "host");
    }

    #[tokio::test]
    async fn profiles_round_trip_and_reject_unknown_agents() {
        let app = test_app().await;
        let body = body_json(get(&app.router, "/profiles").await).await;
        assert!(body["execution"].as_array().unwrap().is_empty());

        let response = json(
            &app.router,
            "PUT",
            "/profiles",
            json!({
                "execution": [{
                    "complexity": "simple", "stage": "plan", "runtime": "host",
                    "agent": "nope", "auth_mode": "none",
                }],
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("unknown agent nope"));

        let response = json(
            &app.router,
            "PUT",
            "/profiles",
            json!({
                "execution": [{
                    "complexity": "simple", "stage": "plan", "runtime": "host",
                    "agent": "claude", "model": "sonnet", "auth_mode": "none",
                    "skill_profile": "rust",
                }],
                "skills": [{ "name": "rust", "skills": ["cargo"] }],
            }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["execution"][0]["agent"], "claude");
        assert_eq!(body["skills"][0]["name"], "rust");
    }

    #[tokio::test]
    async fn agents_list_every_builtin_adapter() {
        let app = test_app().await;
        let body = body_json(get(&app.router, "/agents").await).await;
        let names: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap())
            .collect();
        for expected in ["claude", "codex", "gemini", "opencode"] {
            assert!(names.contains(&expected), "{expected} missing from {names:?}");
        }
        assert!(body[0]["manifest"]["runtime_support"].is_array());
    }

    #[tokio::test]
    async fn loop_control_round_trip() {
        let app = test_app().await;
        let body = body_json(get(&app.router, "/loop/status").await).await;
        assert_eq!(body["running"], false);

        let body = body_json(json(&app.router, "POST", "/loop/start", json!({})).await).await;
        assert_eq!(body["running"], true);
        assert_eq!(body["max_parallel_runs"], 2);

        let body = body_json(json(&app.router, "POST", "/loop/stop", json!({})).await).await;
        assert_eq!(body["running"], false);
    }

    #[tokio::test]
    async fn events_page_newest_first() {
        let app = test_app().await;
        for title in ["one", "two", "three"] {
            json(
                &app.router,
                "POST",
                "/work-items",
                json!({ "kind": "task", "title": title }),
            )
            .await;
        }
        let page = body_json(get(&app.router, "/events?limit=2").await).await;
        let page = page.as_array().unwrap();
        assert_eq!(page.len(), 2);
        let first = page[0]["id"].as_i64().unwrap();
        let second = page[1]["id"].as_i64().unwrap();
        assert!(first > second);

        let next = body_json(get(&app.router, &format!("/events?before={second}")).await).await;
        assert!(
            next.as_array()
                .unwrap()
                .iter()
                .all(|e| e["id"].as_i64().unwrap() < second)
        );

        let response = get(&app.router, "/events?limit=0").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
