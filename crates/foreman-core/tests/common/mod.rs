//! Shared fixtures for foreman-core integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tempfile::TempDir;

use foreman_core::agents::{AgentAdapter, AgentManifest, AgentRegistry, CommandCandidate};
use foreman_core::auth::{NativeAuthManager, OAuthBroker};
use foreman_core::config::HarnessConfig;
use foreman_core::Foreman;
use foreman_db::models::{AuthMode, Complexity, Provider, RuntimeKind, Stage};
use foreman_db::queries::profiles::{ExecutionProfileInput, ProfileSet, upsert_profiles};
use foreman_test_utils::create_test_db;

/// Adapter that runs a fixed `sh -c` script per stage.
#[derive(Debug, Clone)]
pub struct ShAdapter {
    pub name: String,
    pub scripts: HashMap<Stage, String>,
    pub markers: &'static [&'static str],
}

impl ShAdapter {
    pub fn new(plan: &str, execute: &str, test: &str) -> Self {
        Self {
            name: "fake".to_string(),
            scripts: HashMap::from([
                (Stage::Plan, plan.to_string()),
                (Stage::Execute, execute.to_string()),
                (Stage::Test, test.to_string()),
            ]),
            markers: &["please run /login"],
        }
    }

    pub fn passing() -> Self {
        Self::new("exit 0", "exit 0", "exit 0")
    }
}

impl AgentAdapter for ShAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> Provider {
        Provider::Claude
    }

    fn binary(&self) -> &str {
        "sh"
    }

    fn manifest(&self) -> AgentManifest {
        AgentManifest {
            auth_modes: vec![AuthMode::ApiKey],
            headless: true,
            oauth_requires_browser_callback: false,
            token_mount_supported: false,
            runtime_support: vec![RuntimeKind::Host],
        }
    }

    fn credential_env(&self, mode: AuthMode) -> Option<&'static str> {
        match mode {
            AuthMode::ApiKey => Some("FAKE_API_KEY"),
            _ => None,
        }
    }

    fn needs_input_markers(&self) -> &'static [&'static str] {
        self.markers
    }

    fn build_stage_command(&self, stage: Stage, _model: &str, _prompt: &str) -> Vec<CommandCandidate> {
        let script = self.scripts.get(&stage).cloned().unwrap_or_default();
        vec![CommandCandidate::new("sh", vec!["-c".to_string(), script])]
    }
}

pub struct TestHarness {
    pub foreman: Foreman,
    pub dir: TempDir,
    _db_dir: TempDir,
}

impl TestHarness {
    pub fn pool(&self) -> &SqlitePool {
        &self.foreman.pool
    }
}

/// Config rooted in `dir` with a fast poll and an existing project dir.
pub fn test_config(dir: &TempDir) -> HarnessConfig {
    let mut config = HarnessConfig::for_data_dir(dir.path());
    config.poll_interval = Duration::from_millis(50);
    config.max_parallel_runs = 2;
    config.ensure_dirs().expect("dirs");
    std::fs::create_dir_all(&config.project_path).expect("project dir");
    config
}

/// Assemble a harness around `adapter` with a custom config tweak.
pub async fn harness_with(
    adapter: ShAdapter,
    tweak: impl FnOnce(&mut HarnessConfig),
) -> TestHarness {
    let (pool, db_dir) = create_test_db().await;
    let dir = tempfile::tempdir().expect("temp dir");
    let mut config = test_config(&dir);
    tweak(&mut config);
    let config = Arc::new(config);

    let mut registry = AgentRegistry::new();
    registry.register(adapter);
    let broker = OAuthBroker::new(pool.clone(), Arc::clone(&config)).expect("broker");
    let native = NativeAuthManager::new(config.auth_home.clone());
    let foreman = Foreman::assemble(pool, config, registry, broker, native)
        .await
        .expect("assemble");

    TestHarness {
        foreman,
        dir,
        _db_dir: db_dir,
    }
}

pub async fn harness(adapter: ShAdapter) -> TestHarness {
    harness_with(adapter, |_| {}).await
}

pub fn profile(stage: Stage, timeout_secs: i64, retry_count: i64) -> ExecutionProfileInput {
    ExecutionProfileInput {
        complexity: Complexity::Simple,
        stage,
        runtime: RuntimeKind::Host,
        agent: "fake".to_string(),
        model: "test-model".to_string(),
        auth_mode: AuthMode::None,
        mcp_profile: None,
        skill_profile: None,
        timeout_secs,
        retry_count,
        enabled: true,
    }
}

/// Route every stage to the fake adapter.
pub async fn route_all_stages(pool: &SqlitePool) {
    let set = ProfileSet {
        execution: vec![
            profile(Stage::Plan, 10, 0),
            profile(Stage::Execute, 10, 0),
            profile(Stage::Test, 10, 0),
        ],
        ..ProfileSet::default()
    };
    upsert_profiles(pool, &set).await.expect("profiles");
}
