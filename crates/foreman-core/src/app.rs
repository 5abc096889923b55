//! The assembled harness: store, auth, adapters and dispatcher wired from
//! one [`HarnessConfig`].

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use foreman_db::models::RuntimeKind;
use foreman_db::pool;
use foreman_db::queries::installations::upsert_installation;
use foreman_db::queries::runs::fail_orphaned_runs;
use foreman_db::queries::work_items::recover_interrupted_work_items;

use crate::agents::probe::{PROBE_TIMEOUT, ProbeResult, probe_all};
use crate::agents::AgentRegistry;
use crate::auth::{AuthResolver, NativeAuthManager, OAuthBroker};
use crate::config::HarnessConfig;
use crate::dispatcher::{DispatchContext, Dispatcher};
use crate::executor::StageExecutor;
use crate::guard::PromptGuard;

/// What startup recovery cleaned up.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub orphaned_runs: u64,
    pub recovered_work_items: Vec<i64>,
    pub failed_auth_sessions: u64,
}

/// Every long-lived component of a running harness.
#[derive(Debug, Clone)]
pub struct Foreman {
    pub pool: SqlitePool,
    pub config: Arc<HarnessConfig>,
    pub registry: Arc<AgentRegistry>,
    pub guard: Arc<PromptGuard>,
    pub broker: Arc<OAuthBroker>,
    pub native: Arc<NativeAuthManager>,
    pub dispatcher: Arc<Dispatcher>,
}

impl Foreman {
    /// Open the store, run migrations and assemble the built-in components.
    pub async fn open(config: HarnessConfig) -> Result<Self> {
        config.ensure_dirs()?;
        let pool = pool::create_pool(&config.database).await?;
        pool::run_migrations(&pool).await?;

        let config = Arc::new(config);
        let broker = OAuthBroker::new(pool.clone(), Arc::clone(&config))?;
        let native = NativeAuthManager::new(config.auth_home.clone());
        Self::assemble(pool, config, AgentRegistry::builtin(), broker, native).await
    }

    /// Wire explicit components together and run startup recovery.
    pub async fn assemble(
        pool: SqlitePool,
        config: Arc<HarnessConfig>,
        registry: AgentRegistry,
        broker: OAuthBroker,
        native: NativeAuthManager,
    ) -> Result<Self> {
        if config.uses_dev_encryption_key() {
            warn!("using the development encryption key; set FOREMAN_ENCRYPTION_KEY");
        }
        let guard = PromptGuard::new(config.prompt_injection_mode)
            .context("failed to compile prompt guard patterns")?;

        let registry = Arc::new(registry);
        let broker = Arc::new(broker);
        let native = Arc::new(native);
        let auth = AuthResolver::new(Arc::clone(&broker), Arc::clone(&native));
        let executor = StageExecutor::new(pool.clone(), Arc::clone(&config), auth);
        let dispatcher = Dispatcher::new(DispatchContext {
            pool: pool.clone(),
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            executor,
        });

        let foreman = Self {
            pool,
            config,
            registry,
            guard: Arc::new(guard),
            broker,
            native,
            dispatcher,
        };
        foreman.recover().await?;
        Ok(foreman)
    }

    /// Clean up after a previous process: fail runs it left `running`,
    /// release its claims and fail its pending OAuth sessions.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = RecoveryReport {
            orphaned_runs: fail_orphaned_runs(&self.pool).await?,
            recovered_work_items: recover_interrupted_work_items(&self.pool).await?,
            failed_auth_sessions: self.broker.fail_stale_sessions().await?,
        };
        if report.orphaned_runs > 0 || !report.recovered_work_items.is_empty() {
            warn!(
                orphaned_runs = report.orphaned_runs,
                recovered = ?report.recovered_work_items,
                "recovered state from a previous run"
            );
        }
        Ok(report)
    }

    /// Probe every adapter on `runtime` and persist the results.
    pub async fn scan(&self, runtime: RuntimeKind) -> Result<Vec<ProbeResult>> {
        let results = probe_all(&self.registry, runtime, &self.config.docker_image, PROBE_TIMEOUT).await;
        for result in &results {
            upsert_installation(&self.pool, &result.to_installation()).await?;
        }
        info!(
            %runtime,
            ready = results
                .iter()
                .filter(|r| r.status == foreman_db::models::InstallationStatus::Ready)
                .count(),
            total = results.len(),
            "discovery scan finished"
        );
        Ok(results)
    }
}
