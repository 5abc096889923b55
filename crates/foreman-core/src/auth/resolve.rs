//! Per-run credential resolution.

use std::sync::Arc;

use foreman_db::models::{AuthMode, RuntimeKind};

use super::broker::OAuthBroker;
use super::native::NativeAuthManager;
use crate::agents::AgentAdapter;
use crate::error::{HarnessError, HarnessResult};
use crate::runtime::Mount;

/// A grant waiting to be redeemed into `env_var`.
#[derive(Debug, Clone)]
pub struct GrantBinding {
    pub token: String,
    pub env_var: &'static str,
}

/// What a run needs for its auth mode.
#[derive(Debug, Clone, Default)]
pub struct ResolvedAuth {
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub grant: Option<GrantBinding>,
}

/// Joins the OAuth broker and the native manager behind one call per run.
#[derive(Debug, Clone)]
pub struct AuthResolver {
    broker: Arc<OAuthBroker>,
    native: Arc<NativeAuthManager>,
}

impl AuthResolver {
    pub fn new(broker: Arc<OAuthBroker>, native: Arc<NativeAuthManager>) -> Self {
        Self { broker, native }
    }

    pub fn broker(&self) -> &Arc<OAuthBroker> {
        &self.broker
    }

    pub fn native(&self) -> &Arc<NativeAuthManager> {
        &self.native
    }

    /// Check that credentials for `mode` exist without minting anything.
    pub async fn preflight(
        &self,
        adapter: &dyn AgentAdapter,
        mode: AuthMode,
        runtime: RuntimeKind,
    ) -> HarnessResult<()> {
        if !adapter.manifest().supports_auth_mode(mode) {
            return Err(HarnessError::auth(
                format!("{} does not support auth mode {mode}", adapter.name()),
                Some("change the execution profile's auth_mode".to_string()),
            ));
        }
        match mode {
            AuthMode::None => Ok(()),
            AuthMode::ApiKey | AuthMode::Oauth => {
                credential_env(adapter, mode)?;
                let provider = adapter.provider();
                if self.broker.has_stored_token(provider).await? {
                    Ok(())
                } else {
                    Err(missing_token(adapter, mode))
                }
            }
            AuthMode::Native => self
                .native
                .resolve_runtime(adapter.provider(), runtime)
                .map(|_| ()),
        }
    }

    /// Resolve credentials for one attempt of `run_id`.
    pub async fn resolve(
        &self,
        adapter: &dyn AgentAdapter,
        mode: AuthMode,
        runtime: RuntimeKind,
        run_id: i64,
    ) -> HarnessResult<ResolvedAuth> {
        self.preflight(adapter, mode, runtime).await?;
        match mode {
            AuthMode::None => Ok(ResolvedAuth::default()),
            AuthMode::ApiKey | AuthMode::Oauth => {
                let env_var = credential_env(adapter, mode)?;
                let grant = self
                    .broker
                    .mint_runtime_grant(run_id, adapter.provider())
                    .await?;
                Ok(ResolvedAuth {
                    grant: Some(GrantBinding {
                        token: grant.token,
                        env_var,
                    }),
                    ..ResolvedAuth::default()
                })
            }
            AuthMode::Native => {
                let mounts = self.native.resolve_runtime(adapter.provider(), runtime)?;
                let env = match runtime {
                    RuntimeKind::Host => vec![(
                        "HOME".to_string(),
                        self.native.auth_home().display().to_string(),
                    )],
                    RuntimeKind::Docker => Vec::new(),
                };
                Ok(ResolvedAuth {
                    env,
                    mounts,
                    grant: None,
                })
            }
        }
    }

    /// Exchange a grant for the `(env_var, secret)` pair to hand the child.
    pub async fn redeem(&self, binding: &GrantBinding) -> HarnessResult<(String, String)> {
        let consumed = self.broker.consume_runtime_grant(&binding.token).await?;
        Ok((binding.env_var.to_string(), consumed.secret))
    }
}

fn credential_env(adapter: &dyn AgentAdapter, mode: AuthMode) -> HarnessResult<&'static str> {
    adapter.credential_env(mode).ok_or_else(|| {
        HarnessError::auth(
            format!("{} has no credential variable for {mode}", adapter.name()),
            Some("change the execution profile's auth_mode".to_string()),
        )
    })
}

fn missing_token(adapter: &dyn AgentAdapter, mode: AuthMode) -> HarnessError {
    let provider = adapter.provider();
    let hint = match mode {
        AuthMode::Oauth => format!("POST /auth/sessions with provider {provider}"),
        _ => format!("PUT /auth/providers/{provider}/api-key"),
    };
    HarnessError::auth(format!("no stored credential for {provider}"), Some(hint))
}
