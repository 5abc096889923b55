//! OAuth broker: PKCE sessions, encrypted token storage and one-shot
//! runtime grants.
//!
//! Long-lived secrets only exist in three places: AES-GCM ciphertext in
//! `auth_tokens`, the in-memory grant table, and the environment of the
//! subprocess that redeemed a grant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use foreman_db::models::{
    AuthSessionStatus, AuthTokenRecord, Provider, RuntimeKind, TokenKind,
};
use foreman_db::queries::auth::{self as auth_db, NewAuthSession, TokenUpsert};
use foreman_db::queries::events::insert_event;

use super::crypto::TokenCipher;
use super::pkce::{PkcePair, random_url_token};
use super::providers::{OAuthError, ProviderPlugin, TokenSet, plugin_for};
use crate::config::{HarnessConfig, OAuthClient};
use crate::error::{HarnessError, HarnessResult};

/// Lifetime of a pending PKCE session.
pub const SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// Lifetime of a runtime grant.
pub const GRANT_TTL: Duration = Duration::from_secs(60);

/// Prefix of runtime grant tokens.
pub const GRANT_PREFIX: &str = "fgr_";

/// A started PKCE login.
#[derive(Debug, Clone, Serialize)]
pub struct StartedSession {
    pub session_id: i64,
    pub provider: Provider,
    pub runtime: RuntimeKind,
    pub state: String,
    pub authorize_url: String,
    pub expires_at: DateTime<Utc>,
}

/// A freshly minted runtime grant.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedGrant {
    pub token: String,
    pub provider: Provider,
    pub run_id: i64,
    pub expires_at: DateTime<Utc>,
}

/// What redeeming a grant yields.
#[derive(Clone)]
pub struct ConsumedGrant {
    pub provider: Provider,
    pub run_id: i64,
    pub secret: String,
}

impl std::fmt::Debug for ConsumedGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumedGrant")
            .field("provider", &self.provider)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// Stored-credential summary for one provider. Never contains secrets.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderAuthStatus {
    pub provider: Provider,
    pub stored: bool,
    pub token_kind: Option<TokenKind>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub oauth_supported: bool,
    pub oauth_client_configured: bool,
}

struct PendingGrant {
    provider: Provider,
    run_id: i64,
    secret: String,
    expires_at: DateTime<Utc>,
}

/// PKCE session handling, token storage and runtime grants.
pub struct OAuthBroker {
    pool: SqlitePool,
    config: Arc<HarnessConfig>,
    cipher: TokenCipher,
    plugins: HashMap<Provider, Arc<dyn ProviderPlugin>>,
    grants: Mutex<HashMap<String, PendingGrant>>,
    grant_ttl: Duration,
}

impl std::fmt::Debug for OAuthBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthBroker")
            .field("plugins", &self.plugins.keys().collect::<Vec<_>>())
            .field("grant_ttl", &self.grant_ttl)
            .finish()
    }
}

impl OAuthBroker {
    /// Broker with the built-in plugin for every provider.
    pub fn new(pool: SqlitePool, config: Arc<HarnessConfig>) -> anyhow::Result<Self> {
        let cipher = TokenCipher::from_secret(&config.encryption_key)
            .context("failed to derive token encryption key")?;
        let plugins = Provider::ALL
            .iter()
            .map(|provider| (*provider, plugin_for(*provider)))
            .collect();
        Ok(Self {
            pool,
            config,
            cipher,
            plugins,
            grants: Mutex::new(HashMap::new()),
            grant_ttl: GRANT_TTL,
        })
    }

    /// Replace the plugin for `provider`.
    pub fn with_plugin(mut self, provider: Provider, plugin: Arc<dyn ProviderPlugin>) -> Self {
        self.plugins.insert(provider, plugin);
        self
    }

    /// Override the grant lifetime.
    pub fn with_grant_ttl(mut self, ttl: Duration) -> Self {
        self.grant_ttl = ttl;
        self
    }

    fn plugin(&self, provider: Provider) -> Arc<dyn ProviderPlugin> {
        self.plugins
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| plugin_for(provider))
    }

    pub fn supports_callback_oauth(&self, provider: Provider) -> bool {
        self.plugin(provider).supports_callback_oauth()
    }

    fn client(&self, provider: Provider) -> HarnessResult<&OAuthClient> {
        self.config.oauth_clients.get(&provider).ok_or_else(|| {
            HarnessError::validation(format!(
                "no OAuth client configured for {provider} (set FOREMAN_OAUTH_{}_CLIENT_ID)",
                provider.as_str().to_uppercase()
            ))
        })
    }

    /// Fail sessions left pending by a previous process.
    pub async fn fail_stale_sessions(&self) -> anyhow::Result<u64> {
        let failed =
            auth_db::fail_pending_auth_sessions(&self.pool, "harness restarted before login completed")
                .await?;
        if failed > 0 {
            warn!(count = failed, "failed OAuth sessions left pending by a previous run");
        }
        Ok(failed)
    }

    // -----------------------------------------------------------------------
    // PKCE sessions
    // -----------------------------------------------------------------------

    /// Begin a PKCE login and return the URL the operator should open.
    pub async fn start_session(
        &self,
        provider: Provider,
        runtime: RuntimeKind,
    ) -> HarnessResult<StartedSession> {
        let plugin = self.plugin(provider);
        if !plugin.supports_callback_oauth() {
            return Err(HarnessError::validation(format!(
                "{provider} does not support callback OAuth; use native login or an API key"
            )));
        }
        let client = self.client(provider)?;

        let pkce = PkcePair::generate();
        let state = random_url_token(32);
        let redirect_uri = self.config.callback_url(provider);
        let authorize_url = plugin
            .authorize_url(client, &redirect_uri, &state, &pkce.challenge)
            .map_err(oauth_to_harness)?;

        let expires_at = Utc::now() + chrono_duration(SESSION_TTL);
        let session = auth_db::insert_auth_session(
            &self.pool,
            &NewAuthSession {
                provider,
                runtime,
                state: state.clone(),
                code_verifier: pkce.verifier,
                code_challenge: pkce.challenge,
                expires_at,
            },
        )
        .await?;

        insert_event(
            &self.pool,
            "auth_session_started",
            "auth_session",
            Some(session.id.to_string()),
            json!({ "provider": provider, "runtime": runtime, "expires_at": expires_at }),
        )
        .await?;
        info!(session_id = session.id, %provider, "started OAuth session");

        Ok(StartedSession {
            session_id: session.id,
            provider,
            runtime,
            state,
            authorize_url,
            expires_at,
        })
    }

    /// Finish a PKCE login from the provider's redirect.
    pub async fn handle_callback(
        &self,
        provider: Provider,
        state: &str,
        code: &str,
    ) -> HarnessResult<AuthTokenRecord> {
        let session = auth_db::get_auth_session_by_state(&self.pool, state)
            .await?
            .ok_or_else(|| HarnessError::validation("unknown OAuth state"))?;

        if session.provider != provider {
            return Err(HarnessError::validation(format!(
                "OAuth state belongs to {}, not {provider}",
                session.provider
            )));
        }
        match session.status {
            AuthSessionStatus::Pending => {}
            AuthSessionStatus::Completed => {
                return Err(HarnessError::validation("session already completed"));
            }
            AuthSessionStatus::Failed => {
                return Err(HarnessError::validation("session already failed"));
            }
        }
        if session.expires_at <= Utc::now() {
            self.fail_session(session.id, provider, "session expired").await?;
            return Err(HarnessError::auth(
                "session expired",
                Some("start a new OAuth session".to_string()),
            ));
        }

        let client = self.client(provider)?;
        let redirect_uri = self.config.callback_url(provider);
        let tokens = match self
            .plugin(provider)
            .exchange_code(client, &redirect_uri, code, &session.code_verifier)
            .await
        {
            Ok(tokens) => tokens,
            Err(e) => {
                let message = e.to_string();
                self.fail_session(session.id, provider, &message).await?;
                return Err(HarnessError::auth(
                    message,
                    Some("start a new OAuth session".to_string()),
                ));
            }
        };

        if auth_db::complete_auth_session(&self.pool, session.id).await? == 0 {
            return Err(HarnessError::validation("session already completed"));
        }
        let record = self.store_tokens(provider, TokenKind::Oauth, &tokens).await?;

        insert_event(
            &self.pool,
            "auth_session_completed",
            "auth_session",
            Some(session.id.to_string()),
            json!({ "provider": provider }),
        )
        .await?;
        info!(session_id = session.id, %provider, "OAuth session completed");
        Ok(record)
    }

    /// The provider redirected back with an error instead of a code.
    pub async fn reject_callback(
        &self,
        provider: Provider,
        state: &str,
        error: &str,
    ) -> HarnessResult<()> {
        let session = auth_db::get_auth_session_by_state(&self.pool, state)
            .await?
            .ok_or_else(|| HarnessError::validation("unknown OAuth state"))?;
        if session.provider != provider || session.status != AuthSessionStatus::Pending {
            return Err(HarnessError::validation("OAuth state is not pending for this provider"));
        }
        let reason = format!("provider returned error: {error}");
        self.fail_session(session.id, provider, &reason).await?;
        Ok(())
    }

    async fn fail_session(&self, id: i64, provider: Provider, reason: &str) -> anyhow::Result<()> {
        auth_db::fail_auth_session(&self.pool, id, reason).await?;
        insert_event(
            &self.pool,
            "auth_session_failed",
            "auth_session",
            Some(id.to_string()),
            json!({ "provider": provider, "reason": reason }),
        )
        .await?;
        warn!(session_id = id, %provider, reason, "OAuth session failed");
        Ok(())
    }

    async fn store_tokens(
        &self,
        provider: Provider,
        token_kind: TokenKind,
        tokens: &TokenSet,
    ) -> HarnessResult<AuthTokenRecord> {
        let access_token_enc = self.encrypt(&tokens.access_token)?;
        let refresh_token_enc = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.encrypt(t))
            .transpose()?;
        let expires_at = tokens
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
        let record = auth_db::upsert_auth_token(
            &self.pool,
            &TokenUpsert {
                provider,
                token_kind,
                access_token_enc,
                refresh_token_enc,
                expires_at,
                scope: tokens.scope.clone(),
            },
        )
        .await?;
        Ok(record)
    }

    fn encrypt(&self, plaintext: &str) -> HarnessResult<String> {
        self.cipher
            .encrypt(plaintext)
            .map_err(|e| HarnessError::Internal(anyhow::anyhow!(e)))
    }

    // -----------------------------------------------------------------------
    // Static credentials
    // -----------------------------------------------------------------------

    /// Store an API key, bypassing PKCE.
    pub async fn store_credential(
        &self,
        provider: Provider,
        api_key: &str,
    ) -> HarnessResult<AuthTokenRecord> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(HarnessError::validation("api_key must not be empty"));
        }
        let record = self
            .store_tokens(
                provider,
                TokenKind::ApiKey,
                &TokenSet {
                    access_token: api_key.to_string(),
                    refresh_token: None,
                    expires_in: None,
                    scope: None,
                },
            )
            .await?;
        insert_event(
            &self.pool,
            "credential_stored",
            "provider",
            Some(provider.to_string()),
            json!({ "token_kind": TokenKind::ApiKey }),
        )
        .await?;
        info!(%provider, "stored API key");
        Ok(record)
    }

    /// Remove the stored credential and any grants minted from it.
    /// Returns whether anything was stored.
    pub async fn clear_credential(&self, provider: Provider) -> HarnessResult<bool> {
        let removed = auth_db::delete_auth_token(&self.pool, provider).await? > 0;
        self.grants
            .lock()
            .await
            .retain(|_, grant| grant.provider != provider);
        insert_event(
            &self.pool,
            "credential_cleared",
            "provider",
            Some(provider.to_string()),
            json!({ "removed": removed }),
        )
        .await?;
        Ok(removed)
    }

    pub async fn has_stored_token(&self, provider: Provider) -> anyhow::Result<bool> {
        Ok(auth_db::get_auth_token(&self.pool, provider).await?.is_some())
    }

    pub async fn provider_status(&self, provider: Provider) -> anyhow::Result<ProviderAuthStatus> {
        let record = auth_db::get_auth_token(&self.pool, provider).await?;
        Ok(ProviderAuthStatus {
            provider,
            stored: record.is_some(),
            token_kind: record.as_ref().map(|r| r.token_kind),
            expires_at: record.as_ref().and_then(|r| r.expires_at),
            scope: record.as_ref().and_then(|r| r.scope.clone()),
            updated_at: record.as_ref().map(|r| r.updated_at),
            oauth_supported: self.supports_callback_oauth(provider),
            oauth_client_configured: self.config.oauth_clients.contains_key(&provider),
        })
    }

    // -----------------------------------------------------------------------
    // Runtime grants
    // -----------------------------------------------------------------------

    /// Issue a one-time handle on the stored credential for `run_id`.
    pub async fn mint_runtime_grant(
        &self,
        run_id: i64,
        provider: Provider,
    ) -> HarnessResult<IssuedGrant> {
        let record = auth_db::get_auth_token(&self.pool, provider)
            .await?
            .ok_or_else(|| {
                HarnessError::auth(
                    format!("no stored credential for {provider}"),
                    Some(format!(
                        "store an API key (PUT /auth/providers/{provider}/api-key) or complete an OAuth login"
                    )),
                )
            })?;
        let secret = self.usable_access_token(&record)?;

        let token = format!("{GRANT_PREFIX}{}", random_url_token(24));
        let expires_at = Utc::now() + chrono_duration(self.grant_ttl);
        {
            let mut grants = self.grants.lock().await;
            let now = Utc::now();
            grants.retain(|_, grant| grant.expires_at > now);
            grants.insert(
                token.clone(),
                PendingGrant {
                    provider,
                    run_id,
                    secret,
                    expires_at,
                },
            );
        }

        insert_event(
            &self.pool,
            "runtime_grant_minted",
            "run",
            Some(run_id.to_string()),
            json!({ "provider": provider, "expires_at": expires_at }),
        )
        .await?;

        Ok(IssuedGrant {
            token,
            provider,
            run_id,
            expires_at,
        })
    }

    /// Redeem a grant. Each grant works exactly once and only before it
    /// expires.
    pub async fn consume_runtime_grant(&self, token: &str) -> HarnessResult<ConsumedGrant> {
        let grant = self
            .grants
            .lock()
            .await
            .remove(token)
            .ok_or_else(|| HarnessError::auth("grant not found", None))?;

        if grant.expires_at <= Utc::now() {
            return Err(HarnessError::auth(
                "grant expired",
                Some("runtime grants are valid for 60 seconds after minting".to_string()),
            ));
        }

        insert_event(
            &self.pool,
            "runtime_grant_consumed",
            "run",
            Some(grant.run_id.to_string()),
            json!({ "provider": grant.provider }),
        )
        .await?;

        Ok(ConsumedGrant {
            provider: grant.provider,
            run_id: grant.run_id,
            secret: grant.secret,
        })
    }

    /// Decrypt the access token. An expired OAuth token needs a new login.
    fn usable_access_token(&self, record: &AuthTokenRecord) -> HarnessResult<String> {
        let provider = record.provider;
        let expired = record.expires_at.is_some_and(|at| at <= Utc::now());
        if record.token_kind == TokenKind::Oauth && expired {
            return Err(HarnessError::auth(
                format!("OAuth token for {provider} has expired"),
                Some(format!(
                    "start a new OAuth session (POST /auth/sessions) or PUT /auth/providers/{provider}/api-key"
                )),
            ));
        }
        self.decrypt(provider, &record.access_token_enc)
    }

    fn decrypt(&self, provider: Provider, stored: &str) -> HarnessResult<String> {
        self.cipher.decrypt(stored).map_err(|e| {
            HarnessError::auth(
                format!("stored credential for {provider} is unusable: {e}"),
                Some("store the credential again; the encryption key may have changed".to_string()),
            )
        })
    }
}

fn oauth_to_harness(err: OAuthError) -> HarnessError {
    match err {
        OAuthError::Unsupported { .. } | OAuthError::Endpoint(_) => {
            HarnessError::validation(err.to_string())
        }
        OAuthError::Exchange(_) => HarnessError::auth(err.to_string(), None),
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
