//! OAuth provider plugins.
//!
//! The provider set is closed ([`Provider`]); each maps to one plugin.
//! Gemini (Google) and Codex (OpenAI) speak the standard
//! authorization-code flow with PKCE. Claude and OpenCode log in through
//! their own CLIs, so their plugin refuses every OAuth operation with a
//! typed error instead of special-casing them in the broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;

use foreman_db::models::Provider;

use crate::config::OAuthClient;

/// Errors from a provider plugin.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("{provider} does not support {operation}")]
    Unsupported {
        provider: Provider,
        operation: &'static str,
    },

    #[error("invalid OAuth endpoint: {0}")]
    Endpoint(String),

    #[error("token exchange failed: {0}")]
    Exchange(String),
}

/// Tokens returned by a successful code exchange.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until `access_token` expires.
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Provider-specific half of the OAuth flow.
#[async_trait]
pub trait ProviderPlugin: Send + Sync {
    fn provider(&self) -> Provider;

    /// Whether the browser-callback flow is available at all.
    fn supports_callback_oauth(&self) -> bool;

    fn authorize_url(
        &self,
        client: &OAuthClient,
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> Result<String, OAuthError>;

    async fn exchange_code(
        &self,
        client: &OAuthClient,
        redirect_uri: &str,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenSet, OAuthError>;
}

// Compile-time assertion: ProviderPlugin must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ProviderPlugin) {}
};

/// The built-in plugin for `provider`.
pub fn plugin_for(provider: Provider) -> Arc<dyn ProviderPlugin> {
    match provider {
        Provider::Gemini => Arc::new(StandardOAuthPlugin::google()),
        Provider::Codex => Arc::new(StandardOAuthPlugin::openai()),
        Provider::Claude | Provider::Opencode => Arc::new(UnsupportedPlugin::new(provider)),
    }
}

// ---------------------------------------------------------------------------
// Standard authorization-code plugin
// ---------------------------------------------------------------------------

/// Authorization-code + PKCE against fixed endpoints.
#[derive(Debug, Clone)]
pub struct StandardOAuthPlugin {
    provider: Provider,
    authorize_endpoint: String,
    token_endpoint: String,
    scopes: Vec<String>,
    extra_params: Vec<(String, String)>,
    http: reqwest::Client,
}

impl StandardOAuthPlugin {
    pub fn new(
        provider: Provider,
        authorize_endpoint: impl Into<String>,
        token_endpoint: impl Into<String>,
        scopes: &[&str],
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            provider,
            authorize_endpoint: authorize_endpoint.into(),
            token_endpoint: token_endpoint.into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            extra_params: Vec::new(),
            http,
        }
    }

    /// Google accounts, as used by the Gemini CLI.
    pub fn google() -> Self {
        let mut plugin = Self::new(
            Provider::Gemini,
            "https://accounts.google.com/o/oauth2/v2/auth",
            "https://oauth2.googleapis.com/token",
            &[
                "openid",
                "email",
                "https://www.googleapis.com/auth/cloud-platform",
            ],
        );
        plugin.extra_params = vec![
            ("access_type".into(), "offline".into()),
            ("prompt".into(), "consent".into()),
        ];
        plugin
    }

    /// OpenAI accounts, as used by the Codex CLI.
    pub fn openai() -> Self {
        Self::new(
            Provider::Codex,
            "https://auth.openai.com/oauth/authorize",
            "https://auth.openai.com/oauth/token",
            &["openid", "profile", "email", "offline_access"],
        )
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<TokenSet, OAuthError> {
        let response = self
            .http
            .post(&self.token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| OAuthError::Exchange(format!("request to token endpoint failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(OAuthError::Exchange(format!("{status}: {snippet}")));
        }

        response
            .json::<TokenSet>()
            .await
            .map_err(|e| OAuthError::Exchange(format!("unreadable token response: {e}")))
    }
}

#[async_trait]
impl ProviderPlugin for StandardOAuthPlugin {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn supports_callback_oauth(&self) -> bool {
        true
    }

    fn authorize_url(
        &self,
        client: &OAuthClient,
        redirect_uri: &str,
        state: &str,
        code_challenge: &str,
    ) -> Result<String, OAuthError> {
        let scope = self.scopes.join(" ");
        let mut params: Vec<(&str, &str)> = vec![
            ("response_type", "code"),
            ("client_id", &client.client_id),
            ("redirect_uri", redirect_uri),
            ("scope", &scope),
            ("state", state),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "S256"),
        ];
        for (key, value) in &self.extra_params {
            params.push((key.as_str(), value.as_str()));
        }
        let url = Url::parse_with_params(&self.authorize_endpoint, &params)
            .map_err(|e| OAuthError::Endpoint(format!("{}: {e}", self.authorize_endpoint)))?;
        Ok(url.to_string())
    }

    async fn exchange_code(
        &self,
        client: &OAuthClient,
        redirect_uri: &str,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenSet, OAuthError> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        self.token_request(&form).await
    }
}

// ---------------------------------------------------------------------------
// Unsupported stub
// ---------------------------------------------------------------------------

/// Plugin for providers that only log in through their own CLI.
#[derive(Debug, Clone, Copy)]
pub struct UnsupportedPlugin {
    provider: Provider,
}

impl UnsupportedPlugin {
    pub fn new(provider: Provider) -> Self {
        Self { provider }
    }

    fn refuse(&self, operation: &'static str) -> OAuthError {
        OAuthError::Unsupported {
            provider: self.provider,
            operation,
        }
    }
}

#[async_trait]
impl ProviderPlugin for UnsupportedPlugin {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn supports_callback_oauth(&self) -> bool {
        false
    }

    fn authorize_url(
        &self,
        _client: &OAuthClient,
        _redirect_uri: &str,
        _state: &str,
        _code_challenge: &str,
    ) -> Result<String, OAuthError> {
        Err(self.refuse("callback OAuth"))
    }

    async fn exchange_code(
        &self,
        _client: &OAuthClient,
        _redirect_uri: &str,
        _code: &str,
        _code_verifier: &str,
    ) -> Result<TokenSet, OAuthError> {
        Err(self.refuse("OAuth code exchange"))
    }
}
