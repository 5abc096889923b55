//! Harness configuration, read from `FOREMAN_*` environment variables.
//!
//! One [`HarnessConfig`] value is built at startup and handed to every
//! component; nothing reads the environment after that.

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use foreman_db::config::{DbConfig, default_data_dir};
use foreman_db::models::{Complexity, Provider, RuntimeKind};

use crate::dispatcher::FailurePolicy;
use crate::guard::GuardMode;

/// Encryption secret used when `FOREMAN_ENCRYPTION_KEY` is unset.
///
/// Tokens encrypted with it are only as safe as this source file.
pub const DEV_ENCRYPTION_KEY: &str = "foreman-dev-encryption-key-change-me";

/// Port the HTTP API listens on by default; the OAuth callback shares it.
pub const DEFAULT_PORT: u16 = 7420;

/// OAuth client registration for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: Option<String>,
}

/// Everything the harness needs to know about its environment.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub data_dir: PathBuf,
    pub database: DbConfig,
    pub uploads_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Root under which native CLI credential directories live.
    pub auth_home: PathBuf,
    pub queue_dir: PathBuf,
    /// Directory agents run in (mounted at `/workspace` under docker).
    pub project_path: PathBuf,
    pub poll_interval: Duration,
    pub max_parallel_runs: usize,
    pub default_runtime: RuntimeKind,
    pub default_complexity: Complexity,
    pub prompt_injection_mode: GuardMode,
    pub oauth_callback_host: String,
    pub oauth_callback_port: u16,
    pub encryption_key: String,
    pub docker_image: String,
    pub max_upload_bytes: usize,
    pub oauth_clients: HashMap<Provider, OAuthClient>,
    pub failure_policy: FailurePolicy,
}

impl HarnessConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    ///
    /// Unset variables take their defaults; set but unparsable ones are
    /// errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = lookup("FOREMAN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let mut config = Self::for_data_dir(&data_dir);

        config.database = match lookup("FOREMAN_DATABASE_URL") {
            Some(url) => DbConfig::new(url),
            None => DbConfig::for_data_dir(&data_dir),
        };
        config.auth_home = dirs::home_dir().unwrap_or_else(|| data_dir.clone());
        config.project_path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

        let path_var = |name: &str, slot: &mut PathBuf| {
            if let Some(value) = lookup(name) {
                *slot = PathBuf::from(value);
            }
        };
        path_var("FOREMAN_UPLOADS_DIR", &mut config.uploads_dir);
        path_var("FOREMAN_ARTIFACTS_DIR", &mut config.artifacts_dir);
        path_var("FOREMAN_LOGS_DIR", &mut config.logs_dir);
        path_var("FOREMAN_AUTH_HOME", &mut config.auth_home);
        path_var("FOREMAN_QUEUE_DIR", &mut config.queue_dir);
        path_var("FOREMAN_PROJECT_PATH", &mut config.project_path);

        if let Some(ms) = parse_var::<u64>(&lookup, "FOREMAN_POLL_INTERVAL_MS")? {
            if ms == 0 {
                return Err(anyhow!("FOREMAN_POLL_INTERVAL_MS must be greater than 0"));
            }
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "FOREMAN_MAX_PARALLEL_RUNS")? {
            if n == 0 {
                return Err(anyhow!("FOREMAN_MAX_PARALLEL_RUNS must be at least 1"));
            }
            config.max_parallel_runs = n;
        }
        if let Some(runtime) = parse_var(&lookup, "FOREMAN_DEFAULT_RUNTIME")? {
            config.default_runtime = runtime;
        }
        if let Some(complexity) = parse_var(&lookup, "FOREMAN_DEFAULT_COMPLEXITY")? {
            config.default_complexity = complexity;
        }
        if let Some(mode) = parse_var(&lookup, "FOREMAN_PROMPT_INJECTION_MODE")? {
            config.prompt_injection_mode = mode;
        }
        if let Some(host) = lookup("FOREMAN_OAUTH_CALLBACK_HOST") {
            config.oauth_callback_host = host;
        }
        if let Some(port) = parse_var(&lookup, "FOREMAN_OAUTH_CALLBACK_PORT")? {
            config.oauth_callback_port = port;
        }
        if let Some(key) = lookup("FOREMAN_ENCRYPTION_KEY").filter(|k| !k.is_empty()) {
            config.encryption_key = key;
        }
        if let Some(image) = lookup("FOREMAN_DOCKER_IMAGE") {
            config.docker_image = image;
        }
        if let Some(bytes) = parse_var(&lookup, "FOREMAN_MAX_UPLOAD_BYTES")? {
            config.max_upload_bytes = bytes;
        }
        if let Some(depth) = parse_var(&lookup, "FOREMAN_MAX_REMEDIATION_DEPTH")? {
            config.failure_policy.max_remediation_depth = depth;
        }
        if let Some(spawn) = parse_var(&lookup, "FOREMAN_SPAWN_REMEDIATION")? {
            config.failure_policy.spawn_remediation = spawn;
        }

        for provider in Provider::ALL {
            let prefix = format!("FOREMAN_OAUTH_{}", provider.as_str().to_uppercase());
            if let Some(client_id) = lookup(&format!("{prefix}_CLIENT_ID")).filter(|v| !v.is_empty())
            {
                let client_secret =
                    lookup(&format!("{prefix}_CLIENT_SECRET")).filter(|v| !v.is_empty());
                config.oauth_clients.insert(
                    *provider,
                    OAuthClient {
                        client_id,
                        client_secret,
                    },
                );
            }
        }

        Ok(config)
    }

    /// Defaults with every directory rooted under `data_dir`.
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            database: DbConfig::for_data_dir(data_dir),
            uploads_dir: data_dir.join("uploads"),
            artifacts_dir: data_dir.join("artifacts"),
            logs_dir: data_dir.join("logs"),
            auth_home: data_dir.join("auth-home"),
            queue_dir: data_dir.join("queue"),
            project_path: data_dir.join("project"),
            poll_interval: Duration::from_secs(2),
            max_parallel_runs: 2,
            default_runtime: RuntimeKind::Host,
            default_complexity: Complexity::Simple,
            prompt_injection_mode: GuardMode::Block,
            oauth_callback_host: "127.0.0.1".to_string(),
            oauth_callback_port: DEFAULT_PORT,
            encryption_key: DEV_ENCRYPTION_KEY.to_string(),
            docker_image: "foreman-agent:latest".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
            oauth_clients: HashMap::new(),
            failure_policy: FailurePolicy::default(),
        }
    }

    /// `true` while the built-in development secret is in use.
    pub fn uses_dev_encryption_key(&self) -> bool {
        self.encryption_key == DEV_ENCRYPTION_KEY
    }

    /// Redirect URI registered with the provider's OAuth client.
    pub fn callback_url(&self, provider: Provider) -> String {
        format!(
            "http://{}:{}/auth/callback/{}",
            self.oauth_callback_host, self.oauth_callback_port, provider
        )
    }

    /// Create every directory the harness writes to.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.data_dir,
            &self.uploads_dir,
            &self.artifacts_dir,
            &self.logs_dir,
            &self.queue_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("invalid {name}={raw:?}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<HarnessConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HarnessConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_hang_off_data_dir() {
        let config = from_pairs(&[("FOREMAN_DATA_DIR", "/srv/foreman")]).unwrap();
        assert_eq!(config.uploads_dir, PathBuf::from("/srv/foreman/uploads"));
        assert_eq!(config.logs_dir, PathBuf::from("/srv/foreman/logs"));
        assert_eq!(
            config.database.database_path(),
            Some(PathBuf::from("/srv/foreman/foreman.db"))
        );
        assert_eq!(config.max_parallel_runs, 2);
        assert_eq!(config.default_complexity, Complexity::Simple);
        assert_eq!(config.prompt_injection_mode, GuardMode::Block);
        assert!(config.uses_dev_encryption_key());
        assert!(config.oauth_clients.is_empty());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = from_pairs(&[
            ("FOREMAN_DATA_DIR", "/srv/foreman"),
            ("FOREMAN_DATABASE_URL", "sqlite:///tmp/other.db"),
            ("FOREMAN_POLL_INTERVAL_MS", "250"),
            ("FOREMAN_MAX_PARALLEL_RUNS", "4"),
            ("FOREMAN_DEFAULT_RUNTIME", "docker"),
            ("FOREMAN_DEFAULT_COMPLEXITY", "complex"),
            ("FOREMAN_PROMPT_INJECTION_MODE", "warn"),
            ("FOREMAN_OAUTH_CALLBACK_PORT", "9000"),
            ("FOREMAN_ENCRYPTION_KEY", "s3cret"),
        ])
        .unwrap();
        assert_eq!(config.database.database_url, "sqlite:///tmp/other.db");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.max_parallel_runs, 4);
        assert_eq!(config.default_runtime, RuntimeKind::Docker);
        assert_eq!(config.default_complexity, Complexity::Complex);
        assert_eq!(config.prompt_injection_mode, GuardMode::Warn);
        assert_eq!(
            config.callback_url(Provider::Gemini),
            "http://127.0.0.1:9000/auth/callback/gemini"
        );
        assert!(!config.uses_dev_encryption_key());
    }

    #[test]
    fn invalid_values_are_errors() {
        assert!(from_pairs(&[("FOREMAN_MAX_PARALLEL_RUNS", "lots")]).is_err());
        assert!(from_pairs(&[("FOREMAN_MAX_PARALLEL_RUNS", "0")]).is_err());
        assert!(from_pairs(&[("FOREMAN_DEFAULT_RUNTIME", "vm")]).is_err());
        assert!(from_pairs(&[("FOREMAN_PROMPT_INJECTION_MODE", "loud")]).is_err());
    }

    #[test]
    fn oauth_clients_are_read_per_provider() {
        let config = from_pairs(&[
            ("FOREMAN_OAUTH_GEMINI_CLIENT_ID", "gem-id"),
            ("FOREMAN_OAUTH_GEMINI_CLIENT_SECRET", "gem-secret"),
            ("FOREMAN_OAUTH_CODEX_CLIENT_ID", "codex-id"),
        ])
        .unwrap();
        assert_eq!(
            config.oauth_clients.get(&Provider::Gemini),
            Some(&OAuthClient {
                client_id: "gem-id".into(),
                client_secret: Some("gem-secret".into()),
            })
        );
        assert_eq!(
            config.oauth_clients.get(&Provider::Codex).unwrap().client_secret,
            None
        );
        assert!(!config.oauth_clients.contains_key(&Provider::Claude));
    }
}
