//! Configuration file management for foreman.
//!
//! Provides a TOML-based config file at `~/.config/foreman/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default. The file
//! only carries paths, the encryption secret and the listen address; every
//! other knob comes from `FOREMAN_*` variables. File values feed the same
//! names the environment does, so [`HarnessConfig::from_lookup`] stays the
//! single parser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use foreman_core::HarnessConfig;
use foreman_core::config::DEFAULT_PORT;

/// Address `serve` binds when nothing else is configured.
pub const DEFAULT_BIND: &str = "127.0.0.1";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub harness: HarnessSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct HarnessSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    /// Secret the token encryption key is derived from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl HarnessSection {
    /// The section as `FOREMAN_*` variables.
    fn vars(&self) -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();
        let mut put = |name: &'static str, value: Option<String>| {
            if let Some(value) = value {
                vars.insert(name, value);
            }
        };
        put("FOREMAN_DATA_DIR", self.data_dir.clone());
        put("FOREMAN_DATABASE_URL", self.database_url.clone());
        put("FOREMAN_ENCRYPTION_KEY", self.encryption_key.clone());
        vars
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the foreman config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/foreman` or `~/.config/foreman`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("foreman");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("foreman")
}

/// Return the path to the foreman config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Load the config file if it exists. A file that exists but does not
/// parse is an error.
pub fn load_optional_config(path: &Path) -> Result<ConfigFile> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(ConfigFile::default())
    }
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Secret generation
// -----------------------------------------------------------------------

/// Generate an encryption secret: 32 random bytes, hex-encoded (64 chars).
pub fn generate_encryption_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub data_dir: Option<String>,
    pub database_url: Option<String>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub harness: HarnessConfig,
    pub bind: String,
    pub port: u16,
}

impl ResolvedConfig {
    /// Resolve from the real environment and the default config file.
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = load_optional_config(&config_path())?;
        Self::resolve_with(cli, |name| std::env::var(name).ok(), &file)
    }

    /// Resolve with an explicit environment source.
    ///
    /// - Harness variables: `cli` > `env` > `file.harness` > built-in default.
    /// - Server port: `FOREMAN_PORT` env > `file.server.port` > [`DEFAULT_PORT`].
    ///   The OAuth callback port follows the server port unless
    ///   `FOREMAN_OAUTH_CALLBACK_PORT` is set.
    pub fn resolve_with(
        cli: &CliOverrides,
        env: impl Fn(&str) -> Option<String>,
        file: &ConfigFile,
    ) -> Result<Self> {
        let mut flags: HashMap<&'static str, String> = HashMap::new();
        if let Some(dir) = &cli.data_dir {
            flags.insert("FOREMAN_DATA_DIR", dir.clone());
        }
        if let Some(url) = &cli.database_url {
            flags.insert("FOREMAN_DATABASE_URL", url.clone());
        }
        let file_vars = file.harness.vars();

        let lookup = |name: &str| {
            flags
                .get(name)
                .cloned()
                .or_else(|| env(name))
                .or_else(|| file_vars.get(name).cloned())
        };
        let mut harness = HarnessConfig::from_lookup(lookup)?;

        let port = match env("FOREMAN_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("invalid FOREMAN_PORT: {raw:?}"))?,
            None => file.server.port.unwrap_or(DEFAULT_PORT),
        };
        if env("FOREMAN_OAUTH_CALLBACK_PORT").is_none() {
            harness.oauth_callback_port = port;
        }
        let bind = env("FOREMAN_BIND")
            .or_else(|| file.server.bind.clone())
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        Ok(Self {
            harness,
            bind,
            port,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn generate_encryption_key_is_64_hex_chars() {
        let key = generate_encryption_key();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()), "{key}");
        assert_ne!(key, generate_encryption_key());
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        save_config(&path, &ConfigFile::default()).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn missing_file_is_empty_but_broken_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        assert!(load_optional_config(&path).unwrap().harness.data_dir.is_none());

        std::fs::write(&path, "[harness\nbroken").unwrap();
        assert!(load_optional_config(&path).is_err());
    }

    #[test]
    fn cli_flag_beats_env_and_file() {
        let file = ConfigFile {
            harness: HarnessSection {
                database_url: Some("sqlite:///file.db".into()),
                ..HarnessSection::default()
            },
            ..ConfigFile::default()
        };
        let cli = CliOverrides {
            database_url: Some("sqlite:///cli.db".into()),
            ..CliOverrides::default()
        };
        let resolved = ResolvedConfig::resolve_with(
            &cli,
            env_of(&[("FOREMAN_DATABASE_URL", "sqlite:///env.db")]),
            &file,
        )
        .unwrap();
        assert_eq!(resolved.harness.database.database_url, "sqlite:///cli.db");
    }

    #[test]
    fn env_beats_file() {
        let file = ConfigFile {
            harness: HarnessSection {
                data_dir: Some("/srv/from-file".into()),
                encryption_key: Some("from-file".into()),
                ..HarnessSection::default()
            },
            ..ConfigFile::default()
        };
        let resolved = ResolvedConfig::resolve_with(
            &CliOverrides::default(),
            env_of(&[
                ("FOREMAN_DATA_DIR", "/srv/from-env"),
                ("FOREMAN_MAX_PARALLEL_RUNS", "3"),
            ]),
            &file,
        )
        .unwrap();
        assert_eq!(resolved.harness.data_dir, PathBuf::from("/srv/from-env"));
        assert_eq!(resolved.harness.max_parallel_runs, 3);
        assert_eq!(resolved.harness.encryption_key, "from-file");
        assert!(!resolved.harness.uses_dev_encryption_key());
    }

    #[test]
    fn server_defaults_and_callback_port_follow_port() {
        let resolved =
            ResolvedConfig::resolve_with(&CliOverrides::default(), env_of(&[]), &ConfigFile::default())
                .unwrap();
        assert_eq!(resolved.bind, DEFAULT_BIND);
        assert_eq!(resolved.port, DEFAULT_PORT);

        let file = ConfigFile {
            server: ServerSection {
                bind: Some("0.0.0.0".into()),
                port: Some(8123),
            },
            ..ConfigFile::default()
        };
        let resolved =
            ResolvedConfig::resolve_with(&CliOverrides::default(), env_of(&[]), &file).unwrap();
        assert_eq!(resolved.bind, "0.0.0.0");
        assert_eq!(resolved.harness.oauth_callback_port, 8123);

        let err = ResolvedConfig::resolve_with(
            &CliOverrides::default(),
            env_of(&[("FOREMAN_PORT", "http")]),
            &ConfigFile::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("FOREMAN_PORT"));
    }
}
