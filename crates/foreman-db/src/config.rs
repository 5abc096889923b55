use std::env;
use std::path::{Path, PathBuf};

/// Database configuration.
///
/// Reads from the `FOREMAN_DATABASE_URL` environment variable, falling back
/// to a `foreman.db` file inside the data directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full SQLite connection URL (`sqlite://<path>`).
    pub database_url: String,
}

impl DbConfig {
    /// File name of the database inside the data directory.
    pub const DEFAULT_FILE: &str = "foreman.db";

    /// Build a config from the environment.
    ///
    /// Priority: `FOREMAN_DATABASE_URL`, then `FOREMAN_DATA_DIR/foreman.db`,
    /// then the platform data directory.
    pub fn from_env() -> Self {
        if let Ok(url) = env::var("FOREMAN_DATABASE_URL") {
            return Self::new(url);
        }
        let data_dir = env::var("FOREMAN_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());
        Self::for_data_dir(&data_dir)
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }

    /// Point at `foreman.db` inside `data_dir`.
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self::for_file(&data_dir.join(Self::DEFAULT_FILE))
    }

    /// Point at an explicit database file.
    pub fn for_file(path: &Path) -> Self {
        Self::new(format!("sqlite://{}", path.display()))
    }

    /// Filesystem path of the database, if the URL names a file.
    ///
    /// Returns `None` for in-memory databases.
    pub fn database_path(&self) -> Option<PathBuf> {
        let rest = self
            .database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))?;
        let path = rest.split('?').next().unwrap_or(rest);
        if path.is_empty() || path == ":memory:" {
            return None;
        }
        Some(PathBuf::from(path))
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Platform data directory for foreman (`~/.local/share/foreman` on Linux).
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("foreman")
}
