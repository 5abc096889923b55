//! Shared test utilities for foreman integration tests.
//!
//! Every test gets its own SQLite file inside a fresh temporary directory,
//! with all migrations applied. The directory is removed when the returned
//! [`TempDir`] is dropped.

use sqlx::SqlitePool;
use tempfile::TempDir;

use foreman_db::config::DbConfig;
use foreman_db::pool;

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, dir)`. Keep `dir` alive for as long as the pool is in
/// use, then hand both to [`drop_test_db`].
pub async fn create_test_db() -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().expect("failed to create temp dir for test database");
    let config = DbConfig::for_data_dir(dir.path());

    let pool = pool::create_pool(&config)
        .await
        .unwrap_or_else(|e| panic!("failed to open test database {}: {e}", config.database_url));

    pool::run_migrations(&pool)
        .await
        .expect("migrations should succeed");

    (pool, dir)
}

/// Close the pool and remove the temporary database directory.
pub async fn drop_test_db(pool: SqlitePool, dir: TempDir) {
    pool.close().await;
    drop(dir);
}
