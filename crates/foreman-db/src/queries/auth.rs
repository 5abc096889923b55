//! Database query functions for OAuth sessions and encrypted tokens.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{AuthSession, AuthTokenRecord, Provider, RuntimeKind, TokenKind};

/// Fields for a new PKCE session.
#[derive(Debug, Clone)]
pub struct NewAuthSession {
    pub provider: Provider,
    pub runtime: RuntimeKind,
    pub state: String,
    pub code_verifier: String,
    pub code_challenge: String,
    pub expires_at: DateTime<Utc>,
}

/// Persist a pending PKCE session.
pub async fn insert_auth_session(pool: &SqlitePool, new: &NewAuthSession) -> Result<AuthSession> {
    let session = sqlx::query_as::<_, AuthSession>(
        "INSERT INTO auth_sessions \
         (provider, runtime, state, code_verifier, code_challenge, status, created_at, expires_at) \
         VALUES (?, ?, ?, ?, ?, 'pending', ?, ?) \
         RETURNING *",
    )
    .bind(new.provider)
    .bind(new.runtime)
    .bind(&new.state)
    .bind(&new.code_verifier)
    .bind(&new.code_challenge)
    .bind(Utc::now())
    .bind(new.expires_at)
    .fetch_one(pool)
    .await
    .context("failed to insert auth session")?;

    Ok(session)
}

/// Look up a session by its state token.
pub async fn get_auth_session_by_state(
    pool: &SqlitePool,
    state: &str,
) -> Result<Option<AuthSession>> {
    let session = sqlx::query_as::<_, AuthSession>("SELECT * FROM auth_sessions WHERE state = ?")
        .bind(state)
        .fetch_optional(pool)
        .await
        .context("failed to fetch auth session")?;

    Ok(session)
}

/// `pending -> completed`. Returns rows affected.
pub async fn complete_auth_session(pool: &SqlitePool, id: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE auth_sessions SET status = 'completed', error = NULL \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to complete auth session")?;

    Ok(result.rows_affected())
}

/// `pending -> failed` with a reason. Returns rows affected.
pub async fn fail_auth_session(pool: &SqlitePool, id: i64, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE auth_sessions SET status = 'failed', error = ? \
         WHERE id = ? AND status = 'pending'",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to fail auth session")?;

    Ok(result.rows_affected())
}

/// Fail every pending session. Used when a broker starts: logins begun by
/// a previous process are restarted by the caller, never resumed.
pub async fn fail_pending_auth_sessions(pool: &SqlitePool, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE auth_sessions SET status = 'failed', error = ? WHERE status = 'pending'",
    )
    .bind(reason)
    .execute(pool)
    .await
    .context("failed to fail pending auth sessions")?;

    Ok(result.rows_affected())
}

/// Encrypted token material for one provider.
#[derive(Debug, Clone)]
pub struct TokenUpsert {
    pub provider: Provider,
    pub token_kind: TokenKind,
    pub access_token_enc: String,
    pub refresh_token_enc: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

/// Insert or replace the token record for a provider.
pub async fn upsert_auth_token(pool: &SqlitePool, token: &TokenUpsert) -> Result<AuthTokenRecord> {
    let record = sqlx::query_as::<_, AuthTokenRecord>(
        "INSERT INTO auth_tokens \
         (provider, token_kind, access_token_enc, refresh_token_enc, expires_at, scope, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (provider) DO UPDATE SET \
             token_kind = excluded.token_kind, \
             access_token_enc = excluded.access_token_enc, \
             refresh_token_enc = excluded.refresh_token_enc, \
             expires_at = excluded.expires_at, scope = excluded.scope, \
             updated_at = excluded.updated_at \
         RETURNING *",
    )
    .bind(token.provider)
    .bind(token.token_kind)
    .bind(&token.access_token_enc)
    .bind(&token.refresh_token_enc)
    .bind(token.expires_at)
    .bind(&token.scope)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to store token for {}", token.provider))?;

    Ok(record)
}

/// Fetch the token record for a provider.
pub async fn get_auth_token(
    pool: &SqlitePool,
    provider: Provider,
) -> Result<Option<AuthTokenRecord>> {
    let record =
        sqlx::query_as::<_, AuthTokenRecord>("SELECT * FROM auth_tokens WHERE provider = ?")
            .bind(provider)
            .fetch_optional(pool)
            .await
            .context("failed to fetch auth token")?;

    Ok(record)
}

/// Delete the token record for a provider. Returns rows affected.
pub async fn delete_auth_token(pool: &SqlitePool, provider: Provider) -> Result<u64> {
    let result = sqlx::query("DELETE FROM auth_tokens WHERE provider = ?")
        .bind(provider)
        .execute(pool)
        .await
        .context("failed to delete auth token")?;

    Ok(result.rows_affected())
}
