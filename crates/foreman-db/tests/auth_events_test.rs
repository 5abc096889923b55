//! Integration tests for auth session/token storage and the event log.

use chrono::{Duration, Utc};
use foreman_db::models::{AuthSessionStatus, Provider, RuntimeKind, TokenKind};
use foreman_db::queries::auth::{self, NewAuthSession, TokenUpsert};
use foreman_db::queries::events;
use foreman_test_utils::{create_test_db, drop_test_db};

fn session(state: &str) -> NewAuthSession {
    NewAuthSession {
        provider: Provider::Gemini,
        runtime: RuntimeKind::Host,
        state: state.into(),
        code_verifier: "verifier".into(),
        code_challenge: "challenge".into(),
        expires_at: Utc::now() + Duration::minutes(15),
    }
}

#[tokio::test]
async fn session_completes_once() {
    let (pool, dir) = create_test_db().await;

    let created = auth::insert_auth_session(&pool, &session("abc")).await.unwrap();
    assert_eq!(created.status, AuthSessionStatus::Pending);

    assert_eq!(auth::complete_auth_session(&pool, created.id).await.unwrap(), 1);
    assert_eq!(auth::complete_auth_session(&pool, created.id).await.unwrap(), 0);

    let fetched = auth::get_auth_session_by_state(&pool, "abc").await.unwrap().unwrap();
    assert_eq!(fetched.status, AuthSessionStatus::Completed);

    drop_test_db(pool, dir).await;
}

#[tokio::test]
async fn pending_sessions_fail_in_bulk() {
    let (pool, dir) = create_test_db().await;

    auth::insert_auth_session(&pool, &session("one")).await.unwrap();
    auth::insert_auth_session(&pool, &session("two")).await.unwrap();

    let failed = auth::fail_pending_auth_sessions(&pool, "restart").await.unwrap();
    assert_eq!(failed, 2);
    let s = auth::get_auth_session_by_state(&pool, "one").await.unwrap().unwrap();
    assert_eq!(s.status, AuthSessionStatus::Failed);
    assert_eq!(s.error.as_deref(), Some("restart"));

    drop_test_db(pool, dir).await;
}

#[tokio::test]
async fn token_upsert_replaces_per_provider() {
    let (pool, dir) = create_test_db().await;

    let mut token = TokenUpsert {
        provider: Provider::Codex,
        token_kind: TokenKind::ApiKey,
        access_token_enc: "ciphertext-1".into(),
        refresh_token_enc: None,
        expires_at: None,
        scope: None,
    };
    auth::upsert_auth_token(&pool, &token).await.unwrap();
    token.access_token_enc = "ciphertext-2".into();
    token.token_kind = TokenKind::Oauth;
    auth::upsert_auth_token(&pool, &token).await.unwrap();

    let stored = auth::get_auth_token(&pool, Provider::Codex).await.unwrap().unwrap();
    assert_eq!(stored.access_token_enc, "ciphertext-2");
    assert_eq!(stored.token_kind, TokenKind::Oauth);

    assert_eq!(auth::delete_auth_token(&pool, Provider::Codex).await.unwrap(), 1);
    assert!(auth::get_auth_token(&pool, Provider::Codex).await.unwrap().is_none());

    drop_test_db(pool, dir).await;
}

#[tokio::test]
async fn events_page_newest_first() {
    let (pool, dir) = create_test_db().await;

    for i in 0..5 {
        events::insert_event(
            &pool,
            "test_event",
            "test",
            Some(i.to_string()),
            serde_json::json!({ "i": i }),
        )
        .await
        .unwrap();
    }

    let page = events::list_events(&pool, 2, None).await.unwrap();
    assert_eq!(page.len(), 2);
    assert!(page[0].id > page[1].id);

    let next = events::list_events(&pool, 2, Some(page[1].id)).await.unwrap();
    assert_eq!(next.len(), 2);
    assert!(next[0].id < page[1].id);

    let rest = events::list_events(&pool, 100, Some(next[1].id)).await.unwrap();
    assert_eq!(rest.len(), 1);

    assert_eq!(events::count_events_of_type(&pool, "test_event").await.unwrap(), 5);

    drop_test_db(pool, dir).await;
}
