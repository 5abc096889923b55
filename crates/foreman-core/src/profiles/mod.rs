//! Execution profile validation and bulk replace.

use std::collections::HashSet;

use sqlx::SqlitePool;

use foreman_db::models::AuthMode;
use foreman_db::queries::profiles::{ProfileSet, ProfileSnapshot, upsert_profiles};

use crate::agents::AgentRegistry;
use crate::auth::OAuthBroker;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};

/// Every problem with `set`, in payload order. Empty means valid.
pub fn validate_profile_set(
    set: &ProfileSet,
    registry: &AgentRegistry,
    config: &HarnessConfig,
    broker: &OAuthBroker,
) -> Vec<String> {
    let mut problems = Vec::new();

    let mut mcp_names = HashSet::new();
    for mcp in &set.mcp {
        if mcp.name.trim().is_empty() {
            problems.push("mcp profile name must not be empty".to_string());
        } else if !mcp_names.insert(mcp.name.as_str()) {
            problems.push(format!("duplicate mcp profile {}", mcp.name));
        }
    }

    let mut skill_names = HashSet::new();
    for skill in &set.skills {
        if skill.name.trim().is_empty() {
            problems.push("skill profile name must not be empty".to_string());
        } else if !skill_names.insert(skill.name.as_str()) {
            problems.push(format!("duplicate skill profile {}", skill.name));
        }
    }

    let mut keys = HashSet::new();
    for p in &set.execution {
        let key = format!("({}, {})", p.complexity, p.stage);
        if !keys.insert((p.complexity, p.stage)) {
            problems.push(format!("duplicate execution profile {key}"));
        }
        if p.timeout_secs <= 0 {
            problems.push(format!("{key}: timeout_secs must be positive"));
        }
        if p.retry_count < 0 {
            problems.push(format!("{key}: retry_count must not be negative"));
        }
        if let Some(name) = &p.mcp_profile {
            if !mcp_names.contains(name.as_str()) {
                problems.push(format!("{key}: unknown mcp profile {name}"));
            }
        }
        if let Some(name) = &p.skill_profile {
            if !skill_names.contains(name.as_str()) {
                problems.push(format!("{key}: unknown skill profile {name}"));
            }
        }

        let Some(adapter) = registry.get(&p.agent) else {
            problems.push(format!(
                "{key}: unknown agent {} (known: {})",
                p.agent,
                registry.names().join(", ")
            ));
            continue;
        };
        let manifest = adapter.manifest();
        if !manifest.supports_runtime(p.runtime) {
            problems.push(format!(
                "{key}: agent {} does not support runtime {}",
                p.agent, p.runtime
            ));
        }
        if !manifest.supports_auth_mode(p.auth_mode) {
            problems.push(format!(
                "{key}: agent {} does not support auth mode {}",
                p.agent, p.auth_mode
            ));
        }
        if p.auth_mode == AuthMode::Oauth {
            let provider = adapter.provider();
            if !broker.supports_callback_oauth(provider) {
                problems.push(format!(
                    "{key}: provider {provider} does not support callback OAuth"
                ));
            } else if !config.oauth_clients.contains_key(&provider) {
                problems.push(format!(
                    "{key}: no OAuth client configured for provider {provider}"
                ));
            }
        }
    }

    problems
}

/// Validate `set`, then replace every stored profile with it.
pub async fn replace_profiles(
    pool: &SqlitePool,
    registry: &AgentRegistry,
    config: &HarnessConfig,
    broker: &OAuthBroker,
    set: &ProfileSet,
) -> HarnessResult<ProfileSnapshot> {
    let problems = validate_profile_set(set, registry, config, broker);
    if !problems.is_empty() {
        return Err(HarnessError::Validation(problems.join("; ")));
    }
    Ok(upsert_profiles(pool, set).await?)
}
