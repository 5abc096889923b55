//! Credentials for agent runs: OAuth (PKCE) and API keys through the
//! broker, CLI-managed logins through the native manager.

pub mod broker;
pub mod crypto;
pub mod native;
pub mod pkce;
pub mod providers;
pub mod resolve;

pub use broker::{ConsumedGrant, IssuedGrant, OAuthBroker, ProviderAuthStatus, StartedSession};
pub use crypto::{CryptoError, TokenCipher};
pub use native::{NativeAuthManager, NativeCheck, NativeSessionView, NativeState};
pub use providers::{OAuthError, ProviderPlugin, StandardOAuthPlugin, TokenSet, UnsupportedPlugin};
pub use resolve::{AuthResolver, GrantBinding, ResolvedAuth};
