// Authentication module
// Token state, refresh, persistence and reauthentication

mod credentials;
mod prompt;
mod provider;
mod reauth;
mod refresh;
mod store;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use credentials::{token_key, CredentialStore, MemoryCredentialStore};
pub use prompt::{HeadlessPrompt, TerminalPrompt};
pub use provider::{BearerTokenProvider, RetryPolicy};
pub use reauth::{LoginOutcome, LoginPrompt, ReauthCoordinator, ReauthOutcome, ReauthPhase};
pub use refresh::{classify_oidc_error, SsoOidcBackend, TokenBackend};
pub use store::TokenStateStore;
pub use types::{AccessToken, RefreshMaterial, ReauthRequest, StateChange, TokenData, TokenState};
