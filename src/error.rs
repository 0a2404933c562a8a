// Error handling module
// Defines the authentication error kinds surfaced to callers

use thiserror::Error;

use crate::connection::{ConnectionId, FeatureId};

/// Errors produced by token refresh, reauthentication and registry operations
///
/// `Clone` so that one resolved prompt result can be handed to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The refresh credential itself is no longer valid; full reauthentication required
    #[error("Refresh token expired, reauthentication required")]
    ExpiredRefreshToken,

    /// The authorization server reported the grant as revoked
    #[error("Authorization revoked by the server")]
    Revoked,

    /// Transient I/O failure, retryable
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The user dismissed the login prompt
    #[error("Login cancelled by user")]
    UserCancelled,

    /// No interactive UI is available to run a login flow
    #[error("No interactive context available for login")]
    NoInteractiveContext,

    /// Unknown connection id
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Feature has no bound connection
    #[error("No active connection for feature: {0}")]
    NoActiveConnection(FeatureId),

    /// Operation requires a bearer-token connection
    #[error("Connection does not use bearer tokens: {0}")]
    UnsupportedConnection(ConnectionId),

    /// Non-retryable error response from the token endpoint
    #[error("Token backend error: {0}")]
    Backend(String),

    /// Credential persistence failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Only transient network failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::NetworkError(_))
    }
}

impl From<rusqlite::Error> for AuthError {
    fn from(err: rusqlite::Error) -> Self {
        AuthError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Storage(format!("Malformed credential record: {}", err))
    }
}

/// Result type alias for authentication operations
pub type Result<T> = std::result::Result<T, AuthError>;
