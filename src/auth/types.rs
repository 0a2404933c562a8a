// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::connection::ConnectionId;

/// Authentication state of one connection
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TokenState {
    #[default]
    NotAuthenticated,
    Authorized,
    /// Access token expired, refresh material still usable
    ExpiredRefreshable,
    /// Refresh material unusable, interactive login required
    ExpiredNeedsReauth,
    Error(String),
}

impl TokenState {
    pub fn is_authorized(&self) -> bool {
        matches!(self, TokenState::Authorized)
    }

    pub fn needs_interactive_reauth(&self) -> bool {
        matches!(
            self,
            TokenState::NotAuthenticated | TokenState::ExpiredNeedsReauth | TokenState::Error(_)
        )
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenState::NotAuthenticated => f.write_str("not authenticated"),
            TokenState::Authorized => f.write_str("authorized"),
            TokenState::ExpiredRefreshable => f.write_str("expired (refreshable)"),
            TokenState::ExpiredNeedsReauth => f.write_str("expired (reauthentication required)"),
            TokenState::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// One committed state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub connection_id: ConnectionId,
    pub old: TokenState,
    pub new: TokenState,
}

/// Long-lived refresh material persisted per connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshMaterial {
    pub refresh_token: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

impl RefreshMaterial {
    /// Cached access token, if present and not yet expired
    pub fn live_access_token(&self) -> Option<AccessToken> {
        match (&self.access_token, self.expires_at) {
            (Some(token), Some(expires_at)) if expires_at > Utc::now() => Some(AccessToken {
                token: token.clone(),
                expires_at,
            }),
            _ => None,
        }
    }

    /// Fold a refresh response back into the persisted material
    pub fn apply(&mut self, data: &TokenData) {
        self.access_token = Some(data.access_token.clone());
        self.expires_at = Some(data.expires_at);
        if let Some(ref rotated) = data.refresh_token {
            self.refresh_token = rotated.clone();
        }
    }
}

/// Access token held in memory by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Token data from refresh response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// AWS SSO OIDC refresh response
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsSsoOidcResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// AWS SSO OIDC error body
#[derive(Debug, Deserialize)]
pub struct OidcErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
}

/// An in-flight interactive reauthentication for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReauthRequest {
    pub id: Uuid,
    pub connection_id: ConnectionId,
}

impl ReauthRequest {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
        }
    }
}
