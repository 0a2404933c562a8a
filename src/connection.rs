// Connection data model

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identifier of a persisted connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a logical capability that binds to one active connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureId(String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FeatureId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of credential behind a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Long-lived credentials from a named profile, never refreshed
    StaticCredentials { profile_name: String, region: String },

    /// SSO / OIDC bearer token
    /// `region` selects the OIDC endpoint used for refresh
    BearerToken { start_url: String, region: String },
}

impl ConnectionKind {
    pub fn region(&self) -> &str {
        match self {
            ConnectionKind::StaticCredentials { region, .. } => region,
            ConnectionKind::BearerToken { region, .. } => region,
        }
    }

    pub fn is_bearer(&self) -> bool {
        matches!(self, ConnectionKind::BearerToken { .. })
    }

    /// Short name used in listings and persistence
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionKind::StaticCredentials { .. } => "static",
            ConnectionKind::BearerToken { .. } => "bearer",
        }
    }
}

/// A named binding between the toolkit and a set of granted permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub label: String,
    pub kind: ConnectionKind,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
}

impl Connection {
    pub fn bearer(
        id: impl Into<String>,
        label: impl Into<String>,
        start_url: impl Into<String>,
        region: impl Into<String>,
        scopes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            id: ConnectionId::new(id),
            label: label.into(),
            kind: ConnectionKind::BearerToken {
                start_url: start_url.into(),
                region: region.into(),
            },
            scopes: scopes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn static_credentials(
        id: impl Into<String>,
        label: impl Into<String>,
        profile_name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            id: ConnectionId::new(id),
            label: label.into(),
            kind: ConnectionKind::StaticCredentials {
                profile_name: profile_name.into(),
                region: region.into(),
            },
            scopes: BTreeSet::new(),
        }
    }

    /// True when every scope in `required` has been granted
    pub fn has_scopes<'a>(&self, required: impl IntoIterator<Item = &'a str>) -> bool {
        required.into_iter().all(|s| self.scopes.contains(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_connection_builder() {
        let conn = Connection::bearer(
            "c1",
            "Work SSO",
            "https://example.awsapps.com/start",
            "us-west-2",
            ["codecatalyst:read_write"],
        );
        assert_eq!(conn.id.as_str(), "c1");
        assert!(conn.kind.is_bearer());
        assert_eq!(conn.kind.region(), "us-west-2");
        assert!(conn.has_scopes(["codecatalyst:read_write"]));
        assert!(!conn.has_scopes(["sso:account:access"]));
    }

    #[test]
    fn test_static_connection_has_no_scopes() {
        let conn = Connection::static_credentials("profile:default", "default", "default", "us-east-1");
        assert!(!conn.kind.is_bearer());
        assert_eq!(conn.kind.name(), "static");
        assert!(conn.scopes.is_empty());
        assert!(conn.has_scopes(std::iter::empty()));
    }

    #[test]
    fn test_kind_serialization_is_tagged() {
        let kind = ConnectionKind::BearerToken {
            start_url: "https://view.awsapps.com/start".to_string(),
            region: "us-east-1".to_string(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "bearer_token");
        assert_eq!(json["region"], "us-east-1");

        let back: ConnectionKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }
}
