// Token refresh backend

use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{Client, StatusCode};

use super::types::{AwsSsoOidcResponse, OidcErrorResponse, RefreshMaterial, TokenData};
use crate::connection::{Connection, ConnectionKind};
use crate::error::{AuthError, Result};

/// Upper bound on the `expiresIn` the token endpoint may report (one year)
const MAX_EXPIRES_IN: u64 = 86_400 * 365;

/// Raw token exchange against an authorization server
#[async_trait]
pub trait TokenBackend: Send + Sync {
    async fn refresh(&self, connection: &Connection, material: &RefreshMaterial) -> Result<TokenData>;
}

/// Get AWS SSO OIDC URL for region
fn get_aws_sso_oidc_url(region: &str) -> String {
    format!("https://oidc.{}.amazonaws.com/token", region)
}

/// Get machine fingerprint for User-Agent
fn get_machine_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Map an OIDC error code to the authentication error it represents
pub fn classify_oidc_error(status: StatusCode, code: Option<&str>, body: &str) -> AuthError {
    match code {
        Some("invalid_grant" | "InvalidGrantException" | "expired_token" | "ExpiredTokenException") => {
            AuthError::ExpiredRefreshToken
        }
        Some(
            "access_denied"
            | "AccessDeniedException"
            | "unauthorized_client"
            | "UnauthorizedClientException"
            | "invalid_client"
            | "InvalidClientException",
        ) => AuthError::Revoked,
        _ if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() => {
            AuthError::NetworkError(format!("{} - {}", status, body))
        }
        _ => AuthError::Backend(format!("{} - {}", status, body)),
    }
}

/// Refreshes SSO bearer tokens through the AWS SSO OIDC token endpoint
pub struct SsoOidcBackend {
    client: Client,
    /// Replaces the regional endpoint, used by tests and private deployments
    endpoint_override: Option<String>,
    user_agent: String,
}

impl SsoOidcBackend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint_override: None,
            user_agent: format!(
                "toolkit-credentials/{}-{}",
                env!("CARGO_PKG_VERSION"),
                get_machine_fingerprint()
            ),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }

    fn endpoint(&self, region: &str) -> String {
        self.endpoint_override
            .clone()
            .unwrap_or_else(|| get_aws_sso_oidc_url(region))
    }
}

#[async_trait]
impl TokenBackend for SsoOidcBackend {
    async fn refresh(&self, connection: &Connection, material: &RefreshMaterial) -> Result<TokenData> {
        let region = match &connection.kind {
            ConnectionKind::BearerToken { region, .. } => region,
            ConnectionKind::StaticCredentials { .. } => {
                return Err(AuthError::UnsupportedConnection(connection.id.clone()))
            }
        };

        tracing::info!(connection = %connection.id, "Refreshing token via AWS SSO OIDC...");

        let url = self.endpoint(region);
        tracing::debug!(
            "AWS SSO OIDC refresh request: url={}, region={}, client_id={}...",
            url,
            region,
            material.client_id.chars().take(8).collect::<String>()
        );

        // AWS SSO OIDC uses form-urlencoded data
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", material.client_id.as_str()),
            ("client_secret", material.client_secret.as_str()),
            ("refresh_token", material.refresh_token.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("User-Agent", &self.user_agent)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::NetworkError(format!("Failed to send refresh request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let parsed = serde_json::from_str::<OidcErrorResponse>(&error_text).ok();
            if let Some(ref details) = parsed {
                tracing::error!(
                    "AWS SSO OIDC error details: error={}, description={}",
                    details.error,
                    details.error_description.as_deref().unwrap_or("-")
                );
            }

            let err = classify_oidc_error(status, parsed.as_ref().map(|p| p.error.as_str()), &error_text);
            tracing::error!(
                connection = %connection.id,
                status = status.as_u16(),
                error = %err,
                "AWS SSO OIDC refresh failed"
            );
            return Err(err);
        }

        let data: AwsSsoOidcResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Backend(format!("Failed to parse refresh response: {}", e)))?;

        if data.access_token.is_empty() {
            return Err(AuthError::Backend(
                "AWS SSO OIDC response does not contain accessToken".to_string(),
            ));
        }

        // Calculate expiration time with buffer (minus 60 seconds)
        let expires_in = data.expires_in.unwrap_or(3600).min(MAX_EXPIRES_IN);
        let expires_at = Utc::now() + Duration::seconds(expires_in as i64 - 60);

        tracing::info!(
            connection = %connection.id,
            "Token refreshed via AWS SSO OIDC, expires: {}",
            expires_at.to_rfc3339()
        );

        Ok(TokenData {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
            expires_at,
        })
    }
}
