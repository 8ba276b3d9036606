//! Reactive access-token refresh.
//!
//! There is no speculative refresh loop: a token is only exchanged when a
//! provider call comes back unauthorized. The refreshed credentials are
//! persisted through the vault so the next run starts from the new token.

use crate::credentials::{CredentialStore, Credentials};
use crate::error::SyncError;
use crate::provider::{oauth_endpoints, Provider};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Clone)]
pub struct TokenRefresher {
    vault: Arc<CredentialStore>,
    client: reqwest::Client,
}

impl TokenRefresher {
    pub fn new(vault: Arc<CredentialStore>) -> Self {
        Self {
            vault,
            client: reqwest::Client::new(),
        }
    }

    /// Exchange the stored refresh token for a fresh access token and
    /// persist the result.
    ///
    /// A missing refresh token or a 4xx from the token endpoint means the
    /// grant itself is dead and the user must reconnect. 5xx and network
    /// failures are transient; the stored credentials are left untouched.
    pub async fn refresh(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
        current: &Credentials,
    ) -> Result<Credentials, SyncError> {
        let refresh_token = current.refresh_token.as_deref().ok_or_else(|| {
            SyncError::ReauthorizationRequired(format!(
                "{provider} connection has no refresh token"
            ))
        })?;

        let endpoints = oauth_endpoints(provider).ok_or_else(|| {
            SyncError::Configuration(format!("OAuth client credentials not set for {provider}"))
        })?;

        let mut form_data = HashMap::new();
        form_data.insert("grant_type", "refresh_token");
        form_data.insert("refresh_token", refresh_token);
        form_data.insert("client_id", endpoints.client_id.as_str());
        form_data.insert("client_secret", endpoints.client_secret.as_str());

        tracing::info!(%provider, user_id, project_id, "Refreshing expired access token");

        let response = self
            .client
            .post(&current.token_uri)
            .header("Accept", "application/json")
            .form(&form_data)
            .send()
            .await
            .map_err(|e| SyncError::TransientProvider(format!("token refresh failed: {e}")))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%provider, %status, "Refresh token rejected: {}", body);
            return Err(SyncError::ReauthorizationRequired(format!(
                "{provider} refresh token rejected ({status})"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::TransientProvider(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let parsed: RefreshResponse = response
            .json()
            .await
            .map_err(|e| SyncError::TransientProvider(format!("malformed refresh response: {e}")))?;

        let refreshed = Credentials {
            access_token: parsed.access_token,
            // Most providers do not rotate refresh tokens; keep ours unless
            // the response carries a replacement
            refresh_token: parsed
                .refresh_token
                .or_else(|| current.refresh_token.clone()),
            account_id: current.account_id.clone(),
            account_name: current.account_name.clone(),
            token_uri: current.token_uri.clone(),
            scopes: parsed
                .scope
                .map(|s| s.split_whitespace().map(String::from).collect())
                .unwrap_or_else(|| current.scopes.clone()),
        };

        self.vault.store(user_id, project_id, provider, &refreshed)?;

        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

    fn test_vault() -> Arc<CredentialStore> {
        let key = BASE64.encode([7u8; 32]);
        Arc::new(CredentialStore::new(":memory:", &key).unwrap())
    }

    fn credentials_with_token_uri(token_uri: &str) -> Credentials {
        Credentials {
            access_token: "expired-token".to_string(),
            refresh_token: Some("refresh-123".to_string()),
            account_id: Some("acct_1".to_string()),
            account_name: Some("Acme".to_string()),
            token_uri: token_uri.to_string(),
            scopes: vec!["https://www.googleapis.com/auth/analytics.readonly".to_string()],
        }
    }

    fn set_client_env() {
        std::env::set_var("PULSE_OAUTH_GOOGLE_ANALYTICS_CLIENT_ID", "client-id");
        std::env::set_var("PULSE_OAUTH_GOOGLE_ANALYTICS_CLIENT_SECRET", "client-secret");
    }

    #[tokio::test]
    async fn test_refresh_persists_new_token() {
        set_client_env();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token": "fresh-token", "expires_in": 3599}"#)
            .create_async()
            .await;

        let vault = test_vault();
        let current = credentials_with_token_uri(&format!("{}/token", server.url()));
        vault
            .store("user1", "proj1", Provider::GoogleAnalytics, &current)
            .unwrap();

        let refresher = TokenRefresher::new(Arc::clone(&vault));
        let refreshed = refresher
            .refresh("user1", "proj1", Provider::GoogleAnalytics, &current)
            .await
            .unwrap();

        assert_eq!(refreshed.access_token, "fresh-token");
        // Unrotated refresh token survives
        assert_eq!(refreshed.refresh_token, Some("refresh-123".to_string()));
        assert_eq!(refreshed.account_name, Some("Acme".to_string()));

        // And the vault saw the update
        let stored = vault
            .get("user1", "proj1", Provider::GoogleAnalytics)
            .unwrap()
            .unwrap();
        assert_eq!(stored.access_token, "fresh-token");
    }

    #[tokio::test]
    async fn test_rejected_refresh_requires_reauthorization() {
        set_client_env();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let vault = test_vault();
        let current = credentials_with_token_uri(&format!("{}/token", server.url()));

        let refresher = TokenRefresher::new(vault);
        let result = refresher
            .refresh("user1", "proj1", Provider::GoogleAnalytics, &current)
            .await;

        assert!(matches!(
            result,
            Err(SyncError::ReauthorizationRequired(_))
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        set_client_env();
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let vault = test_vault();
        let current = credentials_with_token_uri(&format!("{}/token", server.url()));

        let refresher = TokenRefresher::new(vault);
        let result = refresher
            .refresh("user1", "proj1", Provider::GoogleAnalytics, &current)
            .await;

        assert!(matches!(result, Err(SyncError::TransientProvider(_))));
    }

    #[tokio::test]
    async fn test_missing_refresh_token_requires_reauthorization() {
        let vault = test_vault();
        let current = Credentials {
            refresh_token: None,
            ..credentials_with_token_uri("http://localhost/token")
        };

        let refresher = TokenRefresher::new(vault);
        let result = refresher
            .refresh("user1", "proj1", Provider::GoogleAnalytics, &current)
            .await;

        assert!(matches!(
            result,
            Err(SyncError::ReauthorizationRequired(_))
        ));
    }
}
