//! Authorization-code exchange against a provider token endpoint.

use crate::error::SyncError;
use serde::Deserialize;
use std::collections::HashMap;

/// What the token endpoint granted us.
///
/// `scope` is the space-delimited granted-scope string (Google returns it,
/// Stripe omits it). `stripe_user_id` is Stripe Connect's extension field
/// identifying the connected account.
#[derive(Debug)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scopes: Vec<String>,
    pub stripe_user_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    stripe_user_id: Option<String>,
}

/// Exchange an authorization code for tokens.
///
/// A non-success response maps to `InvalidState` — by the time the exchange
/// fails the code is burned either way, and the caller reports all callback
/// failures with the same generic flag.
pub async fn exchange_code_for_token(
    token_url: &str,
    code: &str,
    redirect_uri: &str,
    client_id: &str,
    client_secret: &str,
) -> Result<TokenGrant, SyncError> {
    let client = reqwest::Client::new();

    let mut form_data = HashMap::new();
    form_data.insert("grant_type", "authorization_code");
    form_data.insert("code", code);
    form_data.insert("redirect_uri", redirect_uri);
    form_data.insert("client_id", client_id);
    form_data.insert("client_secret", client_secret);

    tracing::debug!("Exchanging authorization code for token at {}", token_url);

    let response = client
        .post(token_url)
        .header("Accept", "application/json")
        .form(&form_data)
        .send()
        .await
        .map_err(|e| SyncError::TransientProvider(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(%status, "Token exchange rejected: {}", body);
        return Err(SyncError::InvalidState);
    }

    let token_response: TokenResponse = response
        .json()
        .await
        .map_err(|e| SyncError::TransientProvider(format!("malformed token response: {e}")))?;

    tracing::debug!(
        "Token exchange successful, has_refresh_token={}",
        token_response.refresh_token.is_some()
    );

    let scopes = token_response
        .scope
        .map(|s| s.split_whitespace().map(String::from).collect())
        .unwrap_or_default();

    Ok(TokenGrant {
        access_token: token_response.access_token,
        refresh_token: token_response.refresh_token,
        scopes,
        stripe_user_id: token_response.stripe_user_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exchange_parses_grant() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "access_token": "ya29.abc",
                    "refresh_token": "1//xyz",
                    "scope": "https://www.googleapis.com/auth/analytics.readonly openid",
                    "token_type": "Bearer",
                    "expires_in": 3599
                }"#,
            )
            .create_async()
            .await;

        let grant = exchange_code_for_token(
            &format!("{}/token", server.url()),
            "auth-code",
            "http://localhost:8000/callback",
            "client-id",
            "client-secret",
        )
        .await
        .unwrap();

        assert_eq!(grant.access_token, "ya29.abc");
        assert_eq!(grant.refresh_token, Some("1//xyz".to_string()));
        assert_eq!(grant.scopes.len(), 2);
        assert!(grant.stripe_user_id.is_none());
    }

    #[tokio::test]
    async fn test_exchange_parses_stripe_extensions() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "access_token": "sk_test_abc",
                    "refresh_token": "rt_abc",
                    "stripe_user_id": "acct_123",
                    "scope": "read_write"
                }"#,
            )
            .create_async()
            .await;

        let grant = exchange_code_for_token(
            &format!("{}/oauth/token", server.url()),
            "ac_code",
            "http://localhost:8000/callback",
            "ca_client",
            "sk_secret",
        )
        .await
        .unwrap();

        assert_eq!(grant.stripe_user_id, Some("acct_123".to_string()));
        assert_eq!(grant.scopes, vec!["read_write".to_string()]);
    }

    #[tokio::test]
    async fn test_rejected_code_maps_to_invalid_state() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error": "invalid_grant"}"#)
            .create_async()
            .await;

        let result = exchange_code_for_token(
            &format!("{}/token", server.url()),
            "stale-code",
            "http://localhost:8000/callback",
            "client-id",
            "client-secret",
        )
        .await;

        assert!(matches!(result, Err(crate::error::SyncError::InvalidState)));
    }
}
