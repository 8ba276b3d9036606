//! Source adapter seam for external metric providers.
//!
//! The sync engine and the OAuth layer are provider-agnostic; everything
//! provider-specific lives behind [`SourceAdapter`]. Adding a provider means
//! one adapter implementation plus an OAuth endpoint entry — the engine,
//! vault, and routes do not change.

use crate::credentials::Credentials;
use crate::metrics::{DateRange, MetricDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod google;
pub mod stripe;

pub use google::GoogleAnalyticsAdapter;
pub use stripe::StripeAdapter;

/// The external services metrics can be pulled from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    GoogleAnalytics,
    Stripe,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GoogleAnalytics => "google_analytics",
            Provider::Stripe => "stripe",
        }
    }

    /// Parse a provider name from a URL path segment.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "google_analytics" => Some(Provider::GoogleAnalytics),
            "stripe" => Some(Provider::Stripe),
            _ => None,
        }
    }

    pub fn all() -> [Provider; 2] {
        [Provider::GoogleAnalytics, Provider::Stripe]
    }

    /// Env var prefix for this provider's OAuth client credentials.
    fn env_prefix(&self) -> &'static str {
        match self {
            Provider::GoogleAnalytics => "GOOGLE_ANALYTICS",
            Provider::Stripe => "STRIPE",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure modes for provider API calls.
///
/// Adapters map HTTP responses into these kinds so the engine can decide:
/// `Unauthorized` triggers one reactive token refresh, `ScopeNotFound`
/// aborts the run, everything else inside the per-metric loop is tallied
/// and skipped.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider auth error: token expired or invalid")]
    Unauthorized,
    #[error("provider rate limit exceeded")]
    RateLimited,
    #[error("scope not found: {0}")]
    ScopeNotFound(String),
    #[error("provider request failed: {0}")]
    Transient(String),
    #[error("provider API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl ProviderError {
    /// Map a non-success HTTP status to an error kind.
    pub fn from_status(status: reqwest::StatusCode, message: String) -> Self {
        match status.as_u16() {
            401 => ProviderError::Unauthorized,
            404 => ProviderError::ScopeNotFound(message),
            403 | 429 => ProviderError::RateLimited,
            500..=599 => ProviderError::Transient(message),
            s => ProviderError::Api { status: s, message },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Transient(e.to_string())
    }
}

/// Provider-side identity of the connected account.
#[derive(Clone, Debug, Serialize)]
pub struct AccountInfo {
    pub id: String,
    pub display_name: String,
}

/// One metric scope (a GA property, a Stripe connected account).
#[derive(Clone, Debug, Serialize)]
pub struct ScopeInfo {
    pub id: String,
    pub display_name: String,
    pub account_name: String,
}

/// A raw (date, value) point as reported by the provider for one metric.
///
/// Values are either the provider's untyped string (GA) or a number the
/// adapter already reduced (Stripe counts and major-unit amounts). Minor-unit
/// money is converted by the adapter — once, at the boundary — so nothing
/// downstream ever sees cents.
#[derive(Clone, Debug, PartialEq)]
pub struct RawPoint {
    pub date: chrono::NaiveDate,
    pub value: RawValue,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RawValue {
    Text(String),
    Int(i64),
    Float(f64),
}

/// Adapter interface for one external metric provider.
///
/// Adapters are stateless: credentials arrive per call, and all persistence
/// happens outside. Each method maps to exactly one provider API concern so
/// the engine can isolate failures per metric.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Which provider this adapter talks to.
    fn provider(&self) -> Provider;

    /// Resolve the connected account's identity (for display and audit).
    async fn account_info(&self, credentials: &Credentials) -> Result<AccountInfo, ProviderError>;

    /// Enumerate metric scopes the credentials grant access to.
    async fn list_scopes(&self, credentials: &Credentials) -> Result<Vec<ScopeInfo>, ProviderError>;

    /// Discover the metric definitions available for a scope.
    async fn list_metrics(
        &self,
        credentials: &Credentials,
        scope_id: &str,
    ) -> Result<Vec<MetricDefinition>, ProviderError>;

    /// Fetch one metric's per-date values over an inclusive range.
    async fn fetch_metric(
        &self,
        credentials: &Credentials,
        scope_id: &str,
        definition: &MetricDefinition,
        range: &DateRange,
    ) -> Result<Vec<RawPoint>, ProviderError>;
}

/// OAuth 2.0 endpoint configuration for a provider.
///
/// Client id/secret come from `PULSE_OAUTH_{PROVIDER}_CLIENT_ID` and
/// `PULSE_OAUTH_{PROVIDER}_CLIENT_SECRET` environment variables.
#[derive(Clone, Debug)]
pub struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub client_id: String,
    pub client_secret: String,
    /// Provider-specific authorization query parameters (e.g. Google's
    /// `access_type=offline` to obtain a refresh token).
    pub extra_auth_params: Vec<(&'static str, &'static str)>,
}

impl OAuthEndpoints {
    /// Build the provider authorization URL with state and redirect_uri.
    pub fn build_auth_url(&self, state: &str, redirect_uri: &str) -> String {
        let scopes = self.scopes.join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );
        for (key, value) in &self.extra_auth_params {
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.push_str(&urlencoding::encode(value));
        }
        url
    }
}

/// Load OAuth endpoint configuration for a provider from the environment.
///
/// Returns `None` when the client id/secret env vars are unset, which the
/// API layer reports as "OAuth not configured".
pub fn oauth_endpoints(provider: Provider) -> Option<OAuthEndpoints> {
    let env_prefix = provider.env_prefix();
    let client_id = std::env::var(format!("PULSE_OAUTH_{env_prefix}_CLIENT_ID")).ok()?;
    let client_secret = std::env::var(format!("PULSE_OAUTH_{env_prefix}_CLIENT_SECRET")).ok()?;

    let (auth_url, token_url, scopes, extra_auth_params): (_, _, Vec<&str>, _) = match provider {
        Provider::GoogleAnalytics => (
            "https://accounts.google.com/o/oauth2/auth",
            "https://oauth2.googleapis.com/token",
            vec!["https://www.googleapis.com/auth/analytics.readonly"],
            // offline + consent so Google issues a refresh token
            vec![
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("include_granted_scopes", "true"),
            ],
        ),
        Provider::Stripe => (
            "https://connect.stripe.com/oauth/authorize",
            "https://connect.stripe.com/oauth/token",
            vec!["read_write"],
            vec![],
        ),
    };

    Some(OAuthEndpoints {
        auth_url: auth_url.to_string(),
        token_url: token_url.to_string(),
        scopes: scopes.into_iter().map(String::from).collect(),
        client_id,
        client_secret,
        extra_auth_params,
    })
}

/// Scopes that must have been granted for the connection to be usable.
/// Verified on callback; a grant missing any of these fails closed.
pub fn required_scopes(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::GoogleAnalytics => &["https://www.googleapis.com/auth/analytics.readonly"],
        Provider::Stripe => &[],
    }
}

/// Check that every required scope was granted.
pub fn verify_scopes(provider: Provider, granted: &[String]) -> bool {
    required_scopes(provider)
        .iter()
        .all(|required| granted.iter().any(|g| g == required))
}

/// Holds one adapter instance per provider.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    /// Registry with the production adapters for all providers.
    pub fn new() -> Self {
        let mut adapters: HashMap<Provider, Arc<dyn SourceAdapter>> = HashMap::new();
        adapters.insert(
            Provider::GoogleAnalytics,
            Arc::new(GoogleAnalyticsAdapter::new()),
        );
        adapters.insert(Provider::Stripe, Arc::new(StripeAdapter::new()));
        Self { adapters }
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&provider).map(Arc::clone)
    }

    /// Replace an adapter (tests point providers at mock servers).
    pub fn insert(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
