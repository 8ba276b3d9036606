use serde::Deserialize;

/// Complete Pulse configuration.
///
/// Loaded from a TOML file; every section falls back to defaults so a
/// missing or partial file still yields a runnable config. Secrets (the
/// encryption master key, OAuth client credentials) are never part of this
/// file — they come from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct PulseConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub oauth: OAuthStateConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Origin allowed by the CORS layer (the frontend dev server).
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    /// Base URL providers redirect back to (no trailing slash).
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,
    /// Frontend base URL for post-callback browser redirects.
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_cors_origin() -> String {
    "http://localhost:3000".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cors_origin: default_cors_origin(),
            callback_base_url: default_callback_base_url(),
            frontend_url: default_frontend_url(),
        }
    }
}

/// OAuth state broker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthStateConfig {
    /// How long an issued state token remains consumable (seconds).
    #[serde(default = "default_state_ttl")]
    pub state_ttl_seconds: i64,
    /// How often the background sweep evicts expired states (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

fn default_state_ttl() -> i64 {
    600
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for OAuthStateConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding credentials and metric rows.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "pulse.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Per-provider reconciliation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "ProviderSettings::google_analytics_defaults")]
    pub google_analytics: ProviderSettings,
    #[serde(default = "ProviderSettings::stripe_defaults")]
    pub stripe: ProviderSettings,
}

impl ProvidersConfig {
    pub fn settings_for(&self, provider: crate::provider::Provider) -> &ProviderSettings {
        match provider {
            crate::provider::Provider::GoogleAnalytics => &self.google_analytics,
            crate::provider::Provider::Stripe => &self.stripe,
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            google_analytics: ProviderSettings::google_analytics_defaults(),
            stripe: ProviderSettings::stripe_defaults(),
        }
    }
}

/// Tuning knobs for one provider's reconciliation runs.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    /// Days to exclude at the recent end of a default date range. Analytics
    /// providers report partial numbers for a day until it finalizes; syncing
    /// those would store values that later silently change.
    #[serde(default = "default_finality_lag")]
    pub finality_lag_days: i64,
    /// Metric names structurally incompatible with the date-only dimension
    /// set. Provider catalogs evolve, so this is configuration, not code.
    #[serde(default)]
    pub excluded_metrics: Vec<String>,
    /// Upper bound on a single metric fetch call (seconds).
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
}

fn default_finality_lag() -> i64 {
    2
}

fn default_fetch_timeout() -> u64 {
    30
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            finality_lag_days: default_finality_lag(),
            excluded_metrics: Vec::new(),
            fetch_timeout_seconds: default_fetch_timeout(),
        }
    }
}

impl ProviderSettings {
    /// GA defaults: two-day finality lag and the metric families that reject
    /// a plain date breakdown (cohort specs, advertiser ads, item-level
    /// revenue, return on ad spend).
    pub fn google_analytics_defaults() -> Self {
        Self {
            finality_lag_days: 2,
            excluded_metrics: [
                "cohortActiveUsers",
                "cohortTotalUsers",
                "cohortLTV",
                "advertiserAdCostPerClick",
                "advertiserAdCostPerKeyEvent",
                "advertiserAdClicks",
                "advertiserAdCost",
                "itemDiscountAmount",
                "grossItemRevenue",
                "itemListViewEvents",
                "returnOnAdSpend",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            fetch_timeout_seconds: default_fetch_timeout(),
        }
    }

    /// Stripe settles faster than GA; yesterday is final.
    pub fn stripe_defaults() -> Self {
        Self {
            finality_lag_days: 1,
            excluded_metrics: Vec::new(),
            fetch_timeout_seconds: default_fetch_timeout(),
        }
    }
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            oauth: OAuthStateConfig::default(),
            storage: StorageConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

/// Load configuration from a TOML file.
pub fn load_config(path: &str) -> Result<PulseConfig, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: PulseConfig = toml::from_str(&contents)?;
    Ok(config)
}
