use anyhow::{anyhow, Context, Result};
use pulse::api::{create_router, AppState};
use pulse::config::{load_config, PulseConfig};
use pulse::credentials::CredentialStore;
use pulse::metrics::MetricStore;
use pulse::oauth::{run_state_sweeper, StateBroker, TokenRefresher};
use pulse::provider::AdapterRegistry;
use pulse::sync::SyncEngine;
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse=info,tower_http=info".into()),
        )
        .init();

    let config_path = std::env::var("PULSE_CONFIG").unwrap_or_else(|_| "pulse.toml".to_string());
    let config = match load_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path, "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(path = %config_path, error = %e, "Config not loaded, using defaults");
            PulseConfig::default()
        }
    };

    let encryption_key = std::env::var("PULSE_ENCRYPTION_KEY")
        .context("PULSE_ENCRYPTION_KEY must be set (base64-encoded 32-byte key)")?;

    let vault = Arc::new(
        CredentialStore::new(&config.storage.db_path, &encryption_key)
            .map_err(|e| anyhow!("failed to open credential store: {e}"))?,
    );
    let metrics = Arc::new(
        MetricStore::new(&config.storage.db_path)
            .map_err(|e| anyhow!("failed to open metric store: {e}"))?,
    );

    let connections = vault
        .list_all()
        .map_err(|e| anyhow!("failed to enumerate stored connections: {e}"))?;
    info!(connections = connections.len(), "Credential vault opened");

    let registry = AdapterRegistry::new();
    let engine = SyncEngine::new(
        Arc::clone(&vault),
        Arc::clone(&metrics),
        registry.clone(),
        config.providers.clone(),
    );
    let broker = StateBroker::new(config.oauth.state_ttl_seconds);
    let refresher = TokenRefresher::new(Arc::clone(&vault));

    tokio::spawn(run_state_sweeper(
        broker.clone(),
        config.oauth.sweep_interval_seconds,
    ));

    let bind_addr = config.server.bind_addr.clone();
    let router = create_router(AppState {
        vault,
        metrics,
        engine,
        broker,
        refresher,
        registry,
        config,
    });

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "Pulse listening");

    axum::serve(listener, router).await?;

    Ok(())
}
