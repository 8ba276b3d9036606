//! Metric reconciliation engine.
//!
//! One generic engine serves every provider: it pulls credentials from the
//! vault, discovers scopes and metrics through the adapter, fetches each
//! metric independently, normalizes, and upserts. A failing metric is
//! tallied and skipped so the rest of the run still lands; replaying any
//! day is safe because every write is an upsert.

use crate::config::ProvidersConfig;
use crate::credentials::{CredentialStore, Credentials};
use crate::error::SyncError;
use crate::metrics::{normalize, DateRange, MetricStore, UpsertOutcome};
use crate::oauth::TokenRefresher;
use crate::provider::{AdapterRegistry, Provider, ProviderError, ScopeInfo, SourceAdapter};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One metric that failed during a run.
#[derive(Clone, Debug, Serialize)]
pub struct MetricFailure {
    pub scope_id: String,
    pub metric: String,
    pub message: String,
}

/// Outcome of one reconciliation run.
///
/// `stored` counts newly created points, `updated` counts refreshed ones,
/// `skipped` counts excluded metrics plus values kept raw. A report with a
/// non-empty `errors` list is still a successful partial run.
#[derive(Clone, Debug, Serialize)]
pub struct SyncReport {
    pub provider: Provider,
    pub account_name: Option<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub stored: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<MetricFailure>,
    /// True when the run budget expired before every metric was attempted.
    pub deadline_reached: bool,
}

impl SyncReport {
    fn new(provider: Provider, range: DateRange) -> Self {
        Self {
            provider,
            account_name: None,
            start_date: range.start,
            end_date: range.end,
            stored: 0,
            updated: 0,
            skipped: 0,
            errors: Vec::new(),
            deadline_reached: false,
        }
    }
}

fn map_provider_err(provider: Provider, err: ProviderError) -> SyncError {
    match err {
        ProviderError::Unauthorized => SyncError::ReauthorizationRequired(format!(
            "{provider} rejected credentials after refresh"
        )),
        ProviderError::ScopeNotFound(msg) => SyncError::ScopeNotFound(msg),
        ProviderError::RateLimited => {
            SyncError::TransientProvider(format!("{provider} rate limit exceeded"))
        }
        ProviderError::Transient(msg) => SyncError::TransientProvider(msg),
        ProviderError::Api { status, message } => {
            SyncError::TransientProvider(format!("{provider} API error ({status}): {message}"))
        }
    }
}

/// Provider-agnostic reconciliation engine.
#[derive(Clone)]
pub struct SyncEngine {
    vault: Arc<CredentialStore>,
    store: Arc<MetricStore>,
    refresher: TokenRefresher,
    registry: AdapterRegistry,
    providers: ProvidersConfig,
    /// Wall-clock budget for one whole run; metrics not attempted before it
    /// expires are deferred to the next run.
    run_budget: Duration,
}

impl SyncEngine {
    pub fn new(
        vault: Arc<CredentialStore>,
        store: Arc<MetricStore>,
        registry: AdapterRegistry,
        providers: ProvidersConfig,
    ) -> Self {
        Self {
            refresher: TokenRefresher::new(Arc::clone(&vault)),
            vault,
            store,
            registry,
            providers,
            run_budget: Duration::from_secs(240),
        }
    }

    pub fn with_run_budget(mut self, budget: Duration) -> Self {
        self.run_budget = budget;
        self
    }

    /// Reconcile all scopes of one provider connection over a date range.
    ///
    /// With no explicit range, syncs the most recent finalized day (today
    /// minus the provider's finality lag). Token expiry triggers exactly one
    /// refresh per run; a second rejection aborts with
    /// `ReauthorizationRequired`.
    pub async fn reconcile(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
        requested: Option<DateRange>,
    ) -> Result<SyncReport, SyncError> {
        let mut credentials = self
            .vault
            .get(user_id, project_id, provider)?
            .ok_or(SyncError::NoConnection {
                provider: provider.as_str(),
            })?;

        let adapter = self.registry.get(provider).ok_or_else(|| {
            SyncError::Configuration(format!("no adapter registered for {provider}"))
        })?;

        let settings = self.providers.settings_for(provider).clone();
        let range = requested.unwrap_or_else(|| {
            DateRange::latest_complete(Utc::now().date_naive(), settings.finality_lag_days, 1)
        });

        info!(
            %provider, user_id, project_id,
            start = %range.start, end = %range.end,
            "Starting reconciliation run"
        );

        let mut report = SyncReport::new(provider, range);
        report.account_name = credentials.account_name.clone();

        let mut refreshed = false;
        let scopes = self
            .list_scopes_with_refresh(
                user_id,
                project_id,
                provider,
                adapter.as_ref(),
                &mut credentials,
                &mut refreshed,
            )
            .await?;

        if scopes.is_empty() {
            return Err(SyncError::ScopeNotFound(format!(
                "{provider} connection exposes no metric scopes"
            )));
        }

        let deadline = tokio::time::Instant::now() + self.run_budget;
        let fetch_timeout = Duration::from_secs(settings.fetch_timeout_seconds);

        'scopes: for scope in &scopes {
            let definitions = match adapter.list_metrics(&credentials, &scope.id).await {
                Ok(defs) => defs,
                Err(ProviderError::Unauthorized) if !refreshed => {
                    refreshed = true;
                    credentials = self
                        .refresher
                        .refresh(user_id, project_id, provider, &credentials)
                        .await?;
                    adapter
                        .list_metrics(&credentials, &scope.id)
                        .await
                        .map_err(|e| map_provider_err(provider, e))?
                }
                Err(e) => return Err(map_provider_err(provider, e)),
            };

            for definition in &definitions {
                if settings.excluded_metrics.contains(&definition.name) {
                    report.skipped += 1;
                    continue;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(%provider, scope = %scope.id, "Run budget exhausted, deferring remaining metrics");
                    report.deadline_reached = true;
                    break 'scopes;
                }

                let fetched = tokio::time::timeout(
                    fetch_timeout,
                    adapter.fetch_metric(&credentials, &scope.id, definition, &range),
                )
                .await;

                let points = match fetched {
                    Err(_) => {
                        report.errors.push(MetricFailure {
                            scope_id: scope.id.clone(),
                            metric: definition.name.clone(),
                            message: format!("fetch timed out after {}s", fetch_timeout.as_secs()),
                        });
                        continue;
                    }
                    Ok(Err(ProviderError::Unauthorized)) if !refreshed => {
                        refreshed = true;
                        credentials = self
                            .refresher
                            .refresh(user_id, project_id, provider, &credentials)
                            .await?;
                        match adapter
                            .fetch_metric(&credentials, &scope.id, definition, &range)
                            .await
                        {
                            Ok(points) => points,
                            Err(ProviderError::Unauthorized) => {
                                return Err(map_provider_err(
                                    provider,
                                    ProviderError::Unauthorized,
                                ))
                            }
                            Err(e) => {
                                report.errors.push(MetricFailure {
                                    scope_id: scope.id.clone(),
                                    metric: definition.name.clone(),
                                    message: e.to_string(),
                                });
                                continue;
                            }
                        }
                    }
                    Ok(Err(ProviderError::Unauthorized)) => {
                        return Err(map_provider_err(provider, ProviderError::Unauthorized))
                    }
                    Ok(Err(e)) => {
                        report.errors.push(MetricFailure {
                            scope_id: scope.id.clone(),
                            metric: definition.name.clone(),
                            message: e.to_string(),
                        });
                        continue;
                    }
                    Ok(Ok(points)) => points,
                };

                for point in points {
                    if !range.contains(point.date) {
                        continue;
                    }
                    let value = normalize(definition.kind, &point.value);
                    if value.is_raw() {
                        // Stored verbatim, but flagged: nothing downstream
                        // should chart it
                        report.skipped += 1;
                    }
                    match self.store.upsert(
                        user_id,
                        project_id,
                        provider,
                        &scope.id,
                        point.date,
                        &definition.name,
                        &definition.description,
                        &value,
                    )? {
                        UpsertOutcome::Inserted => report.stored += 1,
                        UpsertOutcome::Updated => report.updated += 1,
                    }
                }
            }
        }

        info!(
            %provider, user_id, project_id,
            stored = report.stored, updated = report.updated,
            skipped = report.skipped, errors = report.errors.len(),
            "Reconciliation run complete"
        );

        Ok(report)
    }

    async fn list_scopes_with_refresh(
        &self,
        user_id: &str,
        project_id: &str,
        provider: Provider,
        adapter: &dyn SourceAdapter,
        credentials: &mut Credentials,
        refreshed: &mut bool,
    ) -> Result<Vec<ScopeInfo>, SyncError> {
        match adapter.list_scopes(credentials).await {
            Ok(scopes) => Ok(scopes),
            Err(ProviderError::Unauthorized) if !*refreshed => {
                *refreshed = true;
                *credentials = self
                    .refresher
                    .refresh(user_id, project_id, provider, credentials)
                    .await?;
                adapter
                    .list_scopes(credentials)
                    .await
                    .map_err(|e| map_provider_err(provider, e))
            }
            Err(e) => Err(map_provider_err(provider, e)),
        }
    }
}
