//! Reconciliation and connection-status endpoints.

use super::{ApiError, AppState};
use crate::auth::extract_bearer_token;
use crate::error::SyncError;
use crate::metrics::{DateRange, MetricRecord};
use crate::provider::{Provider, ProviderError, ScopeInfo};
use crate::sync::SyncReport;
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::Json,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const MAX_BACKFILL_DAYS: i64 = 365;

#[derive(Deserialize)]
pub struct ProjectParams {
    pub project_id: String,
}

#[derive(Deserialize)]
pub struct SyncParams {
    /// Explicit start date (YYYY-MM-DD). Defaults to the most recent
    /// finalized day for the provider.
    pub date: Option<String>,
    /// Number of days to reconcile.
    pub days: Option<i64>,
}

#[derive(Deserialize)]
pub struct MetricsParams {
    pub scope_id: String,
    pub date: String,
}

#[derive(Serialize)]
pub struct ProviderStatus {
    pub provider: Provider,
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    pub stored_points: i64,
}

#[derive(Serialize)]
pub struct ProvidersResponse {
    pub providers: Vec<ProviderStatus>,
}

#[derive(Serialize)]
pub struct ScopesResponse {
    pub scopes: Vec<ScopeInfo>,
}

#[derive(Serialize)]
pub struct MetricsResponse {
    pub scope_id: String,
    pub date: NaiveDate,
    pub points: Vec<MetricRecord>,
}

#[derive(Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
    pub points_removed: usize,
}

fn parse_provider(name: &str) -> Result<Provider, ApiError> {
    Provider::parse(name).ok_or_else(|| ApiError::NotFound(format!("Unknown provider '{name}'")))
}

fn authenticate(headers: &HeaderMap) -> Result<String, ApiError> {
    extract_bearer_token(headers).map_err(|e| ApiError::Unauthorized(format!("Invalid token: {e}")))
}

fn provider_api_error(provider: Provider, err: ProviderError) -> ApiError {
    match err {
        ProviderError::Unauthorized => ApiError::Unauthorized(format!(
            "{provider} rejected stored credentials, reconnect required"
        )),
        ProviderError::ScopeNotFound(msg) => ApiError::NotFound(msg),
        other => ApiError::BadGateway(other.to_string()),
    }
}

/// GET /api/providers?project_id=...
///
/// Connection status for every supported provider in one project.
pub async fn list_providers(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ProjectParams>,
    headers: HeaderMap,
) -> Result<Json<ProvidersResponse>, ApiError> {
    let user_id = authenticate(&headers)?;

    let mut providers = Vec::with_capacity(Provider::all().len());
    for provider in Provider::all() {
        let stored = state
            .vault
            .load(&user_id, &params.project_id, provider)
            .map_err(ApiError::from)?;
        let points = state
            .metrics
            .count_points(&user_id, &params.project_id, provider)
            .map_err(ApiError::from)?;

        providers.push(ProviderStatus {
            provider,
            connected: stored.is_some(),
            account_name: stored.and_then(|row| row.account_name),
            stored_points: points,
        });
    }

    Ok(Json(ProvidersResponse { providers }))
}

/// GET /api/providers/:provider/sync/:project_id?date=YYYY-MM-DD&days=N
///
/// Run a reconciliation now and return the report. `date` pins the range
/// start; `days` widens it (default: the single most recent finalized day).
pub async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    Path((provider_name, project_id)): Path<(String, String)>,
    Query(params): Query<SyncParams>,
    headers: HeaderMap,
) -> Result<Json<SyncReport>, ApiError> {
    let provider = parse_provider(&provider_name)?;
    let user_id = authenticate(&headers)?;

    let days = params.days.unwrap_or(1);
    if !(1..=MAX_BACKFILL_DAYS).contains(&days) {
        return Err(ApiError::BadRequest(format!(
            "'days' must be between 1 and {MAX_BACKFILL_DAYS}"
        )));
    }

    let range = match &params.date {
        Some(raw) => {
            let start = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                ApiError::BadRequest(format!("Invalid date '{raw}', expected YYYY-MM-DD"))
            })?;
            Some(DateRange::new(start, start + Duration::days(days - 1)))
        }
        None if params.days.is_some() => {
            let lag = state
                .config
                .providers
                .settings_for(provider)
                .finality_lag_days;
            Some(DateRange::latest_complete(
                Utc::now().date_naive(),
                lag,
                days,
            ))
        }
        None => None,
    };

    let report = state
        .engine
        .reconcile(&user_id, &project_id, provider, range)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(report))
}

/// GET /api/providers/:provider/scopes/:project_id
///
/// The metric scopes (GA properties, Stripe accounts) visible to the
/// stored credentials.
pub async fn list_scopes(
    State(state): State<Arc<AppState>>,
    Path((provider_name, project_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<ScopesResponse>, ApiError> {
    let provider = parse_provider(&provider_name)?;
    let user_id = authenticate(&headers)?;

    let credentials = state
        .vault
        .get(&user_id, &project_id, provider)
        .map_err(ApiError::from)?
        .ok_or(SyncError::NoConnection {
            provider: provider.as_str(),
        })
        .map_err(ApiError::from)?;

    let adapter = state.registry.get(provider).ok_or_else(|| {
        ApiError::ServerError(format!("no adapter registered for {provider}"))
    })?;

    let scopes = adapter
        .list_scopes(&credentials)
        .await
        .map_err(|e| provider_api_error(provider, e))?;

    Ok(Json(ScopesResponse { scopes }))
}

/// GET /api/providers/:provider/metrics/:project_id?scope_id=...&date=YYYY-MM-DD
///
/// Read back the stored points for one scope and day.
pub async fn read_metrics(
    State(state): State<Arc<AppState>>,
    Path((provider_name, project_id)): Path<(String, String)>,
    Query(params): Query<MetricsParams>,
    headers: HeaderMap,
) -> Result<Json<MetricsResponse>, ApiError> {
    let provider = parse_provider(&provider_name)?;
    let user_id = authenticate(&headers)?;

    let date = NaiveDate::parse_from_str(&params.date, "%Y-%m-%d").map_err(|_| {
        ApiError::BadRequest(format!(
            "Invalid date '{}', expected YYYY-MM-DD",
            params.date
        ))
    })?;

    let points = state
        .metrics
        .points_for_date(&user_id, &project_id, provider, &params.scope_id, date)
        .map_err(ApiError::from)?;

    Ok(Json(MetricsResponse {
        scope_id: params.scope_id,
        date,
        points,
    }))
}

/// DELETE /api/providers/:provider/:project_id
///
/// Disconnect: remove the stored credentials and every reconciled point.
pub async fn disconnect(
    State(state): State<Arc<AppState>>,
    Path((provider_name, project_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let provider = parse_provider(&provider_name)?;
    let user_id = authenticate(&headers)?;

    let removed = state
        .vault
        .delete(&user_id, &project_id, provider)
        .map_err(ApiError::from)?;
    if !removed {
        return Err(ApiError::NotFound(format!(
            "no {provider} connection found for this project"
        )));
    }

    let points_removed = state
        .metrics
        .delete_provider_points(&user_id, &project_id, provider)
        .map_err(ApiError::from)?;

    info!(%provider, user_id = %user_id, project_id = %project_id,
        points_removed, "Provider disconnected");

    Ok(Json(DisconnectResponse {
        success: true,
        points_removed,
    }))
}
