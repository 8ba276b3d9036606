//! OAuth connection flow endpoints.
//!
//! `GET connect` is called by the authenticated frontend and redirects the
//! browser to the provider. `GET callback` is hit by the provider redirect —
//! it carries no bearer token, so the user is identified solely by the
//! consumed state entry. The callback always ends in a browser redirect to
//! the frontend with a generic ok/error flag; failure detail stays in the
//! server log.

use super::{ApiError, AppState};
use crate::auth::extract_bearer_token;
use crate::credentials::Credentials;
use crate::error::SyncError;
use crate::oauth::exchange_code_for_token;
use crate::provider::{oauth_endpoints, verify_scopes, Provider};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{Json, Redirect},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Deserialize)]
pub struct ConnectParams {
    pub project_id: String,
}

#[derive(Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub success: bool,
}

fn callback_uri(state: &AppState, provider: Provider) -> String {
    format!(
        "{}/api/providers/{}/callback",
        state.config.server.callback_base_url, provider
    )
}

fn frontend_redirect(state: &AppState, project_id: Option<&str>, ok: bool) -> Redirect {
    let status = if ok { "ok" } else { "error" };
    let url = match project_id {
        Some(project_id) => format!(
            "{}/projects/{}?connected={}",
            state.config.server.frontend_url, project_id, status
        ),
        None => format!("{}?connected={}", state.config.server.frontend_url, status),
    };
    Redirect::temporary(&url)
}

/// GET /api/providers/:provider/connect?project_id=...
///
/// Mints a CSRF state bound to (user, project, provider) and redirects the
/// browser to the provider's authorization page.
pub async fn oauth_start(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
) -> Result<Redirect, ApiError> {
    let provider = Provider::parse(&provider_name)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown provider '{provider_name}'")))?;

    let user_id = extract_bearer_token(&headers)
        .map_err(|e| ApiError::Unauthorized(format!("Invalid token: {e}")))?;

    let endpoints = oauth_endpoints(provider).ok_or_else(|| {
        error!(%provider, "OAuth client credentials not configured");
        ApiError::ServerError(format!(
            "OAuth not configured for {provider}. Set PULSE_OAUTH_{}_CLIENT_ID and PULSE_OAUTH_{}_CLIENT_SECRET.",
            provider_name.to_uppercase(),
            provider_name.to_uppercase()
        ))
    })?;

    let csrf_state = state.broker.issue(provider, &user_id, &params.project_id);
    let auth_url = endpoints.build_auth_url(&csrf_state, &callback_uri(&state, provider));

    info!(%provider, user_id = %user_id, project_id = %params.project_id,
        "Redirecting to OAuth provider");

    Ok(Redirect::temporary(&auth_url))
}

/// GET /api/providers/:provider/callback
///
/// Completes the handshake: consume the state, exchange the code, verify
/// granted scopes, persist credentials, and kick off an initial sync in the
/// background. Every failure path redirects the browser to the frontend
/// with the same generic error flag.
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let Some(provider) = Provider::parse(&provider_name) else {
        warn!(provider = %provider_name, "Callback for unknown provider");
        return frontend_redirect(&state, None, false);
    };

    // User denied the grant on the provider's page
    if let Some(error) = &params.error {
        warn!(
            %provider,
            error = %error,
            description = params.error_description.as_deref().unwrap_or(""),
            "OAuth authorization denied"
        );
        return frontend_redirect(&state, None, false);
    }

    let (Some(code), Some(csrf_state)) = (params.code.as_deref(), params.state.as_deref()) else {
        warn!(%provider, "Callback missing code or state");
        return frontend_redirect(&state, None, false);
    };

    let Some(entry) = state.broker.consume(csrf_state, provider) else {
        warn!(%provider, "{}", SyncError::InvalidState);
        return frontend_redirect(&state, None, false);
    };
    let project_id = entry.project_id.clone();

    match complete_connection(&state, provider, &entry.user_id, &project_id, code).await {
        Ok(()) => frontend_redirect(&state, Some(&project_id), true),
        Err(e) => {
            error!(%provider, user_id = %entry.user_id, project_id = %project_id,
                error = %e, "OAuth connection failed");
            frontend_redirect(&state, Some(&project_id), false)
        }
    }
}

async fn complete_connection(
    state: &AppState,
    provider: Provider,
    user_id: &str,
    project_id: &str,
    code: &str,
) -> Result<(), SyncError> {
    let endpoints = oauth_endpoints(provider).ok_or_else(|| {
        SyncError::Configuration(format!("OAuth client credentials not set for {provider}"))
    })?;

    let grant = exchange_code_for_token(
        &endpoints.token_url,
        code,
        &callback_uri(state, provider),
        &endpoints.client_id,
        &endpoints.client_secret,
    )
    .await?;

    if !verify_scopes(provider, &grant.scopes) {
        return Err(SyncError::ReauthorizationRequired(format!(
            "{provider} grant is missing required scopes"
        )));
    }

    let mut credentials = Credentials {
        access_token: grant.access_token,
        refresh_token: grant.refresh_token,
        account_id: grant.stripe_user_id,
        account_name: None,
        token_uri: endpoints.token_url.clone(),
        scopes: grant.scopes,
    };

    // Best-effort identity lookup; a connection without a display name is
    // still a working connection
    if let Some(adapter) = state.registry.get(provider) {
        match adapter.account_info(&credentials).await {
            Ok(info) => {
                credentials.account_id.get_or_insert(info.id);
                credentials.account_name = Some(info.display_name);
            }
            Err(e) => {
                warn!(%provider, error = %e, "Could not resolve account identity");
            }
        }
    }

    state
        .vault
        .store(user_id, project_id, provider, &credentials)?;

    info!(%provider, user_id, project_id,
        has_refresh_token = credentials.refresh_token.is_some(),
        "Provider connected");

    // Initial sync runs in the background; the browser redirect must not
    // wait on provider APIs
    let engine = state.engine.clone();
    let (user_id, project_id) = (user_id.to_string(), project_id.to_string());
    tokio::spawn(async move {
        match engine.reconcile(&user_id, &project_id, provider, None).await {
            Ok(report) => {
                debug!(%provider, stored = report.stored, updated = report.updated,
                    "Initial sync complete");
            }
            Err(e) => {
                warn!(%provider, error = %e, "Initial sync failed");
            }
        }
    });

    Ok(())
}

/// POST /api/providers/:provider/refresh/:project_id
///
/// Force a token refresh outside the reactive path, for support tooling.
pub async fn refresh_token(
    State(state): State<Arc<AppState>>,
    Path((provider_name, project_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<RefreshResponse>, ApiError> {
    let provider = Provider::parse(&provider_name)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown provider '{provider_name}'")))?;

    let user_id = extract_bearer_token(&headers)
        .map_err(|e| ApiError::Unauthorized(format!("Invalid token: {e}")))?;

    let credentials = state
        .vault
        .get(&user_id, &project_id, provider)
        .map_err(ApiError::from)?
        .ok_or(SyncError::NoConnection {
            provider: provider.as_str(),
        })
        .map_err(ApiError::from)?;

    state
        .refresher
        .refresh(&user_id, &project_id, provider, &credentials)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(RefreshResponse { success: true }))
}
