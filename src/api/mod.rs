//! HTTP API.
//!
//! Two route groups: the OAuth connection flow (`connect`) and the
//! reconciliation/status endpoints (`sync`). User identity is the bearer
//! token, treated as an opaque user key; the browser-facing OAuth callback
//! carries no token and identifies the user through the consumed state
//! entry instead.

pub mod connect;
pub mod sync;

use crate::config::PulseConfig;
use crate::credentials::CredentialStore;
use crate::error::SyncError;
use crate::metrics::MetricStore;
use crate::oauth::{StateBroker, TokenRefresher};
use crate::provider::AdapterRegistry;
use crate::sync::SyncEngine;
use axum::{
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::warn;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub vault: Arc<CredentialStore>,
    pub metrics: Arc<MetricStore>,
    pub engine: SyncEngine,
    pub broker: StateBroker,
    pub refresher: TokenRefresher,
    pub registry: AdapterRegistry,
    pub config: PulseConfig,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// API-level error, rendered as a JSON body with the matching status code.
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ServerError(String),
    BadGateway(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };

        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NoConnection { .. } => ApiError::NotFound(err.to_string()),
            SyncError::ReauthorizationRequired(_) | SyncError::InvalidState => {
                ApiError::Unauthorized(err.to_string())
            }
            SyncError::ScopeNotFound(_) => ApiError::NotFound(err.to_string()),
            SyncError::TransientProvider(_) => ApiError::BadGateway(err.to_string()),
            SyncError::Configuration(_) => ApiError::ServerError(err.to_string()),
            SyncError::Persistence(_) | SyncError::Crypto(_) => {
                // Do not echo storage internals to clients
                warn!(error = %err, "Internal storage failure");
                ApiError::ServerError("internal storage error".to_string())
            }
        }
    }
}

/// Build the full API router with the CORS layer applied.
pub fn create_router(state: AppState) -> Router {
    let cors = match state.config.server.cors_origin.parse::<HeaderValue>() {
        Ok(origin) => CorsLayer::new()
            .allow_origin(origin)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([axum::http::header::AUTHORIZATION, axum::http::header::CONTENT_TYPE]),
        Err(_) => {
            warn!(
                origin = %state.config.server.cors_origin,
                "Invalid CORS origin in config, denying cross-origin requests"
            );
            CorsLayer::new()
        }
    };

    Router::new()
        .route("/api/providers", get(sync::list_providers))
        .route("/api/providers/:provider/connect", get(connect::oauth_start))
        .route(
            "/api/providers/:provider/callback",
            get(connect::oauth_callback),
        )
        .route(
            "/api/providers/:provider/refresh/:project_id",
            post(connect::refresh_token),
        )
        .route(
            "/api/providers/:provider/sync/:project_id",
            get(sync::trigger_sync),
        )
        .route(
            "/api/providers/:provider/scopes/:project_id",
            get(sync::list_scopes),
        )
        .route(
            "/api/providers/:provider/metrics/:project_id",
            get(sync::read_metrics),
        )
        .route(
            "/api/providers/:provider/:project_id",
            delete(sync::disconnect),
        )
        .with_state(Arc::new(state))
        .layer(cors)
}
