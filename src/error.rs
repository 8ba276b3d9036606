//! Error taxonomy for the sync core.
//!
//! Per-metric fetch failures are never represented here — they are tallied
//! into the `SyncReport` by the reconciliation engine. These variants cover
//! the failures that must reach the caller with a distinguishable kind, so
//! the frontend can choose between "reconnect" and "retry" messaging.

use crate::credentials::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or malformed secrets/keys. Fatal at startup, not per-request.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// OAuth correlation failure — expired, malformed, or already-consumed
    /// state. The user must restart the handshake. Deliberately carries no
    /// detail about which case occurred.
    #[error("invalid or expired OAuth state")]
    InvalidState,

    /// No stored credentials for this (user, project, provider).
    #[error("no {provider} connection found for this project")]
    NoConnection { provider: &'static str },

    /// The refresh token is dead or revoked. The user must redo the OAuth
    /// handshake — retrying will not help.
    #[error("reauthorization required: {0}")]
    ReauthorizationRequired(String),

    /// Retryable network or rate-limit failure from the provider.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// The requested property/account does not exist or is not accessible.
    #[error("scope not found: {0}")]
    ScopeNotFound(String),

    /// Backing store unavailable. Aborts the current unit of work; prior
    /// successful upserts remain intact.
    #[error("persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl SyncError {
    /// True when retrying the same call may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::TransientProvider(_))
    }
}
