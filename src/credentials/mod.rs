//! Encrypted credential vault for provider OAuth tokens.
//!
//! Secure storage for access and refresh tokens keyed by
//! (user, project, provider), using AES-256-GCM encryption backed by SQLite.
//!
//! # Security
//!
//! - All tokens encrypted at rest with AES-256-GCM
//! - Each token field has a unique nonce (never reused)
//! - Master key must be 32 bytes (256 bits), supplied via `PULSE_ENCRYPTION_KEY`
//! - Plaintext tokens exist only transiently, inside refresh and fetch calls
//! - Authenticated encryption (tampering detected, never garbage output)

use serde::{Deserialize, Serialize};

mod encryption;
mod storage;

pub use encryption::CryptoError;
pub use storage::CredentialStore;

// Re-export encryption primitives for utilities and tests
pub use encryption::{decrypt, encrypt, validate_key};

/// Plaintext credentials for one connected provider account.
///
/// Produced by the vault's decrypting reads and by the token refresh
/// manager; consumed by source adapters. Never persisted in this form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credentials {
    /// OAuth access token (used for API requests)
    pub access_token: String,

    /// OAuth refresh token (used to obtain new access tokens)
    pub refresh_token: Option<String>,

    /// Provider-side account identifier (e.g. a Stripe connected account id)
    pub account_id: Option<String>,

    /// Provider-side display name, denormalized for display and audit
    pub account_name: Option<String>,

    /// Token endpoint to replay refresh against
    pub token_uri: String,

    /// Scopes granted during the handshake
    pub scopes: Vec<String>,
}

/// One encrypted field: base64 ciphertext plus the nonce it was sealed with.
#[derive(Clone, Debug)]
pub struct EncryptedField {
    pub ciphertext: String,
    pub nonce: String,
}

/// A credential row as stored, tokens still encrypted.
///
/// Returned by [`CredentialStore::load`] for callers that do not need
/// plaintext (status listings, audit).
#[derive(Clone, Debug)]
pub struct EncryptedCredential {
    pub access_token: EncryptedField,
    pub refresh_token: Option<EncryptedField>,
    pub account_id: Option<String>,
    pub account_name: Option<String>,
    pub token_uri: String,
    pub scopes_json: String,
    pub created_at: String,
    pub updated_at: String,
}
