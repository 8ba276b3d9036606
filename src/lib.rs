//! Pulse: OAuth-connected metric synchronization service.
//!
//! Connects user projects to external analytics providers (Google
//! Analytics, Stripe) through OAuth 2.0, stores credentials encrypted at
//! rest, and idempotently reconciles per-date metric values into SQLite.

pub mod api;
pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod metrics;
pub mod oauth;
pub mod provider;
pub mod sync;
