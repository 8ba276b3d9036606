//! CSRF state brokering for the OAuth authorization flow.
//!
//! A state token is minted when a user is redirected to the provider and
//! consumed exactly once when the callback arrives. Tokens expire after a
//! TTL and are swept by a background task so abandoned flows do not
//! accumulate.

use crate::provider::Provider;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Context bound to one in-flight authorization attempt.
#[derive(Clone, Debug)]
pub struct StateEntry {
    pub provider: Provider,
    pub user_id: String,
    pub project_id: String,
    pub issued_at: DateTime<Utc>,
}

/// In-memory broker of single-use OAuth state tokens.
#[derive(Clone)]
pub struct StateBroker {
    states: Arc<Mutex<HashMap<String, StateEntry>>>,
    ttl: Duration,
}

impl StateBroker {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            states: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Mint a state token (UUID v4) bound to the given flow context.
    pub fn issue(&self, provider: Provider, user_id: &str, project_id: &str) -> String {
        self.issue_at(provider, user_id, project_id, Utc::now())
    }

    /// As [`StateBroker::issue`], with an explicit clock for tests.
    pub fn issue_at(
        &self,
        provider: Provider,
        user_id: &str,
        project_id: &str,
        now: DateTime<Utc>,
    ) -> String {
        let state = Uuid::new_v4().to_string();
        let entry = StateEntry {
            provider,
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            issued_at: now,
        };

        self.states.lock().unwrap().insert(state.clone(), entry);
        state
    }

    /// Validate and consume a state token.
    ///
    /// Removal happens under the same lock as the lookup, so a token can
    /// never succeed twice — a replayed callback sees `None`. Expired,
    /// unknown, and wrong-provider tokens all return `None`; callers report
    /// them identically so the response does not leak which check failed.
    pub fn consume(&self, state: &str, provider: Provider) -> Option<StateEntry> {
        self.consume_at(state, provider, Utc::now())
    }

    /// As [`StateBroker::consume`], with an explicit clock for tests.
    pub fn consume_at(
        &self,
        state: &str,
        provider: Provider,
        now: DateTime<Utc>,
    ) -> Option<StateEntry> {
        let mut states = self.states.lock().unwrap();

        // Remove first: even a failed validation burns the token
        let entry = states.remove(state)?;

        if now - entry.issued_at > self.ttl {
            return None;
        }
        if entry.provider != provider {
            return None;
        }

        Some(entry)
    }

    /// Drop every expired token. Called periodically by the sweeper.
    pub fn sweep_expired(&self) {
        self.sweep_expired_at(Utc::now());
    }

    fn sweep_expired_at(&self, now: DateTime<Utc>) {
        let mut states = self.states.lock().unwrap();
        states.retain(|_, entry| now - entry.issued_at <= self.ttl);
    }

    pub fn count(&self) -> usize {
        self.states.lock().unwrap().len()
    }
}

/// Background task that periodically sweeps expired state tokens.
pub async fn run_state_sweeper(broker: StateBroker, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        broker.sweep_expired();
        tracing::debug!("OAuth state sweep complete, {} states pending", broker.count());
    }
}
