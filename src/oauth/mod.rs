//! OAuth 2.0 plumbing: CSRF state brokering, code exchange, token refresh.

mod exchange;
mod refresh;
mod state;

pub use exchange::{exchange_code_for_token, TokenGrant};
pub use refresh::TokenRefresher;
pub use state::{run_state_sweeper, StateBroker, StateEntry};
