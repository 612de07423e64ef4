pub mod oauth;
pub mod poll;
pub mod webhook;

pub use oauth::{HttpTokenEndpoint, TokenEndpoint, TokenError, TokenLease, TokenManager, TokenState};
pub use poll::{PollClient, PollError, PollSummary};
pub use webhook::{router, verify_signature, WebhookState};
