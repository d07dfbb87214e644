//! HTTP surface for rate limit decisions.
//!
//! Turns a [`Decision`](crate::ratelimit::Decision) into quota headers or a
//! 429 response, and provides a tower layer and an action guard that apply a
//! limiter around handlers.

mod action;
mod layer;
mod response;

pub use action::{ActionGuard, ActionOutcome};
pub use layer::{RateLimitLayer, RateLimitService};
pub use response::{
    apply_rate_limit_headers, rate_limit_headers, rejection_response, ActionRejection,
    RejectionBody, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
