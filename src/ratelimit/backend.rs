//! Counting backend trait shared by the distributed store and the local fallback.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::Result;

/// Outcome of one counting step for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTally {
    /// Whether this check was admitted
    pub success: bool,
    /// Admissions in the window including this attempt
    pub count: u64,
    /// Quota left after this check
    pub remaining: u64,
    /// When capacity next frees up
    pub reset_at: DateTime<Utc>,
}

impl WindowTally {
    /// Derive success and remaining quota from a raw count.
    pub fn from_count(count: u64, limit: u64, reset_at: DateTime<Utc>) -> Self {
        Self {
            success: count <= limit,
            count,
            remaining: limit.saturating_sub(count),
            reset_at,
        }
    }
}

/// Trait for window counter implementations.
///
/// A check counts one attempt against `key` and reports whether it fits in
/// `limit` admissions per `window`. The increment must be committed by the
/// time the result is returned so a cancelled caller cannot desynchronize the
/// counter. Store failures are returned, never reported as admissions.
#[async_trait]
pub trait CountingBackend: Send + Sync {
    async fn check(&self, key: &str, limit: u64, window: Duration) -> Result<WindowTally>;

    /// Short name for logs and decisions.
    fn name(&self) -> &'static str;
}
