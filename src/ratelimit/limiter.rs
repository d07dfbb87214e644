//! Core rate limiter implementation.
//!
//! The limiter resolves the caller, builds the partition key, and counts it in
//! the shared store. When the store errors or does not answer within the
//! configured bound, the same key is counted in the process-local fallback
//! instead: a store outage coarsens throttling but never fails a request.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::{CountingBackend, WindowTally};
use super::clock::Clock;
use super::counter::FixedWindowCounter;
use super::identity::{Identity, IdentityResolver, RequestHeaders};
use super::key::PartitionKey;
use super::rules::RuleConfig;
use crate::error::{QuotaguardError, Result};

/// Default bound on a single shared-store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Which counter produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountSource {
    /// The shared store
    Distributed,
    /// The process-local fallback
    Fallback,
    /// No rule was evaluated
    Unchecked,
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Whether the request may proceed
    pub success: bool,
    /// Admissions allowed per window by the rule
    pub limit: u64,
    /// Admissions left in the current window
    pub remaining: u64,
    /// When quota next frees up
    pub reset_at: DateTime<Utc>,
    /// Seconds to wait before retrying, only on denial
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Partition key that was counted
    pub key: String,
    /// Counter that produced this decision
    pub source: CountSource,
}

impl Decision {
    fn from_tally(
        tally: WindowTally,
        limit: u64,
        key: &PartitionKey,
        source: CountSource,
        now: DateTime<Utc>,
    ) -> Self {
        let retry_after_secs = if tally.success {
            None
        } else {
            let wait_ms = (tally.reset_at - now).num_milliseconds().max(0) as u64;
            Some(wait_ms.div_ceil(1000).max(1))
        };

        Self {
            success: tally.success,
            limit,
            remaining: limit.saturating_sub(tally.count),
            reset_at: tally.reset_at,
            retry_after_secs,
            key: key.to_string(),
            source,
        }
    }

    /// Decision used when no rule applies.
    fn unchecked(now: DateTime<Utc>) -> Self {
        Self {
            success: true,
            limit: 0,
            remaining: 0,
            reset_at: now,
            retry_after_secs: None,
            key: "none".to_string(),
            source: CountSource::Unchecked,
        }
    }
}

/// Counting backends shared by every limiter in a process.
///
/// Holds the optional shared store, the process-owned fallback counter and
/// the clock both read. Cheap to clone.
#[derive(Clone)]
pub struct Backends {
    primary: Option<Arc<dyn CountingBackend>>,
    fallback: Arc<FixedWindowCounter>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends")
            .field("primary", &self.primary.as_ref().map(|p| p.name()))
            .field("fallback", &self.fallback)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

impl Backends {
    /// Fallback-only backends using `fallback` and its clock.
    pub fn with_fallback(fallback: Arc<FixedWindowCounter>) -> Self {
        Self {
            primary: None,
            clock: fallback.clock(),
            fallback,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Fallback-only backends with a fresh counter on the system clock.
    pub fn local() -> Self {
        Self::with_fallback(Arc::new(FixedWindowCounter::new()))
    }

    /// Use `primary` as the shared store.
    pub fn with_primary(mut self, primary: Arc<dyn CountingBackend>) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Bound each shared-store round trip.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// The shared store, if configured.
    pub fn primary(&self) -> Option<&Arc<dyn CountingBackend>> {
        self.primary.as_ref()
    }

    /// The process-local counter.
    pub fn fallback(&self) -> &Arc<FixedWindowCounter> {
        &self.fallback
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Count `key`, preferring the shared store.
    async fn count(&self, key: &PartitionKey, limit: u64, window: Duration) -> (WindowTally, CountSource) {
        if let Some(primary) = &self.primary {
            let attempt = tokio::time::timeout(
                self.store_timeout,
                primary.check(key.as_str(), limit, window),
            )
            .await
            .unwrap_or(Err(QuotaguardError::StoreTimeout(self.store_timeout)));

            match attempt {
                Ok(tally) => return (tally, CountSource::Distributed),
                Err(e) => {
                    warn!(
                        key = %key,
                        backend = primary.name(),
                        error = %e,
                        "Rate limit store failed, falling back to in-memory counter"
                    );
                }
            }
        }

        (self.fallback.increment(key.as_str(), limit, window), CountSource::Fallback)
    }
}

/// A rate limiter enforcing one rule.
///
/// Thread-safe; build one per call site and share it.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    rule: RuleConfig,
    backends: Backends,
    resolver: IdentityResolver,
}

impl RateLimiter {
    /// Create a limiter for `rule`.
    ///
    /// # Errors
    /// Fails if the rule has a zero limit or window or an unusable identifier.
    pub fn new(rule: RuleConfig, backends: Backends) -> Result<Self> {
        rule.validate()?;
        Ok(Self {
            rule,
            backends,
            resolver: IdentityResolver::default(),
        })
    }

    /// Use a custom identity resolver.
    pub fn with_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn rule(&self) -> &RuleConfig {
        &self.rule
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Resolve the caller behind `request`.
    pub fn identify<R: RequestHeaders + ?Sized>(&self, request: &R) -> Identity {
        self.resolver.resolve(request)
    }

    /// Check the rate limit for a request.
    pub async fn check<R: RequestHeaders + ?Sized>(&self, request: &R) -> Decision {
        let identity = self.identify(request);
        self.check_identity(&identity).await
    }

    /// Check the rate limit for an already resolved caller.
    pub async fn check_identity(&self, identity: &Identity) -> Decision {
        let key = PartitionKey::build(&self.rule, identity);
        self.check_key(&key).await
    }

    /// Count one attempt against an explicit partition key.
    pub async fn check_key(&self, key: &PartitionKey) -> Decision {
        trace!(key = %key, limit = self.rule.limit, "Checking rate limit");

        let (tally, source) = self
            .backends
            .count(key, self.rule.limit, self.rule.window())
            .await;
        let decision = Decision::from_tally(
            tally,
            self.rule.limit,
            key,
            source,
            self.backends.clock.now(),
        );

        if !decision.success {
            debug!(
                key = %key,
                limit = self.rule.limit,
                retry_after = ?decision.retry_after_secs,
                source = ?source,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// Check several limiters in order; every one must pass.
    ///
    /// Returns the first denial. When all pass, returns the decision with the
    /// least quota left, which is the constraint closest to binding.
    pub async fn check_multiple<R: RequestHeaders + ?Sized>(
        request: &R,
        limiters: &[RateLimiter],
    ) -> Decision {
        let mut strictest: Option<Decision> = None;

        for limiter in limiters {
            let decision = limiter.check(request).await;
            if !decision.success {
                return decision;
            }

            let tighter = strictest
                .as_ref()
                .map_or(true, |current| decision.remaining < current.remaining);
            if tighter {
                strictest = Some(decision);
            }
        }

        strictest.unwrap_or_else(|| Decision::unchecked(Utc::now()))
    }
}

/// Build a limiter for `rule` and check one request against it.
pub async fn check_rate_limit<R: RequestHeaders + ?Sized>(
    request: &R,
    rule: RuleConfig,
    backends: &Backends,
) -> Result<Decision> {
    let limiter = RateLimiter::new(rule, backends.clone())?;
    Ok(limiter.check(request).await)
}
