//! Rate limiting for server-side actions invoked outside an HTTP handler.

use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use super::response::ActionRejection;
use crate::ratelimit::{Decision, RateLimiter, RequestHeaders};

/// Result of running an action behind a [`ActionGuard`].
#[derive(Debug)]
pub enum ActionOutcome<T> {
    /// The limit was checked and the action ran.
    Completed { output: T, decision: Decision },
    /// No request context was available; the action ran unchecked.
    Unenforced(T),
    /// The limit was exceeded; the action did not run.
    Throttled(ActionRejection),
}

impl<T> ActionOutcome<T> {
    /// The action's output, if it ran.
    pub fn output(self) -> Option<T> {
        match self {
            ActionOutcome::Completed { output, .. } | ActionOutcome::Unenforced(output) => {
                Some(output)
            }
            ActionOutcome::Throttled(_) => None,
        }
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, ActionOutcome::Throttled(_))
    }

    pub fn is_enforced(&self) -> bool {
        !matches!(self, ActionOutcome::Unenforced(_))
    }
}

/// Wraps actions with a rate limit check.
#[derive(Debug, Clone)]
pub struct ActionGuard {
    limiter: Arc<RateLimiter>,
}

impl ActionGuard {
    pub fn new(limiter: RateLimiter) -> Self {
        Self {
            limiter: Arc::new(limiter),
        }
    }

    pub fn shared(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    /// Check the limit for `request`, then run `action` if admitted.
    ///
    /// Without a request there is nothing to identify the caller by, so the
    /// action runs unchecked and the outcome says so.
    pub async fn run<R, F, Fut, T>(&self, request: Option<&R>, action: F) -> ActionOutcome<T>
    where
        R: RequestHeaders + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(request) = request else {
            warn!(
                rule = %self.limiter.rule().identifier,
                "No request context for rate limited action; running unenforced"
            );
            return ActionOutcome::Unenforced(action().await);
        };

        let decision = self.limiter.check(request).await;
        if !decision.success {
            return ActionOutcome::Throttled(ActionRejection::from_decision(&decision));
        }

        ActionOutcome::Completed {
            output: action().await,
            decision,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Backends, PartitionBy, RuleConfig};
    use http::{HeaderMap, HeaderValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn guard(limit: u64) -> ActionGuard {
        let rule = RuleConfig::new("create-event", limit, 300, PartitionBy::UserOrIp).unwrap();
        ActionGuard::new(RateLimiter::new(rule, Backends::local()).unwrap())
    }

    fn session(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_str(&format!("next-auth.session-token={}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_completed_then_throttled() {
        let guard = guard(1);
        let req = session("A");

        let outcome = guard.run(Some(&req), || async { 42 }).await;
        match outcome {
            ActionOutcome::Completed { output, decision } => {
                assert_eq!(output, 42);
                assert_eq!(decision.key, "create-event:user:A");
                assert_eq!(decision.remaining, 0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        let outcome = guard.run(Some(&req), || async { 42 }).await;
        let ActionOutcome::Throttled(rejection) = outcome else {
            panic!("expected throttled");
        };
        assert!(!rejection.success);
        assert_eq!(rejection.status, 429);

        // Another user is unaffected.
        let other = guard.run(Some(&session("B")), || async { 7 }).await;
        assert_eq!(other.output(), Some(7));
    }

    #[tokio::test]
    async fn test_throttled_action_does_not_run() {
        let guard = guard(1);
        let req = session("A");
        let counter = AtomicUsize::new(0);
        let runs = &counter;

        guard
            .run(Some(&req), move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let outcome = guard
            .run(Some(&req), move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert!(outcome.is_throttled());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_request_is_unenforced() {
        let guard = guard(1);

        for _ in 0..3 {
            let outcome = guard.run(None::<&HeaderMap>, || async { "done" }).await;
            assert!(!outcome.is_enforced());
            assert_eq!(outcome.output(), Some("done"));
        }
    }
}
