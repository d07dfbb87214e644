//! Transport signals for rate limit decisions.

use chrono::SecondsFormat;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use http::{HeaderMap, Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::ratelimit::Decision;

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Retry hint used when a denial carries no computed wait.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const TOO_MANY_REQUESTS: &str = "Too many requests";

fn retry_after(decision: &Decision) -> u64 {
    decision.retry_after_secs.unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

fn exceeded_message(retry_after: u64) -> String {
    format!(
        "Rate limit exceeded. Please try again in {} seconds.",
        retry_after
    )
}

/// Quota headers for a decision.
///
/// The reset instant is RFC 3339 in UTC with millisecond precision.
/// `Retry-After` is present only on denial.
pub fn rate_limit_headers(decision: &Decision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    apply_rate_limit_headers(decision, &mut headers);
    headers
}

/// Set the quota headers for a decision on an existing header map.
pub fn apply_rate_limit_headers(decision: &Decision, headers: &mut HeaderMap) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));

    let reset = decision
        .reset_at
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    if let Ok(value) = HeaderValue::from_str(&reset) {
        headers.insert(X_RATELIMIT_RESET, value);
    }

    if !decision.success {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after(decision)));
    }
}

/// JSON body of a 429 response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
}

impl RejectionBody {
    pub fn from_decision(decision: &Decision) -> Self {
        let retry_after = retry_after(decision);
        Self {
            error: TOO_MANY_REQUESTS.to_string(),
            message: exceeded_message(retry_after),
            retry_after,
        }
    }
}

/// A 429 response carrying the rejection body and quota headers.
pub fn rejection_response<B: From<String>>(decision: &Decision) -> Response<B> {
    let body = RejectionBody::from_decision(decision);
    let json = serde_json::to_string(&body).unwrap_or_else(|e| {
        error!(error = %e, "Failed to serialize rejection body");
        format!(r#"{{"error":"{}"}}"#, TOO_MANY_REQUESTS)
    });

    let mut response = Response::new(B::from(json));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    apply_rate_limit_headers(decision, headers);
    response
}

/// Payload returned by a throttled action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionRejection {
    pub success: bool,
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl ActionRejection {
    pub fn from_decision(decision: &Decision) -> Self {
        Self {
            success: false,
            error: TOO_MANY_REQUESTS.to_string(),
            message: exceeded_message(retry_after(decision)),
            status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::CountSource;
    use chrono::DateTime;

    fn decision(success: bool) -> Decision {
        Decision {
            success,
            limit: 3,
            remaining: if success { 2 } else { 0 },
            reset_at: DateTime::from_timestamp_millis(1_700_000_060_250).unwrap(),
            retry_after_secs: if success { None } else { Some(42) },
            key: "auth:ip:1.2.3.4".to_string(),
            source: CountSource::Fallback,
        }
    }

    #[test]
    fn test_headers_when_allowed() {
        let headers = rate_limit_headers(&decision(true));
        assert_eq!(headers["x-ratelimit-limit"], "3");
        assert_eq!(headers["x-ratelimit-remaining"], "2");
        assert_eq!(headers["x-ratelimit-reset"], "2023-11-14T22:14:20.250Z");
        assert!(headers.get("retry-after").is_none());
    }

    #[test]
    fn test_headers_when_denied() {
        let headers = rate_limit_headers(&decision(false));
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["retry-after"], "42");
    }

    #[test]
    fn test_rejection_response() {
        let response: Response<String> = rejection_response(&decision(false));
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(response.headers()["retry-after"], "42");

        let body: serde_json::Value = serde_json::from_str(response.body()).unwrap();
        assert_eq!(body["error"], "Too many requests");
        assert_eq!(body["retryAfter"], 42);
        assert_eq!(
            body["message"],
            "Rate limit exceeded. Please try again in 42 seconds."
        );
    }

    #[test]
    fn test_action_rejection_shape() {
        let rejection = ActionRejection::from_decision(&decision(false));
        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["status"], 429);
        assert_eq!(json["error"], "Too many requests");
    }
}
