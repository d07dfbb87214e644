//! Caller identity resolution from request headers.

use http::HeaderMap;
use serde::Serialize;

/// Sentinel used when no client address header is present.
pub const UNKNOWN_IP: &str = "unknown";

/// Address headers consulted in order: edge proxy, reverse proxy, forwarded chain.
const IP_HEADERS: [&str; 3] = ["cf-connecting-ip", "x-real-ip", "x-forwarded-for"];

const BEARER_PREFIX: &str = "Bearer ";

/// Read-only header access for an inbound request.
///
/// Names are passed lowercase.
pub trait RequestHeaders {
    /// First value of the named header, if it is present and valid UTF-8.
    fn header(&self, name: &str) -> Option<&str>;

    /// Every value of the named header.
    fn header_all(&self, name: &str) -> Vec<&str> {
        self.header(name).into_iter().collect()
    }
}

impl RequestHeaders for HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    fn header_all(&self, name: &str) -> Vec<&str> {
        self.get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }
}

impl<B> RequestHeaders for http::Request<B> {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers().header(name)
    }

    fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers().header_all(name)
    }
}

impl RequestHeaders for http::request::Parts {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.header(name)
    }

    fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers.header_all(name)
    }
}

/// The resolved caller behind a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    /// Client address, or [`UNKNOWN_IP`].
    pub client_ip: String,
    /// Session or bearer derived user id.
    pub user_id: Option<String>,
}

impl Identity {
    /// An identity with an address and no user.
    pub fn anonymous(client_ip: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            user_id: None,
        }
    }

    /// An identity with both an address and a user.
    pub fn user(client_ip: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            user_id: Some(user_id.into()),
        }
    }
}

/// Derives an [`Identity`] from request headers.
///
/// Resolution never fails: missing or malformed headers degrade to the
/// unknown address and no user. All unknown callers share one bucket.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    session_cookies: Vec<String>,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self {
            session_cookies: vec![
                "next-auth.session-token".to_string(),
                "__Secure-next-auth.session-token".to_string(),
            ],
        }
    }
}

impl IdentityResolver {
    /// Create a resolver recognising the given session cookie names, in priority order.
    pub fn with_session_cookies<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            session_cookies: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Resolve both the client address and the user id.
    pub fn resolve<R: RequestHeaders + ?Sized>(&self, request: &R) -> Identity {
        Identity {
            client_ip: self.client_ip(request),
            user_id: self.user_id(request),
        }
    }

    /// Client address from proxy headers, or [`UNKNOWN_IP`].
    pub fn client_ip<R: RequestHeaders + ?Sized>(&self, request: &R) -> String {
        IP_HEADERS
            .iter()
            .filter_map(|name| request.header(name))
            .filter_map(|value| value.split(',').next())
            .map(str::trim)
            .find(|ip| !ip.is_empty() && *ip != UNKNOWN_IP)
            .unwrap_or(UNKNOWN_IP)
            .to_string()
    }

    /// User id from a session cookie, else from a bearer token.
    pub fn user_id<R: RequestHeaders + ?Sized>(&self, request: &R) -> Option<String> {
        if let Some(session) = self.session_token(request) {
            return Some(session);
        }

        request
            .header("authorization")
            .and_then(|auth| auth.strip_prefix(BEARER_PREFIX))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| format!("bearer:{}", token))
    }

    fn session_token<R: RequestHeaders + ?Sized>(&self, request: &R) -> Option<String> {
        let cookie_headers = request.header_all("cookie");

        // Cookie names are matched in resolver priority, not header order.
        self.session_cookies.iter().find_map(|wanted| {
            cookie_headers
                .iter()
                .flat_map(|header| header.split(';'))
                .filter_map(|pair| pair.trim().split_once('='))
                .find(|(name, value)| *name == wanted.as_str() && !value.is_empty())
                .map(|(_, value)| value.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_ip_header_priority() {
        let resolver = IdentityResolver::default();
        let req = headers(&[
            ("x-forwarded-for", "10.0.0.1"),
            ("x-real-ip", "10.0.0.2"),
            ("cf-connecting-ip", "10.0.0.3"),
        ]);
        assert_eq!(resolver.client_ip(&req), "10.0.0.3");

        let req = headers(&[("x-forwarded-for", "10.0.0.1"), ("x-real-ip", "10.0.0.2")]);
        assert_eq!(resolver.client_ip(&req), "10.0.0.2");
    }

    #[test]
    fn test_forwarded_for_takes_first_hop() {
        let resolver = IdentityResolver::default();
        let req = headers(&[("x-forwarded-for", " 1.2.3.4 , 5.6.7.8, 9.9.9.9")]);
        assert_eq!(resolver.client_ip(&req), "1.2.3.4");
    }

    #[test]
    fn test_missing_or_empty_ip_is_unknown() {
        let resolver = IdentityResolver::default();
        assert_eq!(resolver.client_ip(&HeaderMap::new()), UNKNOWN_IP);

        let req = headers(&[("x-real-ip", "  "), ("x-forwarded-for", "")]);
        assert_eq!(resolver.client_ip(&req), UNKNOWN_IP);
    }

    #[test]
    fn test_unknown_value_falls_through() {
        let resolver = IdentityResolver::default();
        let req = headers(&[("x-real-ip", "unknown"), ("x-forwarded-for", "4.4.4.4")]);
        assert_eq!(resolver.client_ip(&req), "4.4.4.4");
    }

    #[test]
    fn test_session_cookie_wins_over_bearer() {
        let resolver = IdentityResolver::default();
        let req = headers(&[
            ("cookie", "theme=dark; next-auth.session-token=abc123; other=1"),
            ("authorization", "Bearer tok"),
        ]);
        assert_eq!(resolver.user_id(&req), Some("abc123".to_string()));
    }

    #[test]
    fn test_secure_session_cookie() {
        let resolver = IdentityResolver::default();
        let req = headers(&[("cookie", "__Secure-next-auth.session-token=s3cr3t")]);
        assert_eq!(resolver.user_id(&req), Some("s3cr3t".to_string()));
    }

    #[test]
    fn test_cookie_value_keeps_padding() {
        let resolver = IdentityResolver::default();
        let req = headers(&[("cookie", "next-auth.session-token=eyJh.Zm9v==")]);
        assert_eq!(resolver.user_id(&req), Some("eyJh.Zm9v==".to_string()));
    }

    #[test]
    fn test_split_cookie_headers_are_scanned() {
        let resolver = IdentityResolver::default();
        let req = headers(&[("cookie", "a=1"), ("cookie", "next-auth.session-token=xyz")]);
        assert_eq!(resolver.user_id(&req), Some("xyz".to_string()));
    }

    #[test]
    fn test_bearer_token_is_prefixed() {
        let resolver = IdentityResolver::default();
        let req = headers(&[("authorization", "Bearer api-key-1")]);
        assert_eq!(resolver.user_id(&req), Some("bearer:api-key-1".to_string()));
    }

    #[test]
    fn test_no_user_sources() {
        let resolver = IdentityResolver::default();
        let req = headers(&[
            ("cookie", "next-auth.session-token="),
            ("authorization", "Basic dXNlcjpwYXNz"),
        ]);
        assert_eq!(resolver.user_id(&req), None);

        let req = headers(&[("authorization", "Bearer ")]);
        assert_eq!(resolver.user_id(&req), None);
    }

    #[test]
    fn test_custom_cookie_names() {
        let resolver = IdentityResolver::with_session_cookies(["sid"]);
        let req = headers(&[("cookie", "next-auth.session-token=a; sid=b")]);
        assert_eq!(resolver.user_id(&req), Some("b".to_string()));
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let resolver = IdentityResolver::default();
        let req = http::Request::builder()
            .header("x-forwarded-for", "1.2.3.4")
            .header("cookie", "next-auth.session-token=u1")
            .body(())
            .unwrap();

        let first = resolver.resolve(&req);
        let second = resolver.resolve(&req);
        assert_eq!(first, second);
        assert_eq!(first, Identity::user("1.2.3.4", "u1"));
    }
}
