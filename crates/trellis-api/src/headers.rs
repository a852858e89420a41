//! Header rewriting for forwarded requests
//!
//! # Security
//!
//! Console credentials (`Authorization`, `Cookie`, `Proxy-Authorization`) and
//! impersonation headers are always stripped. The downstream authenticates
//! the session's client certificate, never anything the caller sent.

use axum::body::Body;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response};
use trellis_common::{X_FORWARDED_HOST, X_FORWARDED_PATH, X_FORWARDED_PROTO};

use crate::error::{Error, Result};

/// Credential headers that must never reach the downstream
const CREDENTIAL_HEADERS: &[&str] = &["authorization", "cookie", "proxy-authorization"];

/// Prefix of impersonation headers (`Impersonate-User`, `Impersonate-Extra-*`, ...)
const IMPERSONATION_PREFIX: &str = "impersonate-";

/// Connection-scoped headers from RFC 9110 section 7.6.1
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Whether the request asks for an HTTP/1.1 protocol upgrade
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && connection_tokens(headers).iter().any(|t| t == "upgrade")
}

/// Remove console credentials and impersonation headers
pub fn strip_credential_headers(headers: &mut HeaderMap) {
    for name in CREDENTIAL_HEADERS {
        headers.remove(*name);
    }

    let impersonation: Vec<HeaderName> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(IMPERSONATION_PREFIX))
        .cloned()
        .collect();
    for name in impersonation {
        headers.remove(&name);
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
///
/// With `keep_upgrade`, the `Upgrade` header survives and `Connection` is
/// reduced to `upgrade` so the downstream sees the upgrade handshake.
pub fn strip_hop_by_hop(headers: &mut HeaderMap, keep_upgrade: bool) {
    let upgrade = if keep_upgrade {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    };

    for token in connection_tokens(headers) {
        if let Ok(name) = HeaderName::from_bytes(token.as_bytes()) {
            headers.remove(name);
        }
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }

    if let Some(upgrade) = upgrade {
        headers.insert(header::UPGRADE, upgrade);
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    }
}

/// Scheme of the listener a request arrived on
///
/// Inserted as a request extension by the server, since server-side URIs
/// carry no scheme of their own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InboundScheme(pub &'static str);

impl InboundScheme {
    /// Scheme for a listener with or without TLS
    pub fn for_listener(tls: bool) -> Self {
        if tls {
            Self("https")
        } else {
            Self("http")
        }
    }
}

/// Scheme, host and path of a request as the console received it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginalRequest {
    /// Scheme of the inbound request
    pub proto: String,
    /// Host the caller addressed
    pub host: String,
    /// Path the caller requested
    pub path: String,
}

impl OriginalRequest {
    /// Capture the original values before the request is rewritten
    ///
    /// The scheme comes from the URI, then the listener's [`InboundScheme`],
    /// then `default_scheme`.
    pub fn capture(request: &Request<Body>, default_scheme: &str) -> Self {
        let uri = request.uri();
        let proto = uri
            .scheme_str()
            .or_else(|| request.extensions().get::<InboundScheme>().map(|s| s.0))
            .unwrap_or(default_scheme)
            .to_ascii_lowercase();
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();
        Self {
            proto,
            host,
            path: uri.path().to_string(),
        }
    }

    /// Set exactly one of each `X-Forwarded-*` header
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        for (name, value) in [
            (X_FORWARDED_PROTO, &self.proto),
            (X_FORWARDED_HOST, &self.host),
            (X_FORWARDED_PATH, &self.path),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::BadParameter(format!("invalid {} value: {}", name, e)))?;
            // insert() replaces every existing value for the name
            headers.insert(HeaderName::from_static(name), value);
        }
        Ok(())
    }
}

/// Convert a downstream response for the caller, dropping hop-by-hop headers
pub fn downstream_response(response: Response<hyper::body::Incoming>) -> Response<Body> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers, false);
    Response::from_parts(parts, Body::new(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn request(uri: &str, pairs: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in pairs {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[rstest]
    #[case(&[("Upgrade", "websocket"), ("Connection", "Upgrade")], true)]
    #[case(&[("Upgrade", "SPDY/3.1"), ("Connection", "keep-alive, upgrade")], true)]
    #[case(&[("Upgrade", "websocket")], false)]
    #[case(&[("Connection", "upgrade")], false)]
    #[case(&[("Connection", "keep-alive")], false)]
    fn upgrade_detection(#[case] pairs: &[(&str, &str)], #[case] expected: bool) {
        assert_eq!(is_upgrade_request(&headers(pairs)), expected);
    }

    #[test]
    fn credentials_and_impersonation_are_stripped() {
        let mut map = headers(&[
            ("Authorization", "Bearer console-token"),
            ("Cookie", "session=abc"),
            ("Proxy-Authorization", "Basic Zm9v"),
            ("Impersonate-User", "admin"),
            ("Impersonate-Group", "system:masters"),
            ("Impersonate-Extra-scopes", "all"),
            ("Accept", "application/json"),
        ]);

        strip_credential_headers(&mut map);

        assert_eq!(map.len(), 1);
        assert!(map.contains_key("accept"));
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut map = headers(&[
            ("Connection", "keep-alive, X-Trace-Hop"),
            ("Keep-Alive", "timeout=5"),
            ("X-Trace-Hop", "1"),
            ("Transfer-Encoding", "chunked"),
            ("TE", "trailers"),
            ("Content-Type", "application/json"),
        ]);

        strip_hop_by_hop(&mut map, false);

        assert_eq!(map.len(), 1);
        assert!(map.contains_key("content-type"));
    }

    #[test]
    fn upgrade_headers_survive_when_requested() {
        let mut map = headers(&[
            ("Connection", "keep-alive, Upgrade"),
            ("Upgrade", "websocket"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);

        strip_hop_by_hop(&mut map, true);

        assert_eq!(map.get("upgrade").unwrap(), "websocket");
        assert_eq!(map.get("connection").unwrap(), "upgrade");
        assert!(map.contains_key("sec-websocket-key"));
    }

    #[test]
    fn original_request_prefers_host_header() {
        let req = request(
            "/clusters/prod/k8s/api/v1/pods?watch=1",
            &[("Host", "console.example.com")],
        );
        let original = OriginalRequest::capture(&req, "https");

        assert_eq!(
            original,
            OriginalRequest {
                proto: "https".to_string(),
                host: "console.example.com".to_string(),
                path: "/clusters/prod/k8s/api/v1/pods".to_string(),
            }
        );
    }

    #[test]
    fn original_request_falls_back_to_uri() {
        let req = request("http://console.internal:8080/clusters/prod/k8s/api", &[]);
        let original = OriginalRequest::capture(&req, "https");

        assert_eq!(original.proto, "http");
        assert_eq!(original.host, "console.internal:8080");
    }

    #[rstest]
    #[case::plain_listener(false, "http")]
    #[case::tls_listener(true, "https")]
    fn listener_scheme_beats_default(#[case] tls: bool, #[case] expected: &str) {
        let mut req = request("/clusters/prod/k8s/api", &[("Host", "console")]);
        req.extensions_mut().insert(InboundScheme::for_listener(tls));

        let original = OriginalRequest::capture(&req, "https");
        assert_eq!(original.proto, expected);
    }

    #[test]
    fn forwarded_headers_replace_caller_values() {
        let mut map = headers(&[
            ("X-Forwarded-Proto", "gopher"),
            ("X-Forwarded-Proto", "ftp"),
            ("X-Forwarded-Host", "evil.example.com"),
        ]);
        let original = OriginalRequest {
            proto: "https".to_string(),
            host: "console.example.com".to_string(),
            path: "/clusters/prod/k8s/api".to_string(),
        };

        original.apply(&mut map).unwrap();

        for name in [X_FORWARDED_PROTO, X_FORWARDED_HOST, X_FORWARDED_PATH] {
            assert_eq!(map.get_all(name).iter().count(), 1, "{} must be unique", name);
        }
        assert_eq!(map.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert_eq!(map.get(X_FORWARDED_HOST).unwrap(), "console.example.com");
        assert_eq!(map.get(X_FORWARDED_PATH).unwrap(), "/clusters/prod/k8s/api");
    }
}
