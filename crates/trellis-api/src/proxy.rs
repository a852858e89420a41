//! HTTP handlers for forwarded routes
//!
//! Each handler resolves the caller's session from its bearer token before
//! anything is dialed, then hands the request to the [`Forwarder`].
//!
//! [`Forwarder`]: crate::forwarder::Forwarder

use axum::body::Body;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Request};
use axum::response::Response;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::forwarder::ForwardRequest;
use crate::server::AppState;
use crate::session::Session;

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Session of the caller, rejected with 403 when absent or unknown
pub struct CurrentSession(pub Session);

impl FromRequestParts<AppState> for CurrentSession {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = extract_bearer_token(&parts.headers)
            .ok_or_else(|| Error::AccessDenied("missing bearer token".into()))?;
        state
            .sessions
            .resolve(token)
            .map(CurrentSession)
            .ok_or_else(|| Error::AccessDenied("unknown session".into()))
    }
}

/// Path parameters for API server routes
#[derive(Debug, Deserialize)]
pub struct KubePath {
    /// Target cluster name
    pub cluster: String,
    /// API path below the cluster prefix (e.g. "api/v1/pods")
    pub path: String,
}

/// Path parameters for service routes
#[derive(Debug, Deserialize)]
pub struct ServicePath {
    /// Target cluster name
    pub cluster: String,
    /// Service namespace
    pub namespace: String,
    /// Service name, optionally with a port (`name:port`)
    pub service: String,
    /// Path requested on the service
    #[serde(default)]
    pub path: String,
}

/// Split `name[:port]` into a service name and port (0 when absent)
pub fn parse_service_ref(service: &str) -> Result<(String, u16)> {
    match service.split_once(':') {
        None => Ok((service.to_string(), 0)),
        Some((name, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                Error::BadParameter(format!("invalid port in service '{}'", service))
            })?;
            Ok((name.to_string(), port))
        }
    }
}

/// Handle `/clusters/{cluster}/k8s/{*path}`
pub async fn kube_handler(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(params): Path<KubePath>,
    request: Request<Body>,
) -> Result<Response<Body>> {
    debug!(
        cluster = %params.cluster,
        user = %session.user,
        path = %params.path,
        "API server request received"
    );

    state
        .forwarder
        .forward_to_kube(&session, request, &params.cluster, &params.path)
        .await
}

/// Handle `/clusters/{cluster}/namespaces/{namespace}/services/{service}/proxy/{*path}`
pub async fn service_handler(
    State(state): State<AppState>,
    CurrentSession(session): CurrentSession,
    Path(params): Path<ServicePath>,
    request: Request<Body>,
) -> Result<Response<Body>> {
    let (service, port) = parse_service_ref(&params.service)?;
    let target = ForwardRequest::new(params.cluster, service)
        .with_namespace(params.namespace)
        .with_port(port)
        .with_path(params.path);

    debug!(
        cluster = %target.cluster,
        user = %session.user,
        destination = %target.destination(),
        "Service request received"
    );

    state
        .forwarder
        .forward_to_service(&session, request, target)
        .await
}
