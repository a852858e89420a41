//! Forwarder HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{any, get};
use axum::{Extension, Router};
use axum_server::tls_rustls::RustlsConfig;
use tracing::info;
use zeroize::Zeroizing;

use crate::error::Error;
use crate::forwarder::Forwarder;
use crate::headers::InboundScheme;
use crate::proxy::{kube_handler, service_handler};
use crate::session::SessionResolver;

/// Server configuration
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the server
    pub addr: SocketAddr,
    /// TLS certificate and key PEM; plain HTTP when absent
    pub tls: Option<(String, Zeroizing<String>)>,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Forwarder with its pipeline cache
    pub forwarder: Arc<Forwarder>,
    /// Maps bearer tokens to console sessions
    pub sessions: Arc<dyn SessionResolver>,
}

/// Build the forwarder routes
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/clusters/{cluster}/k8s/{*path}", any(kube_handler))
        .route(
            "/clusters/{cluster}/namespaces/{namespace}/services/{service}/proxy",
            any(service_handler),
        )
        .route(
            "/clusters/{cluster}/namespaces/{namespace}/services/{service}/proxy/{*path}",
            any(service_handler),
        )
        .with_state(state)
}

/// Routes tagged with the scheme the listener serves
fn listener_router(config: &ServerConfig, state: AppState) -> Router {
    router(state).layer(Extension(InboundScheme::for_listener(config.tls.is_some())))
}

/// Serve the forwarder until the listener fails
pub async fn start_server(config: ServerConfig, state: AppState) -> Result<(), Error> {
    let app = listener_router(&config, state);

    match config.tls {
        Some((cert_pem, key_pem)) => {
            let tls_config =
                RustlsConfig::from_pem(cert_pem.into_bytes(), key_pem.as_bytes().to_vec())
                    .await
                    .map_err(|e| Error::Internal(format!("TLS config error: {}", e)))?;

            info!(addr = %config.addr, "Starting forwarder (TLS)");
            axum_server::bind_rustls(config.addr, tls_config)
                .serve(app.into_make_service())
                .await
        }
        None => {
            info!(addr = %config.addr, "Starting forwarder (plain HTTP)");
            axum_server::bind(config.addr)
                .serve(app.into_make_service())
                .await
        }
    }
    .map_err(|e| Error::Internal(format!("Server error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode, Uri};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use tokio::net::TcpListener;
    use tower::ServiceExt;
    use trellis_cell::{DirectSite, SiteMap};

    use crate::config::ForwarderConfig;
    use crate::issuer::{CredentialIssuer, MockCertificateSigner};
    use crate::session::{Session, StaticSession, StaticSessions};

    fn state(sites: SiteMap) -> AppState {
        let sessions = Arc::new(StaticSessions::new([StaticSession {
            token: "tok-alice".to_string(),
            session: Session::new("s1", "alice", Utc::now() + chrono::Duration::hours(1)),
            groups: vec!["devs".to_string()],
        }]));
        let issuer =
            CredentialIssuer::new(Arc::new(MockCertificateSigner::new()), sessions.clone())
                .unwrap();
        let forwarder =
            Forwarder::new(ForwarderConfig::default(), Arc::new(sites), issuer).unwrap();
        AppState {
            forwarder: Arc::new(forwarder),
            sessions,
        }
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(uri);
        if let Some(token) = token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_needs_no_session() {
        let response = router(state(SiteMap::new()))
            .oneshot(get("/healthz", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_token_is_forbidden() {
        let response = router(state(SiteMap::new()))
            .oneshot(get("/clusters/prod/k8s/api", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let status = body_json(response).await;
        assert_eq!(status["kind"], "Status");
        assert_eq!(status["code"], 403);
    }

    #[tokio::test]
    async fn unknown_token_is_forbidden() {
        let response = router(state(SiteMap::new()))
            .oneshot(get("/clusters/prod/k8s/api", Some("tok-mallory")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_cluster_is_not_found() {
        let response = router(state(SiteMap::new()))
            .oneshot(get("/clusters/prod/k8s/api/v1/pods", Some("tok-alice")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["reason"], "NotFound");
    }

    #[tokio::test]
    async fn service_route_reaches_named_port() {
        let upstream = Router::new().fallback(|uri: Uri| async move { uri.to_string() });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, upstream).await });

        let sites = SiteMap::new();
        sites.register(Arc::new(
            DirectSite::new("prod").with_endpoint("web.apps:8080", addr.to_string()),
        ));

        let response = router(state(sites))
            .oneshot(get(
                "/clusters/prod/namespaces/apps/services/web:8080/proxy/status?verbose=1",
                Some("tok-alice"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"/status?verbose=1");
    }

    #[tokio::test]
    async fn plain_listener_forwards_http_proto() {
        let upstream = Router::new().fallback(|headers: HeaderMap| async move {
            headers
                .get("x-forwarded-proto")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, upstream).await });

        let sites = SiteMap::new();
        sites.register(Arc::new(
            DirectSite::new("prod").with_endpoint("web.apps:80", addr.to_string()),
        ));
        let config = ServerConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            tls: None,
        };

        let response = listener_router(&config, state(sites))
            .oneshot(get(
                "/clusters/prod/namespaces/apps/services/web/proxy",
                Some("tok-alice"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"http");
    }

    #[tokio::test]
    async fn malformed_service_port_is_bad_request() {
        let response = router(state(SiteMap::new()))
            .oneshot(get(
                "/clusters/prod/namespaces/apps/services/web:http/proxy/x",
                Some("tok-alice"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
