//! Session-scoped request forwarding
//!
//! Two entry points share one rewrite and one send path:
//!
//! - [`Forwarder::forward_to_kube`] goes to the cluster API server over a
//!   cached per-session mTLS pipeline
//! - [`Forwarder::forward_to_service`] goes to an in-cluster service over a
//!   plain HTTP connection, without client certificates
//!
//! Every request is independent: nothing is retried, and downstream error
//! responses are passed through untouched.

use std::sync::Arc;

use axum::body::Body;
use http::uri::{PathAndQuery, Uri};
use http::{Request, Response};
use tracing::{debug, instrument};
use trellis_cell::{Dialer, SiteRegistry, TunnelDialer};
use trellis_common::metrics::{record_pipeline_build, ForwardStatus, ForwardTarget, ForwardTimer};
use trellis_common::{DEFAULT_SERVICE_NAMESPACE, DEFAULT_SERVICE_PORT};

use crate::cache::SessionCache;
use crate::config::ForwarderConfig;
use crate::error::{Error, Result};
use crate::headers::{self, OriginalRequest};
use crate::issuer::CredentialIssuer;
use crate::pipeline::Pipeline;
use crate::session::{Session, SessionKey};

/// Target of a service-level forward
///
/// An empty namespace means `kube-system`, a zero port means 80.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ForwardRequest {
    /// Cluster to forward into
    pub cluster: String,
    /// Service name
    pub service: String,
    /// Service namespace
    pub namespace: String,
    /// Service port
    pub port: u16,
    /// Path requested on the service
    pub path: String,
}

impl ForwardRequest {
    /// Forward to `service` in `cluster` with default namespace, port and path
    pub fn new(cluster: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            service: service.into(),
            ..Default::default()
        }
    }

    /// Set the service namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the service port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the request path
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Namespace after defaults are applied
    pub fn namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_SERVICE_NAMESPACE
        } else {
            &self.namespace
        }
    }

    /// Port after defaults are applied
    pub fn port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_SERVICE_PORT
        } else {
            self.port
        }
    }

    /// Address dialed inside the cluster: `service.namespace:port`
    pub fn destination(&self) -> String {
        format!("{}.{}:{}", self.service, self.namespace(), self.port())
    }

    fn validate(&self) -> Result<()> {
        if self.cluster.is_empty() {
            return Err(Error::BadParameter("cluster name is required".to_string()));
        }
        if self.service.is_empty() {
            return Err(Error::BadParameter("service name is required".to_string()));
        }
        Ok(())
    }
}

/// Forwards console requests into remote clusters
pub struct Forwarder {
    config: ForwarderConfig,
    sites: Arc<dyn SiteRegistry>,
    issuer: CredentialIssuer,
    cache: SessionCache<Arc<Pipeline>>,
}

impl Forwarder {
    /// Create a forwarder with its own pipeline cache
    pub fn new(
        config: ForwarderConfig,
        sites: Arc<dyn SiteRegistry>,
        issuer: CredentialIssuer,
    ) -> Result<Self> {
        config.validate()?;
        let issuer = issuer.with_common_name_override(config.common_name_override.clone());
        let cache = SessionCache::new(
            config.pipeline_ttl,
            config.min_pipeline_ttl,
            config.cache_capacity,
        );
        Ok(Self {
            config,
            sites,
            issuer,
            cache,
        })
    }

    /// Per-session pipeline cache
    pub fn cache(&self) -> &SessionCache<Arc<Pipeline>> {
        &self.cache
    }

    /// Forward `request` to the API server of `cluster` at `api_path`
    ///
    /// Builds the session's mTLS pipeline on first use; later requests in the
    /// same session reuse it until its TTL runs out.
    #[instrument(
        skip(self, session, request),
        fields(user = %session.user, method = %request.method())
    )]
    pub async fn forward_to_kube(
        &self,
        session: &Session,
        request: Request<Body>,
        cluster: &str,
        api_path: &str,
    ) -> Result<Response<Body>> {
        let timer = ForwardTimer::start(cluster, ForwardTarget::Kube);
        let result: Result<Response<Body>> = async {
            let pipeline = self.kube_pipeline(session, cluster).await?;
            let request = self.rewrite(request, api_path)?;
            pipeline.send(request).await
        }
        .await;
        complete(timer, &result);
        result
    }

    /// Forward `request` to an in-cluster service over plain HTTP
    #[instrument(
        skip(self, session, request),
        fields(user = %session.user, method = %request.method())
    )]
    pub async fn forward_to_service(
        &self,
        session: &Session,
        request: Request<Body>,
        target: ForwardRequest,
    ) -> Result<Response<Body>> {
        let timer = ForwardTimer::start(target.cluster.clone(), ForwardTarget::Service);
        let result: Result<Response<Body>> = async {
            target.validate()?;
            let dialer = TunnelDialer::for_cluster(self.sites.clone(), &target.cluster)?;
            let pipeline =
                Pipeline::plain(&target.cluster, &target.destination(), Arc::new(dialer))?;
            let request = self.rewrite(request, &target.path)?;
            pipeline.send(request).await
        }
        .await;
        complete(timer, &result);
        result
    }

    async fn kube_pipeline(&self, session: &Session, cluster: &str) -> Result<Arc<Pipeline>> {
        // Unknown clusters are rejected before the cache or the signer are touched
        let dialer: Arc<dyn Dialer> =
            Arc::new(TunnelDialer::for_cluster(self.sites.clone(), cluster)?);
        let key = SessionKey::new(session, cluster);

        self.cache
            .get_or_create(&key, session.expires_at, || async move {
                let result = self.build_kube_pipeline(session, cluster, dialer).await;
                record_pipeline_build(cluster, result.is_ok());
                result
            })
            .await
    }

    async fn build_kube_pipeline(
        &self,
        session: &Session,
        cluster: &str,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Arc<Pipeline>> {
        let credentials = self.issuer.issue(session, cluster).await?;
        let tls = credentials.client_config()?;
        let pipeline = Pipeline::tls(
            cluster,
            &self.config.api_server_address,
            dialer,
            tls,
            self.config.handshake_timeout,
        )?;
        debug!(cluster = %cluster, target = %pipeline.target(), "Built API server pipeline");
        Ok(Arc::new(pipeline))
    }

    /// Rewrite an inbound request for the downstream
    ///
    /// `X-Forwarded-*` carry the values the caller used. Extensions are kept so
    /// a pending upgrade can still be claimed when the request is sent.
    fn rewrite(&self, request: Request<Body>, path: &str) -> Result<Request<Body>> {
        let original = OriginalRequest::capture(&request, &self.config.default_scheme);
        let (mut parts, body) = request.into_parts();

        let keep_upgrade = headers::is_upgrade_request(&parts.headers);
        headers::strip_credential_headers(&mut parts.headers);
        headers::strip_hop_by_hop(&mut parts.headers, keep_upgrade);
        original.apply(&mut parts.headers)?;

        parts.uri = downstream_uri(path, parts.uri.query())?;
        Ok(Request::from_parts(parts, body))
    }
}

fn downstream_uri(path: &str, query: Option<&str>) -> Result<Uri> {
    let path = path.trim_start_matches('/');
    let path_and_query = match query {
        Some(query) => format!("/{}?{}", path, query),
        None => format!("/{}", path),
    };
    let path_and_query = PathAndQuery::try_from(path_and_query.as_str())
        .map_err(|e| Error::BadParameter(format!("invalid path '{}': {}", path, e)))?;
    Ok(Uri::from(path_and_query))
}

fn complete(timer: ForwardTimer, result: &Result<Response<Body>>) {
    let status = match result {
        Ok(response) => ForwardStatus::from_status_code(response.status().as_u16()),
        Err(_) => ForwardStatus::Failed,
    };
    timer.complete(status);
}
