//! Forwarding pipelines
//!
//! A pipeline bundles everything needed to reach one target inside one
//! cluster: the dial function, and for the API server the session's mTLS
//! client configuration. It is immutable once built and shared by every
//! request of its session.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::header::{HeaderValue, HOST};
use http::uri::{Authority, Uri};
use http::{Request, Response, StatusCode, Version};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument};
use trellis_cell::{BoxedStream, Dialer};

use crate::error::{Error, Result};
use crate::headers;
use crate::upgrade;

struct TlsTarget {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    handshake_timeout: Duration,
}

/// Transport to one address inside one cluster
pub struct Pipeline {
    cluster: String,
    target: Authority,
    dialer: Arc<dyn Dialer>,
    tls: Option<TlsTarget>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("cluster", &self.cluster)
            .field("target", &self.target)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

fn parse_target(target: &str) -> Result<Authority> {
    let authority: Authority = target
        .parse()
        .map_err(|e| Error::BadParameter(format!("invalid target '{}': {}", target, e)))?;
    if authority.port_u16().is_none() {
        return Err(Error::BadParameter(format!(
            "target '{}' must include a port",
            target
        )));
    }
    Ok(authority)
}

impl Pipeline {
    /// Plain HTTP pipeline, used for in-cluster services
    pub fn plain(cluster: &str, target: &str, dialer: Arc<dyn Dialer>) -> Result<Self> {
        Ok(Self {
            cluster: cluster.to_string(),
            target: parse_target(target)?,
            dialer,
            tls: None,
        })
    }

    /// mTLS pipeline, used for the API server
    ///
    /// The server certificate is verified against the target's host name.
    pub fn tls(
        cluster: &str,
        target: &str,
        dialer: Arc<dyn Dialer>,
        config: Arc<rustls::ClientConfig>,
        handshake_timeout: Duration,
    ) -> Result<Self> {
        let target = parse_target(target)?;
        let server_name = ServerName::try_from(target.host().to_string()).map_err(|e| {
            Error::BadParameter(format!("invalid server name '{}': {}", target.host(), e))
        })?;

        Ok(Self {
            cluster: cluster.to_string(),
            target,
            dialer,
            tls: Some(TlsTarget {
                connector: TlsConnector::from(config),
                server_name,
                handshake_timeout,
            }),
        })
    }

    /// Cluster this pipeline routes into
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Address dialed for every request
    pub fn target(&self) -> &str {
        self.target.as_str()
    }

    fn host_header(&self) -> Result<HeaderValue> {
        let default_port = if self.tls.is_some() { 443 } else { 80 };
        let value = if self.target.port_u16() == Some(default_port) {
            self.target.host()
        } else {
            self.target.as_str()
        };
        HeaderValue::from_str(value)
            .map_err(|e| Error::Internal(format!("invalid host header '{}': {}", value, e)))
    }

    async fn connect(&self) -> Result<SendRequest<Body>> {
        let stream = self.dialer.dial(self.target.as_str()).await?;

        let io: BoxedStream = match &self.tls {
            None => stream,
            Some(tls) => {
                let handshake = tls.connector.connect(tls.server_name.clone(), stream);
                // Dropping the handshake future on timeout closes the stream
                let tls_stream = tokio::time::timeout(tls.handshake_timeout, handshake)
                    .await
                    .map_err(|_| {
                        Error::UpstreamUnavailable(format!(
                            "handshake timeout with {} on cluster {}",
                            self.target, self.cluster
                        ))
                    })?
                    .map_err(|e| {
                        Error::UpstreamUnavailable(format!(
                            "TLS handshake with {} on cluster {} failed: {}",
                            self.target, self.cluster, e
                        ))
                    })?;
                Box::new(tls_stream)
            }
        };

        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
            .await
            .map_err(|e| {
                Error::UpstreamUnavailable(format!(
                    "HTTP handshake with {} on cluster {} failed: {}",
                    self.target, self.cluster, e
                ))
            })?;

        let cluster = self.cluster.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(cluster = %cluster, error = %e, "Downstream connection closed with error");
            }
        });

        Ok(sender)
    }

    /// Send a rewritten request and return the downstream response
    ///
    /// Upgrade requests whose downstream answers 101 are relayed as raw
    /// streams; any other response, including a refused upgrade, is returned
    /// as-is.
    #[instrument(skip_all, fields(cluster = %self.cluster, target = %self.target))]
    pub async fn send(&self, mut request: Request<Body>) -> Result<Response<Body>> {
        let client_upgrade = headers::is_upgrade_request(request.headers())
            .then(|| hyper::upgrade::on(&mut request));

        let (parts, body) = request.into_parts();
        let uri = parts
            .uri
            .path_and_query()
            .cloned()
            .map(Uri::from)
            .unwrap_or_else(|| Uri::from_static("/"));

        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(body)
            .map_err(|e| Error::Internal(format!("failed to build request: {}", e)))?;
        *outbound.headers_mut() = parts.headers;
        outbound.headers_mut().insert(HOST, self.host_header()?);

        let mut sender = self.connect().await?;
        let response = sender.send_request(outbound).await.map_err(|e| {
            Error::UpstreamUnavailable(format!(
                "request to {} on cluster {} failed: {}",
                self.target, self.cluster, e
            ))
        })?;

        debug!(status = %response.status(), "Downstream responded");

        match client_upgrade {
            Some(client) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                Ok(upgrade::bridge(client, response, &self.cluster))
            }
            _ => Ok(headers::downstream_response(response)),
        }
    }
}
