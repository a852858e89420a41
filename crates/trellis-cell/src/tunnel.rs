//! Tunnel-aware dialing
//!
//! A [`Dialer`] opens byte streams to addresses inside one cluster. The
//! forwarder only sees this capability; [`TunnelDialer`] implements it on top
//! of the site registry. Failures are reported once and never retried here.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::connection::{BoxedStream, SiteRegistry};

/// Source hint sent with dials that originate from the forwarder
pub const DEFAULT_SOURCE_HINT: &str = "127.0.0.1:0";

/// Errors from tunnel lookup and dialing
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No connected tunnel for the cluster
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// The far end refused or failed to open the stream
    #[error("failed to dial {destination}: {message}")]
    DialFailed {
        /// Address that was dialed
        destination: String,
        /// Reason reported by the site
        message: String,
    },
}

/// Something that can open a byte stream to a destination
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a stream to `destination`
    async fn dial(&self, destination: &str) -> Result<BoxedStream, TunnelError>;
}

/// Dialer bound to one cluster's reverse tunnel
///
/// The site is looked up again on every dial so a reconnected tunnel is
/// picked up by pipelines built before the reconnect.
#[derive(Clone)]
pub struct TunnelDialer {
    registry: Arc<dyn SiteRegistry>,
    cluster_name: String,
    source: String,
}

impl std::fmt::Debug for TunnelDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelDialer")
            .field("cluster_name", &self.cluster_name)
            .field("source", &self.source)
            .finish()
    }
}

impl TunnelDialer {
    /// Bind a dialer to `cluster_name`, failing if its tunnel is not connected
    pub fn for_cluster(
        registry: Arc<dyn SiteRegistry>,
        cluster_name: &str,
    ) -> Result<Self, TunnelError> {
        if registry.get_site(cluster_name).is_none() {
            return Err(TunnelError::ClusterNotFound(cluster_name.to_string()));
        }
        Ok(Self {
            registry,
            cluster_name: cluster_name.to_string(),
            source: DEFAULT_SOURCE_HINT.to_string(),
        })
    }

    /// Use a different source address hint
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Cluster this dialer routes into
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn dial(&self, destination: &str) -> Result<BoxedStream, TunnelError> {
        let site = self
            .registry
            .get_site(&self.cluster_name)
            .ok_or_else(|| TunnelError::ClusterNotFound(self.cluster_name.clone()))?;

        debug!(cluster = %self.cluster_name, %destination, "Dialing through tunnel");
        site.dial(&self.source, destination).await.inspect_err(|e| {
            warn!(cluster = %self.cluster_name, %destination, error = %e, "Tunnel dial failed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{MockSiteRegistry, RemoteSite, SiteMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Site that answers every dial with an in-memory pipe echoing one message
    struct EchoSite {
        name: String,
        dials: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl RemoteSite for EchoSite {
        fn cluster_name(&self) -> &str {
            &self.name
        }

        async fn dial(&self, source: &str, destination: &str) -> Result<BoxedStream, TunnelError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(TunnelError::DialFailed {
                    destination: destination.to_string(),
                    message: "connection refused".to_string(),
                });
            }
            let (client, mut server) = tokio::io::duplex(1024);
            let greeting = format!("{} -> {}", source, destination);
            tokio::spawn(async move {
                let _ = server.write_all(greeting.as_bytes()).await;
            });
            Ok(Box::new(client))
        }
    }

    fn echo_site(name: &str, fail: bool) -> Arc<EchoSite> {
        Arc::new(EchoSite {
            name: name.to_string(),
            dials: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn unknown_cluster_is_rejected_up_front() {
        let mut registry = MockSiteRegistry::new();
        registry.expect_get_site().times(1).returning(|_| None);

        let result = TunnelDialer::for_cluster(Arc::new(registry), "missing");
        assert!(matches!(result, Err(TunnelError::ClusterNotFound(name)) if name == "missing"));
    }

    #[tokio::test]
    async fn dial_routes_to_the_bound_site() {
        let sites = Arc::new(SiteMap::new());
        let alpha = echo_site("alpha", false);
        sites.register(alpha.clone());
        sites.register(echo_site("beta", false));

        let dialer = TunnelDialer::for_cluster(sites, "alpha")
            .unwrap()
            .with_source("10.0.0.1:1234");
        let mut stream = dialer.dial("svc.ns:80").await.expect("dial should succeed");

        let mut received = String::new();
        stream.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "10.0.0.1:1234 -> svc.ns:80");
        assert_eq!(alpha.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dial_failure_is_not_retried() {
        let sites = Arc::new(SiteMap::new());
        let broken = echo_site("broken", true);
        sites.register(broken.clone());

        let dialer = TunnelDialer::for_cluster(sites, "broken").unwrap();
        let result = dialer.dial("svc.ns:80").await;

        assert!(matches!(result, Err(TunnelError::DialFailed { .. })));
        assert_eq!(broken.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnected_tunnel_surfaces_not_found() {
        let sites = Arc::new(SiteMap::new());
        sites.register(echo_site("alpha", false));

        let dialer = TunnelDialer::for_cluster(sites.clone(), "alpha").unwrap();
        sites.unregister("alpha");

        assert!(matches!(
            dialer.dial("svc.ns:80").await,
            Err(TunnelError::ClusterNotFound(_))
        ));
    }
}
