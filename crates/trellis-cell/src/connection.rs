//! Remote site tracking
//!
//! Manages the registry of clusters reachable through a reverse tunnel.
//!
//! # Traits
//!
//! - `RemoteSite`: a handle that opens byte streams inside one cluster
//! - `SiteRegistry`: lookup of remote sites by cluster name

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::info;

use crate::tunnel::TunnelError;

/// Byte stream opened through a tunnel
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Owned, type-erased tunnel stream
pub type BoxedStream = Box<dyn TunnelStream>;

/// Handle to one remote cluster
#[async_trait]
pub trait RemoteSite: Send + Sync {
    /// Cluster this site routes into
    fn cluster_name(&self) -> &str;

    /// Open a stream to `destination` as routed inside the cluster
    ///
    /// `source` is an address hint reported to the far end.
    async fn dial(&self, source: &str, destination: &str) -> Result<BoxedStream, TunnelError>;
}

/// Lookup of connected remote clusters
#[cfg_attr(test, mockall::automock)]
pub trait SiteRegistry: Send + Sync {
    /// Get the site for a cluster, if its tunnel is connected
    fn get_site(&self, cluster_name: &str) -> Option<Arc<dyn RemoteSite>>;
}

/// Thread-safe site registry using DashMap for concurrent access
#[derive(Default)]
pub struct SiteMap {
    sites: DashMap<String, Arc<dyn RemoteSite>>,
}

impl SiteMap {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a site (new or replacing a reconnected tunnel)
    pub fn register(&self, site: Arc<dyn RemoteSite>) {
        let cluster_name = site.cluster_name().to_string();
        if self.sites.insert(cluster_name.clone(), site).is_some() {
            info!(cluster = %cluster_name, "Remote site reconnected");
        } else {
            info!(cluster = %cluster_name, "Remote site connected");
        }
    }

    /// Remove a site when its tunnel goes away
    pub fn unregister(&self, cluster_name: &str) {
        if self.sites.remove(cluster_name).is_some() {
            info!(cluster = %cluster_name, "Remote site disconnected");
        }
    }

    /// Number of registered sites
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Check if no site is registered
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Names of all registered clusters, sorted
    pub fn list_clusters(&self) -> Vec<String> {
        let mut clusters: Vec<String> = self.sites.iter().map(|r| r.key().clone()).collect();
        clusters.sort();
        clusters
    }
}

impl SiteRegistry for SiteMap {
    fn get_site(&self, cluster_name: &str) -> Option<Arc<dyn RemoteSite>> {
        self.sites.get(cluster_name).map(|r| Arc::clone(r.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedSite(&'static str);

    #[async_trait]
    impl RemoteSite for NamedSite {
        fn cluster_name(&self) -> &str {
            self.0
        }

        async fn dial(&self, _source: &str, destination: &str) -> Result<BoxedStream, TunnelError> {
            Err(TunnelError::DialFailed {
                destination: destination.to_string(),
                message: "test site".to_string(),
            })
        }
    }

    fn named_site(name: &'static str) -> Arc<dyn RemoteSite> {
        Arc::new(NamedSite(name))
    }

    #[test]
    fn register_and_lookup() {
        let registry = SiteMap::new();
        assert!(registry.is_empty());

        registry.register(named_site("alpha"));
        registry.register(named_site("beta"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.list_clusters(), vec!["alpha", "beta"]);
        assert_eq!(
            registry.get_site("alpha").map(|s| s.cluster_name().to_string()),
            Some("alpha".to_string())
        );
        assert!(registry.get_site("gamma").is_none());
    }

    #[test]
    fn reconnect_replaces_site() {
        let registry = SiteMap::new();
        registry.register(named_site("alpha"));
        registry.register(named_site("alpha"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_removes_site() {
        let registry = SiteMap::new();
        registry.register(named_site("alpha"));
        registry.unregister("alpha");
        registry.unregister("never-registered");

        assert!(registry.get_site("alpha").is_none());
        assert!(registry.is_empty());
    }
}
