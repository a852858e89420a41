//! Directly reachable sites
//!
//! A [`DirectSite`] stands in for a reverse tunnel when the cluster's
//! endpoints are reachable over plain TCP, e.g. a local kind cluster. The
//! in-cluster destination is mapped to a reachable endpoint through an
//! override table; unmapped destinations are dialed as given.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::connection::{BoxedStream, RemoteSite};
use crate::tunnel::TunnelError;

/// Remote site dialed over ordinary TCP
#[derive(Debug, Clone)]
pub struct DirectSite {
    cluster_name: String,
    endpoints: HashMap<String, String>,
}

impl DirectSite {
    /// Create a site with no endpoint overrides
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            endpoints: HashMap::new(),
        }
    }

    /// Route `destination` to `endpoint` instead of dialing it as given
    pub fn with_endpoint(
        mut self,
        destination: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        self.endpoints.insert(destination.into(), endpoint.into());
        self
    }

    fn resolve<'a>(&'a self, destination: &'a str) -> &'a str {
        self.endpoints
            .get(destination)
            .map(String::as_str)
            .unwrap_or(destination)
    }
}

#[async_trait]
impl RemoteSite for DirectSite {
    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    async fn dial(&self, _source: &str, destination: &str) -> Result<BoxedStream, TunnelError> {
        let endpoint = self.resolve(destination);
        debug!(cluster = %self.cluster_name, %destination, %endpoint, "Dialing direct endpoint");

        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|e| TunnelError::DialFailed {
                destination: destination.to_string(),
                message: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(|e| TunnelError::DialFailed {
            destination: destination.to_string(),
            message: e.to_string(),
        })?;
        Ok(Box::new(stream))
    }
}
