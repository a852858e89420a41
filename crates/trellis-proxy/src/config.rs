//! Server configuration file
//!
//! ```yaml
//! listen: 0.0.0.0:8443
//! tls:
//!   certFile: /etc/trellis/tls.crt
//!   keyFile: /etc/trellis/tls.key
//! forwarder:
//!   pipelineTtl: 30m
//! sessions:
//!   - token: dev-token
//!     id: s1
//!     user: alice
//!     expiresAt: 2030-01-01T00:00:00Z
//!     groups: [devs]
//! clusters:
//!   - name: prod
//!     caCertFile: /etc/trellis/prod/ca.crt
//!     caKeyFile: /etc/trellis/prod/ca.key
//!     endpoints:
//!       kubernetes.default.svc:443: 10.0.0.10:6443
//! ```

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;
use trellis_api::{ForwarderConfig, StaticSession};
use trellis_cell::DirectSite;
use trellis_infra::{CertificateAuthority, PkiError};
use zeroize::Zeroizing;

/// Errors from loading the configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A referenced file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Values are inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// CA material could not be loaded
    #[error("CA for cluster {cluster}: {source}")]
    Authority {
        /// Cluster the CA belongs to
        cluster: String,
        /// Underlying error
        source: PkiError,
    },
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8443))
}

fn default_purge_interval() -> Duration {
    Duration::from_secs(60)
}

/// Server certificate and key files
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsFiles {
    /// Certificate chain (PEM)
    pub cert_file: PathBuf,
    /// Private key (PEM)
    pub key_file: PathBuf,
}

impl TlsFiles {
    /// Read certificate and key
    pub fn load(&self) -> Result<(String, Zeroizing<String>), ConfigError> {
        Ok((read(&self.cert_file)?, Zeroizing::new(read(&self.key_file)?)))
    }
}

/// A cluster reachable over direct TCP
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Cluster name used in routes
    pub name: String,
    /// CA certificate that signs client certificates and the API server's
    pub ca_cert_file: Option<PathBuf>,
    /// CA private key
    pub ca_key_file: Option<PathBuf>,
    /// In-cluster address to reachable address overrides
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
}

impl ClusterConfig {
    /// Load the cluster CA, or generate a throwaway one when none is configured
    pub fn authority(&self) -> Result<CertificateAuthority, ConfigError> {
        let pki_error = |source: PkiError| ConfigError::Authority {
            cluster: self.name.clone(),
            source,
        };

        match (&self.ca_cert_file, &self.ca_key_file) {
            (Some(cert), Some(key)) => {
                CertificateAuthority::from_pem(&read(cert)?, &read(key)?).map_err(pki_error)
            }
            (None, None) => {
                warn!(
                    cluster = %self.name,
                    "No CA configured, generating an ephemeral one"
                );
                CertificateAuthority::new(&format!("{} CA", self.name)).map_err(pki_error)
            }
            _ => Err(ConfigError::Invalid(format!(
                "cluster {}: caCertFile and caKeyFile must be set together",
                self.name
            ))),
        }
    }

    /// Site dialing this cluster's endpoints directly
    pub fn site(&self) -> DirectSite {
        self.endpoints
            .iter()
            .fold(DirectSite::new(&self.name), |site, (destination, endpoint)| {
                site.with_endpoint(destination, endpoint)
            })
    }
}

/// Top-level configuration file
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Address to listen on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Serve TLS with these files; plain HTTP when absent
    pub tls: Option<TlsFiles>,
    /// How often expired pipelines are dropped from the cache
    #[serde(default = "default_purge_interval", with = "humantime_serde")]
    pub purge_interval: Duration,
    /// Forwarder tuning
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    /// Sessions accepted by bearer token
    #[serde(default)]
    pub sessions: Vec<StaticSession>,
    /// Reachable clusters
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

impl ProxyConfig {
    /// Read and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(&read(path)?)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.forwarder
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.purge_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "purgeInterval must be positive".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(ConfigError::Invalid("cluster name is empty".to_string()));
            }
            if !names.insert(cluster.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "cluster {} is listed twice",
                    cluster.name
                )));
            }
        }

        let mut tokens = HashSet::new();
        for session in &self.sessions {
            if session.token.is_empty() || !tokens.insert(session.token.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "session {} needs a unique, non-empty token",
                    session.session.id
                )));
            }
        }

        Ok(())
    }
}
