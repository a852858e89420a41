//! Forwarder configuration

use std::time::Duration;

use http::uri::Authority;
use serde::{Deserialize, Serialize};
use trellis_common::DEFAULT_API_SERVER_ADDRESS;

use crate::error::{Error, Result};

/// Tuning for pipeline construction and caching
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ForwarderConfig {
    /// API server address as seen from inside a cluster (`host:port`)
    pub api_server_address: String,

    /// Common name put on every issued client certificate instead of the user
    pub common_name_override: Option<String>,

    /// Upper bound on how long a pipeline stays cached
    #[serde(with = "humantime_serde")]
    pub pipeline_ttl: Duration,

    /// Pipelines whose TTL would be at or below this are not built
    #[serde(with = "humantime_serde")]
    pub min_pipeline_ttl: Duration,

    /// Maximum number of cached pipelines
    pub cache_capacity: usize,

    /// Bound on the TLS handshake with the API server
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,

    /// Scheme reported in `X-Forwarded-Proto` when neither the inbound URI nor
    /// the listener supplies one
    pub default_scheme: String,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            api_server_address: DEFAULT_API_SERVER_ADDRESS.to_string(),
            common_name_override: None,
            pipeline_ttl: Duration::from_secs(30 * 60),
            min_pipeline_ttl: Duration::from_secs(1),
            cache_capacity: 1024,
            handshake_timeout: Duration::from_secs(10),
            default_scheme: "https".to_string(),
        }
    }
}

impl ForwarderConfig {
    /// Check the configuration for values the forwarder cannot work with
    pub fn validate(&self) -> Result<()> {
        let authority: Authority = self.api_server_address.parse().map_err(|e| {
            Error::BadParameter(format!(
                "invalid API server address '{}': {}",
                self.api_server_address, e
            ))
        })?;
        if authority.port_u16().is_none() {
            return Err(Error::BadParameter(format!(
                "API server address '{}' must include a port",
                self.api_server_address
            )));
        }

        if matches!(&self.common_name_override, Some(cn) if cn.trim().is_empty()) {
            return Err(Error::BadParameter(
                "common name override must not be empty".to_string(),
            ));
        }

        if self.pipeline_ttl <= self.min_pipeline_ttl {
            return Err(Error::BadParameter(format!(
                "pipeline TTL ({:?}) must exceed the minimum TTL ({:?})",
                self.pipeline_ttl, self.min_pipeline_ttl
            )));
        }

        if self.cache_capacity == 0 {
            return Err(Error::BadParameter(
                "cache capacity must be at least 1".to_string(),
            ));
        }

        if self.handshake_timeout.is_zero() {
            return Err(Error::BadParameter(
                "handshake timeout must be positive".to_string(),
            ));
        }

        if !matches!(self.default_scheme.as_str(), "http" | "https") {
            return Err(Error::BadParameter(format!(
                "default scheme must be http or https, got '{}'",
                self.default_scheme
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        let config = ForwarderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.api_server_address, "kubernetes.default.svc:443");
        assert_eq!(config.pipeline_ttl, Duration::from_secs(1800));
        assert_eq!(config.min_pipeline_ttl, Duration::from_secs(1));
    }

    #[rstest]
    #[case::no_port(ForwarderConfig { api_server_address: "kubernetes.default.svc".into(), ..Default::default() })]
    #[case::garbage_address(ForwarderConfig { api_server_address: "not a host:x".into(), ..Default::default() })]
    #[case::blank_override(ForwarderConfig { common_name_override: Some(" ".into()), ..Default::default() })]
    #[case::ttl_below_floor(ForwarderConfig { pipeline_ttl: Duration::from_millis(500), ..Default::default() })]
    #[case::zero_capacity(ForwarderConfig { cache_capacity: 0, ..Default::default() })]
    #[case::zero_handshake(ForwarderConfig { handshake_timeout: Duration::ZERO, ..Default::default() })]
    #[case::odd_scheme(ForwarderConfig { default_scheme: "ftp".into(), ..Default::default() })]
    fn invalid_configs_are_rejected(#[case] config: ForwarderConfig) {
        assert!(matches!(config.validate(), Err(Error::BadParameter(_))));
    }

    #[test]
    fn deserializes_humantime_durations() {
        let config: ForwarderConfig = serde_json::from_str(
            r#"{"pipelineTtl": "5m", "handshakeTimeout": "2s", "commonNameOverride": "console"}"#,
        )
        .unwrap();
        assert_eq!(config.pipeline_ttl, Duration::from_secs(300));
        assert_eq!(config.handshake_timeout, Duration::from_secs(2));
        assert_eq!(config.common_name_override.as_deref(), Some("console"));
        assert_eq!(config.cache_capacity, 1024);
    }
}
