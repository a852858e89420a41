//! Common types for Trellis: well-known addresses, telemetry and metrics

#![deny(missing_docs)]

pub mod metrics;
pub mod telemetry;

/// Namespace used for service forwarding when the caller does not name one
pub const DEFAULT_SERVICE_NAMESPACE: &str = "kube-system";

/// Port used for service forwarding when the caller does not name one
pub const DEFAULT_SERVICE_PORT: u16 = 80;

/// Address of the Kubernetes API server as seen from inside a cluster
pub const DEFAULT_API_SERVER_ADDRESS: &str = "kubernetes.default.svc:443";

/// Header carrying the scheme of the request as received by the console
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Header carrying the host of the request as received by the console
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Header carrying the path of the request as received by the console
pub const X_FORWARDED_PATH: &str = "x-forwarded-path";
