//! Trellis Forwarder
//!
//! Forwards console requests into remote Kubernetes clusters reached through
//! reverse tunnels. Requests to a cluster's API server travel over a
//! per-session mTLS pipeline whose client certificate names the session user;
//! requests to in-cluster services travel over plain HTTP.
//!
//! # Architecture
//!
//! ```text
//! console ──► Forwarder ──► SessionCache ──► Pipeline ──► tunnel ──► API server
//!                │              (miss)
//!                │                └──► CredentialIssuer ──► signing service
//!                └──► plain dial ──► tunnel ──► service
//! ```
//!
//! # Endpoints
//!
//! - `* /clusters/{cluster}/k8s/{*path}` - Forward to the cluster's API server
//! - `* /clusters/{cluster}/namespaces/{ns}/services/{svc[:port]}/proxy/{*path}` -
//!   Forward to an in-cluster service
//! - `GET /healthz` - Health check

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod headers;
pub mod issuer;
pub mod pipeline;
pub mod proxy;
pub mod server;
pub mod session;
mod upgrade;

pub use cache::SessionCache;
pub use config::ForwarderConfig;
pub use error::{Error, Result};
pub use forwarder::{ForwardRequest, Forwarder};
pub use issuer::{
    CertificateSigner, CredentialIssuer, IssuedCredentials, LocalSigner, SignedCertificate,
};
pub use pipeline::Pipeline;
pub use server::{router, start_server, AppState, ServerConfig};
pub use session::{
    Session, SessionKey, SessionResolver, StaticSession, StaticSessions, UserInfo,
    UserInfoProvider,
};
