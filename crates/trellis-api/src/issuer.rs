//! Per-session client certificate issuance
//!
//! The issuer holds one process-wide key. For every pipeline it builds a CSR
//! for the session user (common name = identity, one OU per group), has the
//! cluster's signing service sign it, and returns the certificate together
//! with the cluster CA. Nothing is persisted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use trellis_infra::pki::{CertificateAuthority, CertificateInfo, ClientKey};
use trellis_infra::ClientMtlsConfig;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::session::{Session, UserInfoProvider};

/// Lifetime of certificates issued by [`LocalSigner`]
pub const LOCAL_CERT_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Certificate returned by a signing service
#[derive(Clone, Debug)]
pub struct SignedCertificate {
    /// Signed client certificate (PEM)
    pub cert_pem: String,
    /// CA bundle of the cluster (PEM)
    pub ca_cert_pem: String,
}

/// Cluster certificate signing service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateSigner: Send + Sync {
    /// Sign `csr_pem` for `account` on `cluster`
    async fn sign_tls_key(
        &self,
        account: &str,
        cluster: &str,
        csr_pem: &str,
    ) -> Result<SignedCertificate>;
}

/// Signs CSRs with per-cluster CAs held in memory
#[derive(Debug, Default)]
pub struct LocalSigner {
    authorities: HashMap<String, CertificateAuthority>,
    validity: Option<Duration>,
}

impl LocalSigner {
    /// Create a signer without any cluster CA
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign for `cluster` with `ca`
    pub fn with_cluster(mut self, cluster: impl Into<String>, ca: CertificateAuthority) -> Self {
        self.authorities.insert(cluster.into(), ca);
        self
    }

    /// Override the lifetime of issued certificates
    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.validity = Some(validity);
        self
    }
}

#[async_trait]
impl CertificateSigner for LocalSigner {
    async fn sign_tls_key(
        &self,
        account: &str,
        cluster: &str,
        csr_pem: &str,
    ) -> Result<SignedCertificate> {
        let ca = self
            .authorities
            .get(cluster)
            .ok_or_else(|| Error::ClusterNotFound(cluster.to_string()))?;

        let cert_pem = ca
            .sign_client_csr(csr_pem, self.validity.unwrap_or(LOCAL_CERT_VALIDITY))
            .map_err(|e| Error::BadParameter(format!("cannot sign CSR for {}: {}", account, e)))?;

        Ok(SignedCertificate {
            cert_pem,
            ca_cert_pem: ca.ca_cert_pem().to_string(),
        })
    }
}

/// Client credentials for one session on one cluster
pub struct IssuedCredentials {
    /// Client certificate (PEM)
    pub cert_pem: String,
    /// Private key of the process-wide client key (PEM)
    pub key_pem: Zeroizing<String>,
    /// CA bundle trusted for the cluster (PEM)
    pub ca_cert_pem: String,
}

impl std::fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredentials").finish_non_exhaustive()
    }
}

impl IssuedCredentials {
    /// rustls client configuration presenting these credentials
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        let config = ClientMtlsConfig::new(
            self.cert_pem.clone(),
            self.key_pem.clone(),
            self.ca_cert_pem.clone(),
        );
        Ok(config.to_rustls_config()?)
    }
}

/// Issues identity-bound client certificates
#[derive(Clone)]
pub struct CredentialIssuer {
    key: Arc<ClientKey>,
    signer: Arc<dyn CertificateSigner>,
    users: Arc<dyn UserInfoProvider>,
    common_name_override: Option<String>,
}

impl CredentialIssuer {
    /// Create an issuer with a freshly generated process-wide key
    pub fn new(
        signer: Arc<dyn CertificateSigner>,
        users: Arc<dyn UserInfoProvider>,
    ) -> Result<Self> {
        Ok(Self::with_key(Arc::new(ClientKey::generate()?), signer, users))
    }

    /// Create an issuer around an existing key
    pub fn with_key(
        key: Arc<ClientKey>,
        signer: Arc<dyn CertificateSigner>,
        users: Arc<dyn UserInfoProvider>,
    ) -> Self {
        Self {
            key,
            signer,
            users,
            common_name_override: None,
        }
    }

    /// Put `common_name` on every certificate instead of the user identity
    pub fn with_common_name_override(mut self, common_name: Option<String>) -> Self {
        self.common_name_override = common_name;
        self
    }

    /// Issue credentials for the owner of `session` on `cluster`
    pub async fn issue(&self, session: &Session, cluster: &str) -> Result<IssuedCredentials> {
        let user = self
            .users
            .current_user_info(session)
            .await
            .map_err(|e| Error::Unauthorized(format!("user lookup failed: {}", e)))?
            .ok_or_else(|| Error::NotFound(format!("no user info for {}", session.user)))?;

        let common_name = self
            .common_name_override
            .as_deref()
            .unwrap_or(&user.identity);
        let csr_pem = self.key.certificate_request(common_name, &user.groups)?;

        debug!(
            cluster = %cluster,
            user = %user.identity,
            groups = ?user.groups,
            "Requesting client certificate"
        );

        let signed = self
            .signer
            .sign_tls_key(&user.identity, cluster, &csr_pem)
            .await
            .map_err(|e| match e {
                Error::ClusterNotFound(_) | Error::BadParameter(_) => e,
                other => Error::UpstreamUnavailable(format!(
                    "signing failed for cluster {}: {}",
                    cluster, other
                )),
            })?;

        trellis_infra::mtls::root_store(&signed.ca_cert_pem).map_err(|e| {
            Error::BadParameter(format!("CA bundle for cluster {}: {}", cluster, e))
        })?;

        match CertificateInfo::from_pem(&signed.cert_pem) {
            Ok(info) => info!(
                cluster = %cluster,
                common_name = %info.common_name,
                organizational_units = ?info.organizational_units,
                expires_in_secs = info.remaining_secs(),
                "Issued client certificate"
            ),
            Err(e) => warn!(cluster = %cluster, error = %e, "Issued certificate is not parseable"),
        }

        Ok(IssuedCredentials {
            cert_pem: signed.cert_pem,
            key_pem: self.key.private_key_pem(),
            ca_cert_pem: signed.ca_cert_pem,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockUserInfoProvider, UserInfo};
    use chrono::Utc;
    use trellis_infra::CsrSubject;

    fn session() -> Session {
        Session::new("s1", "alice", Utc::now() + chrono::Duration::hours(1))
    }

    fn users_returning(info: Option<UserInfo>) -> Arc<dyn UserInfoProvider> {
        let mut users = MockUserInfoProvider::new();
        users
            .expect_current_user_info()
            .returning(move |_| Ok(info.clone()));
        Arc::new(users)
    }

    fn alice() -> Option<UserInfo> {
        Some(UserInfo {
            identity: "alice".to_string(),
            groups: vec!["admins".to_string(), "devs".to_string()],
        })
    }

    #[tokio::test]
    async fn csr_carries_identity_and_every_group() {
        let ca = CertificateAuthority::new("Cluster CA").unwrap();
        let ca_pem = ca.ca_cert_pem().to_string();

        let mut signer = MockCertificateSigner::new();
        signer
            .expect_sign_tls_key()
            .times(1)
            .returning(move |account, cluster, csr| {
                assert_eq!(account, "alice");
                assert_eq!(cluster, "prod");
                let subject = CsrSubject::from_pem(csr).unwrap();
                assert_eq!(subject.common_name, "alice");
                assert_eq!(subject.organizational_units, vec!["admins", "devs"]);
                Ok(SignedCertificate {
                    cert_pem: ca.sign_client_csr(csr, LOCAL_CERT_VALIDITY).unwrap(),
                    ca_cert_pem: ca_pem.clone(),
                })
            });

        let issuer = CredentialIssuer::new(Arc::new(signer), users_returning(alice())).unwrap();
        let credentials = issuer.issue(&session(), "prod").await.unwrap();

        assert!(credentials.key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(credentials.client_config().is_ok());
    }

    #[tokio::test]
    async fn common_name_override_replaces_identity() {
        let ca = CertificateAuthority::new("Cluster CA").unwrap();
        let signer = LocalSigner::new().with_cluster("prod", ca);

        let issuer = CredentialIssuer::new(Arc::new(signer), users_returning(alice()))
            .unwrap()
            .with_common_name_override(Some("console".to_string()));
        let credentials = issuer.issue(&session(), "prod").await.unwrap();

        let info = CertificateInfo::from_pem(&credentials.cert_pem).unwrap();
        assert_eq!(info.common_name, "console");
    }

    #[tokio::test]
    async fn local_signer_keeps_every_group() {
        let ca = CertificateAuthority::new("Cluster CA").unwrap();
        let signer = LocalSigner::new().with_cluster("prod", ca);
        let issuer = CredentialIssuer::new(Arc::new(signer), users_returning(alice())).unwrap();

        let credentials = issuer.issue(&session(), "prod").await.unwrap();

        let info = CertificateInfo::from_pem(&credentials.cert_pem).unwrap();
        assert_eq!(info.common_name, "alice");
        assert_eq!(info.organizational_units, vec!["admins", "devs"]);
    }

    #[tokio::test]
    async fn key_is_shared_across_issues() {
        let ca = CertificateAuthority::new("Cluster CA").unwrap();
        let signer = LocalSigner::new().with_cluster("prod", ca);
        let issuer = CredentialIssuer::new(Arc::new(signer), users_returning(alice())).unwrap();

        let first = issuer.issue(&session(), "prod").await.unwrap();
        let second = issuer.issue(&session(), "prod").await.unwrap();

        assert_eq!(*first.key_pem, *second.key_pem);
        assert_ne!(first.cert_pem, second.cert_pem);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let issuer =
            CredentialIssuer::new(Arc::new(MockCertificateSigner::new()), users_returning(None))
                .unwrap();
        let result = issuer.issue(&session(), "prod").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_user_lookup_is_unauthorized() {
        let mut users = MockUserInfoProvider::new();
        users
            .expect_current_user_info()
            .returning(|_| Err(Error::Internal("directory down".to_string())));

        let issuer =
            CredentialIssuer::new(Arc::new(MockCertificateSigner::new()), Arc::new(users)).unwrap();
        let result = issuer.issue(&session(), "prod").await;
        assert!(matches!(result, Err(Error::Unauthorized(m)) if m.contains("directory down")));
    }

    #[tokio::test]
    async fn signing_failure_is_upstream_unavailable() {
        let mut signer = MockCertificateSigner::new();
        signer
            .expect_sign_tls_key()
            .times(1)
            .returning(|_, _, _| Err(Error::Internal("signer timed out".to_string())));

        let issuer = CredentialIssuer::new(Arc::new(signer), users_returning(alice())).unwrap();
        let result = issuer.issue(&session(), "prod").await;
        assert!(matches!(result, Err(Error::UpstreamUnavailable(m)) if m.contains("prod")));
    }

    #[tokio::test]
    async fn malformed_ca_bundle_is_bad_parameter() {
        let ca = CertificateAuthority::new("Cluster CA").unwrap();
        let mut signer = MockCertificateSigner::new();
        signer.expect_sign_tls_key().returning(move |_, _, csr| {
            Ok(SignedCertificate {
                cert_pem: ca.sign_client_csr(csr, LOCAL_CERT_VALIDITY).unwrap(),
                ca_cert_pem: "not a bundle".to_string(),
            })
        });

        let issuer = CredentialIssuer::new(Arc::new(signer), users_returning(alice())).unwrap();
        let result = issuer.issue(&session(), "prod").await;
        assert!(matches!(result, Err(Error::BadParameter(_))));
    }

    #[tokio::test]
    async fn local_signer_rejects_unknown_cluster() {
        let signer = LocalSigner::new();
        let result = signer.sign_tls_key("alice", "nowhere", "csr").await;
        assert!(matches!(result, Err(Error::ClusterNotFound(c)) if c == "nowhere"));
    }

    #[tokio::test]
    async fn local_signer_honours_validity() {
        let ca = CertificateAuthority::new("Cluster CA").unwrap();
        let signer = LocalSigner::new()
            .with_cluster("prod", ca)
            .with_validity(Duration::from_secs(120));
        let key = ClientKey::generate().unwrap();
        let csr = key.certificate_request("alice", &[]).unwrap();

        let signed = signer.sign_tls_key("alice", "prod", &csr).await.unwrap();
        let info = CertificateInfo::from_pem(&signed.cert_pem).unwrap();
        assert!((info.lifetime_secs() - 120).abs() <= 1);
    }
}
