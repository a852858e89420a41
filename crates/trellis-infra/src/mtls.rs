//! mTLS configuration for connections to cluster endpoints
//!
//! Builds rustls configs from PEM material: the client side presents a
//! per-session certificate and trusts only the configured CA bundle, the
//! server side (used for in-cluster endpoints and test fixtures) requires a
//! client certificate issued by a given CA.

use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::pki::parse_certificate_bundle;

/// ALPN protocol spoken to cluster endpoints; upgrades need HTTP/1.1
const ALPN_HTTP1: &[u8] = b"http/1.1";

/// mTLS configuration errors
#[derive(Debug, Error)]
pub enum MtlsError {
    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    CertificateParseError(String),

    /// Key parsing error
    #[error("key parsing error: {0}")]
    KeyParseError(String),

    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfigError(String),

    /// Missing certificate
    #[error("missing certificate")]
    MissingCertificate,
}

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn certificate_chain(pem_data: &str) -> Result<Vec<CertificateDer<'static>>, MtlsError> {
    let ders = parse_certificate_bundle(pem_data).map_err(|e| match e {
        crate::pki::PkiError::ParseError(msg) if msg.contains("no certificates") => {
            MtlsError::MissingCertificate
        }
        other => MtlsError::CertificateParseError(other.to_string()),
    })?;
    Ok(ders.into_iter().map(CertificateDer::from).collect())
}

/// Build a root store from a CA bundle
///
/// Every certificate in the bundle must be accepted as a trust anchor.
pub fn root_store(ca_bundle_pem: &str) -> Result<RootCertStore, MtlsError> {
    let mut roots = RootCertStore::empty();
    for cert in certificate_chain(ca_bundle_pem)? {
        roots
            .add(cert)
            .map_err(|e| MtlsError::CertificateParseError(format!("bad trust anchor: {}", e)))?;
    }
    Ok(roots)
}

fn private_key(key_pem: &str) -> Result<PrivateKeyDer<'static>, MtlsError> {
    let block = ::pem::parse(key_pem.as_bytes())
        .map_err(|e| MtlsError::KeyParseError(format!("failed to parse PEM: {}", e)))?;
    let der = block.contents().to_vec();
    match block.tag() {
        "PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(der))),
        "EC PRIVATE KEY" => Ok(PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(der))),
        "RSA PRIVATE KEY" => Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(der))),
        other => Err(MtlsError::KeyParseError(format!(
            "unsupported key type '{}'",
            other
        ))),
    }
}

/// Client-side mTLS configuration
pub struct ClientMtlsConfig {
    /// Client certificate chain PEM
    pub client_cert_pem: String,
    /// Client private key PEM (zeroized on drop)
    pub client_key_pem: Zeroizing<String>,
    /// CA bundle PEM for verifying the server
    pub ca_cert_pem: String,
}

impl ClientMtlsConfig {
    /// Create a new client mTLS config
    pub fn new(
        client_cert_pem: String,
        client_key_pem: Zeroizing<String>,
        ca_cert_pem: String,
    ) -> Self {
        Self {
            client_cert_pem,
            client_key_pem,
            ca_cert_pem,
        }
    }

    /// Build a rustls ClientConfig speaking HTTP/1.1
    pub fn to_rustls_config(&self) -> Result<Arc<ClientConfig>, MtlsError> {
        let roots = root_store(&self.ca_cert_pem)?;
        let chain = certificate_chain(&self.client_cert_pem)?;
        let key = private_key(&self.client_key_pem)?;

        let mut config = ClientConfig::builder_with_provider(crypto_provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

        Ok(Arc::new(config))
    }
}

/// Server-side mTLS configuration
pub struct ServerMtlsConfig {
    /// Server certificate chain PEM
    pub server_cert_pem: String,
    /// Server private key PEM (zeroized on drop)
    pub server_key_pem: Zeroizing<String>,
    /// CA bundle PEM for verifying clients
    pub ca_cert_pem: String,
}

impl ServerMtlsConfig {
    /// Create a new server mTLS config
    pub fn new(
        server_cert_pem: String,
        server_key_pem: Zeroizing<String>,
        ca_cert_pem: String,
    ) -> Self {
        Self {
            server_cert_pem,
            server_key_pem,
            ca_cert_pem,
        }
    }

    /// Build a rustls ServerConfig that requires a client certificate
    pub fn to_rustls_config(&self) -> Result<Arc<ServerConfig>, MtlsError> {
        let provider = crypto_provider();
        let roots = Arc::new(root_store(&self.ca_cert_pem)?);
        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
            .build()
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;

        let chain = certificate_chain(&self.server_cert_pem)?;
        let key = private_key(&self.server_key_pem)?;

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .map_err(|e| MtlsError::TlsConfigError(e.to_string()))?;
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];

        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{CertificateAuthority, ClientKey};

    fn client_material(ca: &CertificateAuthority) -> (String, Zeroizing<String>) {
        let key = ClientKey::generate().expect("key generation should succeed");
        let csr = key
            .certificate_request("test-user", &["testers".to_string()])
            .expect("CSR generation should succeed");
        let cert = ca
            .sign_client_csr(&csr, std::time::Duration::from_secs(600))
            .expect("CSR signing should succeed");
        (cert, key.private_key_pem())
    }

    #[test]
    fn client_config_builds() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let (cert, key) = client_material(&ca);
        let config = ClientMtlsConfig::new(cert, key, ca.ca_cert_pem().to_string());

        let rustls_config = config.to_rustls_config().expect("config should build");
        assert_eq!(rustls_config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn server_config_builds() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let (cert, key) = ca.generate_server_cert(&["localhost"]).unwrap();
        let config = ServerMtlsConfig::new(cert, Zeroizing::new(key), ca.ca_cert_pem().to_string());

        assert!(config.to_rustls_config().is_ok());
    }

    #[test]
    fn empty_ca_bundle_is_missing_certificate() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let (cert, key) = client_material(&ca);
        let config = ClientMtlsConfig::new(cert, key, String::new());

        assert!(matches!(
            config.to_rustls_config(),
            Err(MtlsError::MissingCertificate)
        ));
    }

    #[test]
    fn garbage_ca_bundle_is_rejected() {
        let ca = CertificateAuthority::new("Test CA").unwrap();
        let (cert, key) = client_material(&ca);
        let bogus = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n";
        let config = ClientMtlsConfig::new(cert, key, bogus.to_string());

        assert!(matches!(
            config.to_rustls_config(),
            Err(MtlsError::CertificateParseError(_))
        ));
    }

    #[test]
    fn unsupported_key_type_is_rejected() {
        let err = private_key("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n")
            .unwrap_err();
        assert!(err.to_string().contains("unsupported key type"));
    }
}
