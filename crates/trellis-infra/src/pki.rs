//! PKI operations for forwarder client credentials
//!
//! The forwarder owns a single ECDSA P-256 key for the life of the process.
//! Per-session client certificates are obtained by sending a CSR over that key
//! to a signer; the private key itself never leaves the process.
//!
//! Subjects carry the user identity as the common name and one
//! organizational unit per group, which is how the Kubernetes API server maps
//! client certificates to users and groups.

use std::time::Duration;

use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use aws_lc_rs::signature::{
    EcdsaKeyPair, KeyPair as _, UnparsedPublicKey, ECDSA_P256_SHA256_ASN1,
    ECDSA_P256_SHA256_ASN1_SIGNING,
};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tracing::debug;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::der;

/// Default validity period for CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Default validity period for server certificates (1 year)
pub const SERVER_CERT_VALIDITY_YEARS: i64 = 1;

const PEM_TAG_CERTIFICATE: &str = "CERTIFICATE";
const PEM_TAG_CSR: &str = "CERTIFICATE REQUEST";
const PEM_TAG_PRIVATE_KEY: &str = "PRIVATE KEY";

fn compute_validity(lifetime: ::time::Duration) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + lifetime)
}

fn years(count: i64) -> ::time::Duration {
    ::time::Duration::days(count * 365)
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Parse every CERTIFICATE block in a PEM bundle
///
/// Fails if the bundle is malformed or holds no certificates.
pub fn parse_certificate_bundle(pem_data: &str) -> Result<Vec<Vec<u8>>> {
    let blocks = ::pem::parse_many(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM bundle: {}", e)))?;

    let certs: Vec<Vec<u8>> = blocks
        .into_iter()
        .filter(|block| block.tag() == PEM_TAG_CERTIFICATE)
        .map(|block| block.into_contents())
        .collect();

    if certs.is_empty() {
        return Err(PkiError::ParseError(
            "PEM bundle contains no certificates".to_string(),
        ));
    }
    Ok(certs)
}

fn subject_names(name: &X509Name<'_>) -> (String, Vec<String>) {
    let common_name = name
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();
    let organizational_units = name
        .iter_organizational_unit()
        .filter_map(|ou| ou.as_str().ok())
        .map(str::to_string)
        .collect();
    (common_name, organizational_units)
}

/// Information about an issued certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Subject organizational units, in subject order
    pub organizational_units: Vec<String>,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let (common_name, organizational_units) = subject_names(cert.subject());

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            organizational_units,
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Seconds remaining until the certificate expires
    pub fn remaining_secs(&self) -> i64 {
        self.not_after - ::time::OffsetDateTime::now_utc().unix_timestamp()
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        self.remaining_secs() <= 0
    }
}

/// Subject of a certificate signing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrSubject {
    /// Requested common name
    pub common_name: String,
    /// Requested organizational units, in subject order
    pub organizational_units: Vec<String>,
}

impl CsrSubject {
    /// Read the subject out of a PEM-encoded CSR
    pub fn from_pem(csr_pem: &str) -> Result<Self> {
        let der = parse_pem(csr_pem).map_err(|e| PkiError::InvalidCsr(e.to_string()))?;
        let (_, csr) = X509CertificationRequest::from_der(&der)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;
        let (common_name, organizational_units) =
            subject_names(&csr.certification_request_info.subject);
        Ok(Self {
            common_name,
            organizational_units,
        })
    }
}

/// Process-wide ECDSA P-256 client key
///
/// Stored as PKCS#8 so it can be handed to rustls and re-loaded for signing
/// without keeping a live key object around.
pub struct ClientKey {
    pkcs8: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientKey").finish_non_exhaustive()
    }
}

impl ClientKey {
    /// Generate a fresh P-256 key
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        let document = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|_| PkiError::KeyGenerationFailed("failed to generate P-256 key".to_string()))?;
        Ok(Self {
            pkcs8: Zeroizing::new(document.as_ref().to_vec()),
        })
    }

    /// Load a key from PKCS#8 PEM
    pub fn from_pem(key_pem: &str) -> Result<Self> {
        let pkcs8 = Zeroizing::new(parse_pem(key_pem)?);
        EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &pkcs8)
            .map_err(|e| PkiError::ParseError(format!("not a P-256 PKCS#8 key: {}", e)))?;
        Ok(Self { pkcs8 })
    }

    /// PKCS#8 DER encoding of the private key
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    /// PKCS#8 PEM encoding of the private key
    pub fn private_key_pem(&self) -> Zeroizing<String> {
        let block = ::pem::Pem::new(PEM_TAG_PRIVATE_KEY, self.pkcs8.to_vec());
        Zeroizing::new(::pem::encode(&block))
    }

    fn key_pair(&self) -> Result<EcdsaKeyPair> {
        EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &self.pkcs8)
            .map_err(|e| PkiError::ParseError(format!("failed to load client key: {}", e)))
    }

    /// Build a PEM CSR for `common_name` with one organizational unit per entry
    pub fn certificate_request(
        &self,
        common_name: &str,
        organizational_units: &[String],
    ) -> Result<String> {
        if common_name.is_empty() {
            return Err(PkiError::InvalidCsr(
                "common name must not be empty".to_string(),
            ));
        }

        let key_pair = self.key_pair()?;

        let mut attributes: Vec<(&[u64], &str)> = vec![(der::OID_COMMON_NAME, common_name)];
        attributes.extend(
            organizational_units
                .iter()
                .map(|ou| (der::OID_ORGANIZATIONAL_UNIT, ou.as_str())),
        );

        let request_info = der::sequence(&[
            &der::small_integer(0),
            &der::name(&attributes),
            &der::p256_public_key_info(key_pair.public_key().as_ref()),
            &der::empty_attributes(),
        ]);

        let rng = SystemRandom::new();
        let signature = key_pair.sign(&rng, &request_info).map_err(|_| {
            PkiError::CertificateGenerationFailed("failed to sign certificate request".to_string())
        })?;

        let algorithm = der::sequence(&[&der::oid(der::OID_ECDSA_WITH_SHA256)]);
        let csr = der::sequence(&[
            &request_info,
            &algorithm,
            &der::bit_string(signature.as_ref()),
        ]);

        Ok(::pem::encode(&::pem::Pem::new(PEM_TAG_CSR, csr)))
    }
}

/// Certificate Authority used to issue client and server certificates
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate
    ca_cert_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Trellis".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(years(CA_VALIDITY_YEARS));
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from its PEM certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        CertificateInfo::from_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// The CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// The CA private key in PEM format, for persisting a generated CA
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Validity and subject of the CA certificate
    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.ca_cert_pem)
    }

    fn issuer(&self) -> Result<Issuer<'static, KeyPair>> {
        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        Issuer::from_ca_cert_pem(&self.ca_cert_pem, ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))
    }

    /// Generate a TLS server certificate for the given SANs
    ///
    /// Returns `(cert_pem, key_pem)`.
    pub fn generate_server_cert(&self, sans: &[&str]) -> Result<(String, String)> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(sans.first().copied().unwrap_or("Trellis Server").to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = compute_validity(years(SERVER_CERT_VALIDITY_YEARS));
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.to_string())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGenerationFailed(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let server_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate server key: {}", e))
        })?;

        let server_cert = params.signed_by(&server_key, &self.issuer()?).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign server cert: {}", e))
        })?;

        Ok((server_cert.pem(), server_key.serialize_pem()))
    }

    fn signing_key(&self) -> Result<EcdsaKeyPair> {
        let pkcs8 = Zeroizing::new(parse_pem(&self.ca_key_pem)?);
        EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_ASN1_SIGNING, &pkcs8).map_err(|e| {
            PkiError::ParseError(format!("client signing needs a P-256 CA key: {}", e))
        })
    }

    /// Sign a client CSR, keeping the requested subject
    ///
    /// The subject and public key are copied byte for byte from the request,
    /// so every organizational unit survives. The issued certificate is valid
    /// for client authentication only and expires after `lifetime`.
    pub fn sign_client_csr(&self, csr_pem: &str, lifetime: Duration) -> Result<String> {
        let csr_der = parse_pem(csr_pem).map_err(|e| PkiError::InvalidCsr(e.to_string()))?;
        let (_, csr) = X509CertificationRequest::from_der(&csr_der)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;
        let request_info = &csr.certification_request_info;

        let (common_name, organizational_units) = subject_names(&request_info.subject);
        if common_name.is_empty() {
            return Err(PkiError::InvalidCsr("CSR has no common name".to_string()));
        }

        UnparsedPublicKey::new(
            &ECDSA_P256_SHA256_ASN1,
            request_info.subject_pki.subject_public_key.data.as_ref(),
        )
        .verify(request_info.raw, csr.signature_value.data.as_ref())
        .map_err(|_| {
            PkiError::InvalidCsr("CSR is not self-signed by a P-256 key".to_string())
        })?;

        let ca_der = parse_pem(&self.ca_cert_pem)?;
        let (_, ca_cert) = X509Certificate::from_der(&ca_der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;
        let ca_key = self.signing_key()?;
        let rng = SystemRandom::new();

        let mut serial = [0u8; 16];
        rng.fill(&mut serial).map_err(|_| {
            PkiError::CertificateGenerationFailed("failed to generate serial".to_string())
        })?;
        serial[0] = (serial[0] & 0x7f) | 0x40;

        let lifetime = ::time::Duration::seconds(lifetime.as_secs() as i64);
        let (not_before, not_after) = compute_validity(lifetime);

        let extensions = der::sequence(&[
            &der::extension(der::OID_BASIC_CONSTRAINTS, true, &der::sequence(&[])),
            &der::extension(
                der::OID_KEY_USAGE,
                true,
                &der::flag_bits(der::KEY_USAGE_DIGITAL_SIGNATURE),
            ),
            &der::extension(
                der::OID_EXT_KEY_USAGE,
                false,
                &der::sequence(&[&der::oid(der::OID_CLIENT_AUTH)]),
            ),
        ]);

        let algorithm = der::sequence(&[&der::oid(der::OID_ECDSA_WITH_SHA256)]);
        let tbs = der::sequence(&[
            &der::explicit(0, &der::small_integer(2)),
            &der::unsigned_integer(&serial),
            &algorithm,
            ca_cert.subject().as_raw(),
            &der::sequence(&[&der::x509_time(not_before), &der::x509_time(not_after)]),
            request_info.subject.as_raw(),
            request_info.subject_pki.raw,
            &der::explicit(3, &extensions),
        ]);

        let signature = ca_key.sign(&rng, &tbs).map_err(|_| {
            PkiError::CertificateGenerationFailed("failed to sign certificate".to_string())
        })?;
        let cert = der::sequence(&[&tbs, &algorithm, &der::bit_string(signature.as_ref())]);

        debug!(
            common_name = %common_name,
            organizational_units = ?organizational_units,
            "Signed client certificate"
        );
        Ok(::pem::encode(&::pem::Pem::new(PEM_TAG_CERTIFICATE, cert)))
    }
}
