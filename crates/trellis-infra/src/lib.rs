//! Infrastructure components for Trellis
//!
//! - **PKI**: the process-wide client key, multi-OU CSRs, a local CA
//! - **mTLS**: rustls client and server configs built from PEM material
//!
//! # Public API
//!
//! ## PKI
//! - [`pki::ClientKey`]: P-256 key that signs certificate requests
//! - [`pki::CertificateAuthority`]: CA operations for issuing certificates
//! - [`pki::CertificateInfo`], [`pki::CsrSubject`]: subject and validity inspection
//!
//! ## mTLS
//! - [`mtls::ClientMtlsConfig`], [`mtls::ServerMtlsConfig`]: rustls configuration
//! - [`mtls::MtlsError`]: Error type for mTLS operations

mod der;
pub mod mtls;
pub mod pki;

pub use mtls::{ClientMtlsConfig, MtlsError, ServerMtlsConfig};
pub use pki::{CertificateAuthority, CertificateInfo, ClientKey, CsrSubject, PkiError};
