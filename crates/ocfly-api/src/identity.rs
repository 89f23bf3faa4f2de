//! Device identity certificates.
//!
//! An OCF identity certificate binds a TLS peer to a device UUID. It must
//! carry the clientAuth and serverAuth extended key usages plus the OCF
//! identity purpose, and its subject common name must be `uuid:<UUID>`.
//!
//! [`IdentityCertVerifier`] plugs these checks into a rustls handshake as a
//! server certificate verifier.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::CryptoProvider;
use rustls::server::ParsedCertificate;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use uuid::Uuid;
use x509_parser::prelude::*;

/// OCF device identity extended key usage purpose.
pub const OCF_IDENTITY_OID: &str = "1.3.6.1.4.1.44924.1.6";

const COMMON_NAME_PREFIX: &str = "uuid";

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CertificateError {
    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("certificate has no extended key usage extension")]
    MissingExtendedKeyUsage,

    #[error("certificate is not valid for {0}")]
    MissingPurpose(&'static str),

    #[error("certificate subject has no common name")]
    MissingCommonName,

    #[error("invalid common name '{0}': expected 'uuid:<UUID>'")]
    InvalidCommonName(String),

    #[error("invalid device id '{value}' in common name: {reason}")]
    InvalidDeviceId { value: String, reason: String },

    #[error("device id mismatch: expected {expected}, got {actual}")]
    DeviceIdMismatch { expected: Uuid, actual: Uuid },

    #[error("certificate chain rejected: {0}")]
    Chain(String),
}

// ── Identity checks ─────────────────────────────────────────────────

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, CertificateError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| CertificateError::Parse(e.to_string()))?;
    Ok(cert)
}

fn common_name<'a>(cert: &'a X509Certificate<'_>) -> Result<&'a str, CertificateError> {
    cert.subject()
        .iter_common_name()
        .next()
        .ok_or(CertificateError::MissingCommonName)?
        .as_str()
        .map_err(|e| CertificateError::Parse(e.to_string()))
}

/// Parse `uuid:<UUID>`; the prefix is case-insensitive and exactly one
/// separator is allowed.
pub fn parse_identity_common_name(cn: &str) -> Result<Uuid, CertificateError> {
    let parts: Vec<&str> = cn.split(':').collect();
    let [prefix, id] = parts.as_slice() else {
        return Err(CertificateError::InvalidCommonName(cn.to_owned()));
    };
    if !prefix.eq_ignore_ascii_case(COMMON_NAME_PREFIX) {
        return Err(CertificateError::InvalidCommonName(cn.to_owned()));
    }
    Uuid::parse_str(id).map_err(|e| CertificateError::InvalidDeviceId {
        value: (*id).to_owned(),
        reason: e.to_string(),
    })
}

/// Validate an identity certificate (DER) and return the device UUID it
/// carries.
pub fn verify_identity_certificate(der: &[u8]) -> Result<Uuid, CertificateError> {
    let cert = parse(der)?;

    let eku = cert
        .extended_key_usage()
        .map_err(|e| CertificateError::Parse(e.to_string()))?
        .ok_or(CertificateError::MissingExtendedKeyUsage)?
        .value;
    if !eku.client_auth {
        return Err(CertificateError::MissingPurpose("client authentication"));
    }
    if !eku.server_auth {
        return Err(CertificateError::MissingPurpose("server authentication"));
    }
    if !eku.other.iter().any(|oid| oid.to_id_string() == OCF_IDENTITY_OID) {
        return Err(CertificateError::MissingPurpose("OCF device identity"));
    }

    parse_identity_common_name(common_name(&cert)?)
}

/// The SDK's own UUID, taken from its client certificate's common name.
pub fn sdk_identity(der: &[u8]) -> Result<Uuid, CertificateError> {
    let cert = parse(der)?;
    parse_identity_common_name(common_name(&cert)?)
}

// ── rustls verifier ─────────────────────────────────────────────────

/// What a secured handshake requires of the device's certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationMode {
    /// Chain only (manufacturer certificates during ownership transfer).
    Manufacturer,
    /// Chain plus a valid identity, optionally pinned to one device.
    Identity { expected_device_id: Option<Uuid> },
}

/// Server certificate verifier for device sessions.
///
/// Device certificates are never issued for a DNS name or IP, so the
/// chain is checked against the trust anchors without a name check.
#[derive(Debug)]
pub struct IdentityCertVerifier {
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
    mode: VerificationMode,
}

impl IdentityCertVerifier {
    pub fn new(
        trust_anchors: &[CertificateDer<'static>],
        mode: VerificationMode,
    ) -> Result<Self, crate::Error> {
        let mut roots = RootCertStore::empty();
        for anchor in trust_anchors {
            roots
                .add(anchor.clone())
                .map_err(|e| crate::Error::Tls(format!("invalid trust anchor: {e}")))?;
        }
        if roots.is_empty() {
            return Err(crate::Error::Tls("no trust anchors configured".into()));
        }
        Ok(Self {
            roots,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
            mode,
        })
    }

    pub fn mode(&self) -> VerificationMode {
        self.mode
    }

    /// Verify a presented chain at `now`. Returns the device UUID in
    /// identity mode, `None` in manufacturer mode.
    pub fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<Option<Uuid>, CertificateError> {
        let parsed =
            ParsedCertificate::try_from(end_entity).map_err(|e| CertificateError::Chain(e.to_string()))?;
        verify_server_cert_signed_by_trust_anchor(
            &parsed,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )
        .map_err(|e| CertificateError::Chain(e.to_string()))?;

        match self.mode {
            VerificationMode::Manufacturer => Ok(None),
            VerificationMode::Identity { expected_device_id } => {
                let actual = verify_identity_certificate(end_entity.as_ref())?;
                match expected_device_id {
                    Some(expected) if expected != actual => {
                        Err(CertificateError::DeviceIdMismatch { expected, actual })
                    }
                    _ => Ok(Some(actual)),
                }
            }
        }
    }
}

impl ServerCertVerifier for IdentityCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.verify_chain(end_entity, intermediates, now) {
            Ok(device_id) => {
                tracing::debug!(?device_id, mode = ?self.mode, "device certificate accepted");
                Ok(ServerCertVerified::assertion())
            }
            Err(e) => {
                tracing::warn!(error = %e, "device certificate rejected");
                Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::Other(rustls::OtherError(Arc::new(e))),
                ))
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
