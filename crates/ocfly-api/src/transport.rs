// Transport seams.
//
// The SDK never frames CoAP itself: a `Dialer` implementation (UDP/TCP,
// DTLS/TLS, or the in-memory one in `ocfly-mock`) hands out connections
// that exchange already-decoded `Request`/`Response` values.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use secrecy::{ExposeSecret, SecretSlice};
use uuid::Uuid;

use crate::addr::Addr;
use crate::error::Error;
use crate::identity::{IdentityCertVerifier, VerificationMode};
use crate::message::{Request, Response};

// ── Session lifecycle ───────────────────────────────────────────────

/// Why a connection's session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Closed locally.
    Closed,
    /// The peer closed or reset the session.
    Reset,
    /// The session failed.
    Error(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Reset => f.write_str("reset by peer"),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

/// Callback fired exactly once when a session ends.
pub type SessionObserver = Box<dyn FnOnce(SessionEnd) + Send + 'static>;

// ── Connection ──────────────────────────────────────────────────────

/// A live unicast session with one device endpoint.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Address the peer was actually reached on.
    fn remote_addr(&self) -> &Addr;

    /// Send one request and wait for its response.
    async fn exchange(&self, request: Request) -> Result<Response, Error>;

    /// Register an observer for the end of this session. Registering on an
    /// already-ended session fires the observer immediately.
    fn observe_session_end(&self, observer: SessionObserver);

    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// A multicast socket joined to one discovery group.
#[async_trait]
pub trait MulticastConnection: Send + Sync {
    fn group(&self) -> &Addr;

    async fn send(&self, request: Request) -> Result<(), Error>;

    /// Next response from any responder, with the responder's address.
    async fn recv(&self) -> Result<(Response, Addr), Error>;

    async fn close(&self);
}

// ── TLS material ────────────────────────────────────────────────────

/// Client certificate chain and private key presented on secured dials.
pub struct TlsIdentity {
    certificate_chain: Vec<CertificateDer<'static>>,
    private_key: SecretSlice<u8>,
}

impl TlsIdentity {
    /// `private_key` is PKCS#8 DER.
    pub fn new(certificate_chain: Vec<CertificateDer<'static>>, private_key: Vec<u8>) -> Self {
        Self {
            certificate_chain,
            private_key: SecretSlice::from(private_key),
        }
    }

    /// Parse a PEM certificate chain and PEM PKCS#8 key.
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, Error> {
        use rustls_pki_types::pem::PemObject;

        let certificate_chain = CertificateDer::pem_slice_iter(chain_pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::Tls(format!("invalid certificate chain: {e}")))?;
        if certificate_chain.is_empty() {
            return Err(Error::Tls("certificate chain is empty".into()));
        }
        let key = PrivatePkcs8KeyDer::from_pem_slice(key_pem)
            .map_err(|e| Error::Tls(format!("invalid private key: {e}")))?;
        Ok(Self::new(certificate_chain, key.secret_pkcs8_der().to_vec()))
    }

    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.certificate_chain
    }

    /// The end-entity (leaf) certificate.
    pub fn leaf(&self) -> Result<&CertificateDer<'static>, Error> {
        self.certificate_chain
            .first()
            .ok_or_else(|| Error::Tls("certificate chain is empty".into()))
    }

    /// A fresh rustls key handle for building a client config.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            self.private_key.expose_secret().to_vec(),
        ))
    }
}

impl fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("certificates", &self.certificate_chain.len())
            .field("private_key", &"[redacted]")
            .finish()
    }
}

/// How a secured dial authenticates the device.
#[derive(Debug, Clone)]
pub enum PeerVerification {
    /// Chain to a manufacturer CA only (ownership transfer).
    Manufacturer {
        trust_anchors: Vec<CertificateDer<'static>>,
    },
    /// Chain to an identity CA and carry a valid device identity,
    /// optionally bound to a specific device id.
    Identity {
        trust_anchors: Vec<CertificateDer<'static>>,
        expected_device_id: Option<Uuid>,
    },
}

impl PeerVerification {
    /// Build the rustls verifier implementing this policy.
    pub fn verifier(&self) -> Result<Arc<IdentityCertVerifier>, Error> {
        let verifier = match self {
            Self::Manufacturer { trust_anchors } => {
                IdentityCertVerifier::new(trust_anchors, VerificationMode::Manufacturer)?
            }
            Self::Identity {
                trust_anchors,
                expected_device_id,
            } => IdentityCertVerifier::new(
                trust_anchors,
                VerificationMode::Identity {
                    expected_device_id: *expected_device_id,
                },
            )?,
        };
        Ok(Arc::new(verifier))
    }
}

// ── Dialer ──────────────────────────────────────────────────────────

/// Opens sessions to device endpoints.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Unsecured dial (`coap`, `coap+tcp`).
    async fn dial(&self, addr: &Addr) -> Result<Arc<dyn Connection>, Error>;

    /// Secured dial (`coaps`, `coaps+tcp`) presenting `identity`.
    async fn dial_secure(
        &self,
        addr: &Addr,
        identity: Arc<TlsIdentity>,
        verification: PeerVerification,
    ) -> Result<Arc<dyn Connection>, Error>;

    /// Join a multicast group for discovery.
    async fn listen_multicast(&self, group: &Addr) -> Result<Box<dyn MulticastConnection>, Error>;
}
