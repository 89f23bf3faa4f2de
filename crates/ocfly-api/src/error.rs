use thiserror::Error;

use crate::message::ResponseCode;

/// Top-level error type for the `ocfly-api` crate.
///
/// Covers every failure mode below the device/ownership layer:
/// address parsing, transport, payload codecs, and certificate checks.
/// `ocfly-core` maps these into user-facing errors with operation context.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// Socket-level failure (bind, send, receive).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The exchange did not complete before its deadline.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The remote end closed or reset the session.
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// The exchange was abandoned because its caller gave up.
    #[error("Request canceled")]
    Canceled,

    /// The device answered with a non-success response code.
    #[error("Device responded {code} for {href}")]
    Status { code: ResponseCode, href: String },

    // ── Addressing ──────────────────────────────────────────────────
    /// Endpoint URI could not be parsed into a transport address.
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// A link carries no endpoint usable for the requested transport.
    #[error("No usable endpoint for {href}")]
    NoEndpoint { href: String },

    // ── Data ────────────────────────────────────────────────────────
    /// Payload encoding or decoding failed.
    #[error("Codec error ({media_type}): {message}")]
    Codec { media_type: String, message: String },

    // ── Security ────────────────────────────────────────────────────
    /// TLS configuration or handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Peer certificate rejected by identity verification.
    #[error("Certificate rejected: {0}")]
    Certificate(#[from] crate::identity::CertificateError),

    // ── Platform ────────────────────────────────────────────────────
    /// Operation not supported by the supplied transport.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout { .. } | Self::ConnectionClosed { .. } => true,
            Self::Status { code, .. } => code.is_server_error(),
            _ => false,
        }
    }

    /// Returns `true` if the device reported the resource as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Status {
                code: ResponseCode::NotFound,
                ..
            }
        )
    }

    /// Returns `true` if the session died underneath the request,
    /// either through a close/reset or through request cancellation.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. } | Self::Canceled)
    }

    /// Returns `true` if the device refused the request for lack of rights.
    pub fn is_forbidden(&self) -> bool {
        matches!(
            self,
            Self::Status {
                code: ResponseCode::Forbidden | ResponseCode::Unauthorized,
                ..
            }
        )
    }
}
