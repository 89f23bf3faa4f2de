// ── Core error types ──
//
// User-facing errors from ocfly-core. Transport failures surface wrapped
// with the device and resource they happened on; ownership rules surface
// as PermissionDenied / Internal the way callers branch on them.

use thiserror::Error;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Canceled,
    DeadlineExceeded,
    Unavailable,
    InvalidData,
    Config,
    Internal,
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Lookup errors ────────────────────────────────────────────────
    #[error("Device not found: {device_id}")]
    DeviceNotFound { device_id: String },

    #[error("Resource {href} not found on device {device_id}")]
    ResourceNotFound { device_id: String, href: String },

    // ── Ownership errors ─────────────────────────────────────────────
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("{operation} {href} on device {device_id} failed: {source}")]
    Resource {
        operation: &'static str,
        device_id: String,
        href: String,
        #[source]
        source: ocfly_api::Error,
    },

    #[error("{reason}: {last}")]
    RetryExhausted {
        reason: String,
        attempts: u32,
        #[source]
        last: Box<CoreError>,
    },

    #[error("Invalid discovery response from {from}: {message}")]
    InvalidDiscoveryResponse { from: String, message: String },

    #[error("Operation canceled")]
    Canceled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    // ── Transport errors (no resource context) ───────────────────────
    #[error(transparent)]
    Transport(ocfly_api::Error),

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("{message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<CoreError>>,
    },
}

impl CoreError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap `source` as an internal failure of `message`.
    pub fn internal_from(message: impl Into<String>, source: CoreError) -> Self {
        let message = format!("{}: {source}", message.into());
        Self::Internal {
            message,
            source: Some(Box::new(source)),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DeviceNotFound { .. } | Self::ResourceNotFound { .. } => ErrorKind::NotFound,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::Resource { source, .. } | Self::Transport(source) => transport_kind(source),
            Self::RetryExhausted { last, .. } => last.kind(),
            Self::InvalidDiscoveryResponse { .. } => ErrorKind::InvalidData,
            Self::Canceled => ErrorKind::Canceled,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Config { .. } => ErrorKind::Config,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_permission_denied(&self) -> bool {
        self.kind() == ErrorKind::PermissionDenied
    }

    pub fn is_internal(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }

    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::Canceled
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.kind() == ErrorKind::DeadlineExceeded
    }

    /// The session was closed or cancelled underneath the operation.
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::Canceled => true,
            Self::Resource { source, .. } | Self::Transport(source) => {
                source.is_connection_closed()
            }
            Self::RetryExhausted { last, .. } => last.is_connection_closed(),
            _ => false,
        }
    }

    /// Another attempt cannot change the outcome: the device rejected the
    /// request itself, or the request could not be formed.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::ResourceNotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::InvalidDiscoveryResponse { .. }
            | Self::Config { .. } => true,
            Self::Resource { source, .. } | Self::Transport(source) => !source.is_transient(),
            _ => false,
        }
    }

    /// Attach device/resource context to a transport failure.
    pub fn resource(
        operation: &'static str,
        device_id: &str,
        href: &str,
        source: ocfly_api::Error,
    ) -> Self {
        match source {
            ocfly_api::Error::Canceled => Self::Canceled,
            source => Self::Resource {
                operation,
                device_id: device_id.to_owned(),
                href: href.to_owned(),
                source,
            },
        }
    }
}

fn transport_kind(err: &ocfly_api::Error) -> ErrorKind {
    if err.is_not_found() {
        ErrorKind::NotFound
    } else if err.is_forbidden() {
        ErrorKind::PermissionDenied
    } else if matches!(err, ocfly_api::Error::Canceled) {
        ErrorKind::Canceled
    } else if matches!(err, ocfly_api::Error::Codec { .. }) {
        ErrorKind::InvalidData
    } else {
        ErrorKind::Unavailable
    }
}

// ── Error sink ───────────────────────────────────────────────────────

/// Receives non-fatal background errors (failed discovery sockets,
/// connection loss tolerated by an operation).
pub type ErrorSink = std::sync::Arc<dyn Fn(&CoreError) + Send + Sync>;

/// Logs every reported error at `warn`.
pub fn default_error_sink() -> ErrorSink {
    std::sync::Arc::new(|err: &CoreError| {
        tracing::warn!(error = %err, kind = %err.kind(), "background error");
    })
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<ocfly_api::Error> for CoreError {
    fn from(err: ocfly_api::Error) -> Self {
        match err {
            ocfly_api::Error::Canceled => Self::Canceled,
            ocfly_api::Error::InvalidAddress { address, reason } => Self::Config {
                message: format!("invalid address {address}: {reason}"),
            },
            other => Self::Transport(other),
        }
    }
}
