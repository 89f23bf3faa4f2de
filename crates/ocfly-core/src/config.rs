// ── Runtime client configuration ──
//
// Describes *how* the client talks to devices: where to discover, how
// long each attempt may take, how to retry, and which identity to present
// on secured sessions. Core never reads config files; `ocfly-config`
// builds one of these and hands it in.

use std::sync::Arc;
use std::time::Duration;

use ocfly_api::{Addr, Scheme, TlsIdentity};
use rustls_pki_types::CertificateDer;
use uuid::Uuid;

use crate::error::CoreError;
use crate::retry::RetryConfig;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DISCOVERY_CHANNEL_CAPACITY: usize = 64;

/// The OCF "All CoAP nodes" discovery groups (IPv4, IPv6 link-local,
/// IPv6 realm-local).
pub fn default_discovery_endpoints() -> Vec<Addr> {
    vec![
        Addr::new(Scheme::Udp, "224.0.1.187", 5683),
        Addr::new(Scheme::Udp, "ff02::158", 5683),
        Addr::new(Scheme::Udp, "ff03::158", 5683),
    ]
}

/// Identity presented on secured sessions plus the CAs device identity
/// certificates must chain to.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub tls: Arc<TlsIdentity>,
    pub trust_anchors: Vec<CertificateDer<'static>>,
}

impl IdentityConfig {
    /// The SDK's own UUID, read from the leaf certificate's common name.
    pub fn sdk_id(&self) -> Result<Uuid, CoreError> {
        let leaf = self.tls.leaf()?;
        ocfly_api::sdk_identity(leaf.as_ref())
            .map_err(|e| CoreError::internal(format!("cannot determine sdk id: {e}")))
    }
}

/// Configuration for one [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Multicast groups every discovery run queries.
    pub discovery_endpoints: Vec<Addr>,
    /// Per-attempt deadline of a single device operation.
    pub operation_timeout: Duration,
    /// Retry policy applied to every device operation.
    pub retry: RetryConfig,
    /// Buffer between discovery receivers and a [`discover`](crate::Client::discover) stream.
    pub discovery_channel_capacity: usize,
    /// Required for secured sessions and ownership operations.
    pub identity: Option<IdentityConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_endpoints: default_discovery_endpoints(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            retry: RetryConfig::default(),
            discovery_channel_capacity: DEFAULT_DISCOVERY_CHANNEL_CAPACITY,
            identity: None,
        }
    }
}

impl ClientConfig {
    pub fn identity(&self) -> Result<&IdentityConfig, CoreError> {
        self.identity.as_ref().ok_or_else(|| CoreError::Config {
            message: "no client identity configured for secured sessions".into(),
        })
    }
}
