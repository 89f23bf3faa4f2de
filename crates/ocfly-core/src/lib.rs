//! Discovery, ownership transfer and reliable resource access for OCF
//! devices, built on the transport seams of `ocfly-api`.
//!
//! - **[`Client`]**: Central facade for multicast discovery
//!   ([`get_devices`](Client::get_devices), [`discover`](Client::discover)),
//!   single-device lookup backed by the [`LinkCache`], resource access by
//!   device id over a shared connection pool, and Own/Disown.
//!
//! - **[`Device`]**: Handle to one discovered device. Owns its
//!   connections, runs every exchange through the retry orchestrator, and
//!   exposes its [`OwnershipPhase`].
//!
//! - **[`Context`]**: Cancellation plus deadline passed to every
//!   suspending call.
//!
//! - **Retry** ([`operation_with_retries`]): Per-attempt timeouts and
//!   pluggable [`RetryPolicy`] implementations selected by [`RetryConfig`].

pub mod client;
pub mod config;
pub mod context;
pub mod device;
pub mod discovery;
pub mod error;
pub mod retry;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use client::Client;
pub use config::{ClientConfig, IdentityConfig};
pub use context::Context;
pub use device::{
    Device, IdentityCertificateSigner, ManufacturerCertificate, OwnershipPhase,
    OwnershipTransferMethod,
};
pub use discovery::{DeviceHandler, DiscoveryEvent, DiscoveryStream};
pub use error::{CoreError, ErrorKind, ErrorSink, default_error_sink};
pub use retry::{
    ExponentialBackoff, FixedRetry, RetryConfig, RetryFactory, RetryPolicy,
    operation_with_retries,
};
pub use store::LinkCache;
