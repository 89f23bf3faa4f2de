//! In-memory OCF devices for testing ocfly without a network.
//!
//! A [`MockNetwork`] holds [`MockDevice`]s; its [`MockDialer`] implements
//! the `ocfly_api::Dialer` seam so a client can discover, read, write, own
//! and disown them. Secured sessions verify real certificate chains issued
//! by [`TestPki`].

mod connection;
mod device;
mod network;
mod pki;

pub use connection::{MockConnection, MockMulticast};
pub use device::{MockDevice, MockDeviceBuilder, MockResource, RecordedRequest};
pub use network::{MockDialer, MockNetwork};
pub use pki::TestPki;
