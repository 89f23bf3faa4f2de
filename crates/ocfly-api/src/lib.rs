// ocfly-api: wire-level types, codecs, transport seams and pooling for OCF devices

pub mod addr;
pub mod codec;
pub mod error;
pub mod identity;
pub mod message;
pub mod pool;
pub mod schema;
pub mod transport;

pub use addr::{Addr, Scheme};
pub use codec::{CborCodec, Codec, JsonCodec, RawCodec};
pub use error::Error;
pub use identity::{
    CertificateError, IdentityCertVerifier, OCF_IDENTITY_OID, VerificationMode, sdk_identity,
    verify_identity_certificate,
};
pub use message::{
    ContentFormat, Method, Request, Response, ResponseCode, interface_query, resource_type_query,
};
pub use pool::Pool;
pub use transport::{
    Connection, Dialer, MulticastConnection, PeerVerification, SessionEnd, SessionObserver,
    TlsIdentity,
};
