//! OCF resource payloads exchanged with devices.

pub mod cred;
pub mod device;
pub mod doxm;
pub mod link;
pub mod pstat;

pub use cred::{
    CRED_HREF, CSR_HREF, CertificateSigningRequest, Credential, CredentialPublicData,
    CredentialUpdate, ENCODING_PEM, USAGE_CERT, USAGE_TRUST_CA,
};
pub use device::{BASELINE_INTERFACE, DEVICE_RESOURCE_TYPE, DISCOVERY_HREF, DeviceInfo};
pub use doxm::{
    CredentialType, DOXM_HREF, DOXM_RESOURCE_TYPE, Doxm, DoxmUpdate, OwnerTransferMethod,
};
pub use link::{DEVICE_HREF, DeviceLinks, Endpoint, Policy, ResourceLink, ResourceLinks};
pub use pstat::{OperationalState, PSTAT_HREF, PSTAT_RESOURCE_TYPE, Pstat, PstatUpdate};
