// ── Credentials (`/oic/sec/cred`) and CSR (`/oic/sec/csr`) ──

use serde::{Deserialize, Serialize};

use super::doxm::CredentialType;

pub const CRED_HREF: &str = "/oic/sec/cred";
pub const CSR_HREF: &str = "/oic/sec/csr";

pub const ENCODING_PEM: &str = "oic.sec.encoding.pem";
pub const USAGE_CERT: &str = "oic.sec.cred.cert";
pub const USAGE_TRUST_CA: &str = "oic.sec.cred.trustca";

/// Certificate signing request served by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSigningRequest {
    pub csr: String,
    #[serde(default)]
    pub encoding: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPublicData {
    pub data: String,
    pub encoding: String,
}

impl CredentialPublicData {
    pub fn pem(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            encoding: ENCODING_PEM.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    #[serde(rename = "credtype")]
    pub credential_type: CredentialType,
    #[serde(rename = "subjectuuid")]
    pub subject: String,
    #[serde(rename = "credusage", default, skip_serializing_if = "String::is_empty")]
    pub usage: String,
    #[serde(rename = "publicdata", default, skip_serializing_if = "Option::is_none")]
    pub public_data: Option<CredentialPublicData>,
}

impl Credential {
    /// The device's own identity certificate chain.
    pub fn identity_certificate(device_id: &str, pem_chain: impl Into<String>) -> Self {
        Self {
            credential_type: CredentialType::ASYMMETRIC_SIGNING_WITH_CERTIFICATE,
            subject: device_id.to_owned(),
            usage: USAGE_CERT.to_owned(),
            public_data: Some(CredentialPublicData::pem(pem_chain)),
        }
    }

    /// A trusted CA the device accepts for its owner's peers.
    pub fn trust_anchor(owner_id: &str, pem: impl Into<String>) -> Self {
        Self {
            credential_type: CredentialType::ASYMMETRIC_SIGNING_WITH_CERTIFICATE,
            subject: owner_id.to_owned(),
            usage: USAGE_TRUST_CA.to_owned(),
            public_data: Some(CredentialPublicData::pem(pem)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialUpdate {
    #[serde(rename = "creds")]
    pub credentials: Vec<Credential>,
    #[serde(rename = "rowneruuid", default, skip_serializing_if = "Option::is_none")]
    pub resource_owner_id: Option<String>,
}
