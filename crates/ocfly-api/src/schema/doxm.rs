// ── Device ownership transfer (`/oic/sec/doxm`) ──

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DOXM_HREF: &str = "/oic/sec/doxm";
pub const DOXM_RESOURCE_TYPE: &str = "oic.r.doxm";

/// Owner transfer method identifier (`oxms` / `oxmsel`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerTransferMethod(pub i64);

impl OwnerTransferMethod {
    pub const JUST_WORKS: Self = Self(0);
    pub const RANDOM_PIN: Self = Self(1);
    pub const MANUFACTURER_CERTIFICATE: Self = Self(2);
    pub const SELF_OWNERSHIP: Self = Self(0xFF03);
}

impl fmt::Display for OwnerTransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::JUST_WORKS => f.write_str("justworks"),
            Self::RANDOM_PIN => f.write_str("randompin"),
            Self::MANUFACTURER_CERTIFICATE => f.write_str("manufacturercertificate"),
            Self::SELF_OWNERSHIP => f.write_str("self"),
            Self(other) => write!(f, "oxm({other})"),
        }
    }
}

/// Supported credential types bitmask (`sct`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialType(pub u32);

impl CredentialType {
    pub const EMPTY: Self = Self(0);
    pub const SYMMETRIC_PAIR_WISE: Self = Self(1);
    pub const SYMMETRIC_GROUP: Self = Self(2);
    pub const ASYMMETRIC_SIGNING: Self = Self(4);
    pub const ASYMMETRIC_SIGNING_WITH_CERTIFICATE: Self = Self(8);
    pub const PIN_OR_PASSWORD: Self = Self(16);
    pub const ASYMMETRIC_ENCRYPTION_KEY: Self = Self(32);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CredentialType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Ownership state of a device as read from `/oic/sec/doxm`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Doxm {
    #[serde(rename = "oxms", default)]
    pub supported_owner_transfer_methods: Vec<OwnerTransferMethod>,
    #[serde(rename = "oxmsel", default)]
    pub selected_owner_transfer_method: OwnerTransferMethod,
    #[serde(rename = "sct", default)]
    pub supported_credential_types: CredentialType,
    #[serde(default)]
    pub owned: bool,
    #[serde(rename = "deviceuuid", default)]
    pub device_id: String,
    #[serde(rename = "devowneruuid", default)]
    pub owner_id: String,
    #[serde(rename = "rowneruuid", default)]
    pub resource_owner_id: String,
    #[serde(rename = "rt", default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<String>,
    #[serde(rename = "if", default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
}

impl Doxm {
    pub fn supports(&self, method: OwnerTransferMethod) -> bool {
        self.supported_owner_transfer_methods.contains(&method)
    }
}

/// Partial doxm write; only the populated fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoxmUpdate {
    #[serde(rename = "oxmsel", default, skip_serializing_if = "Option::is_none")]
    pub selected_owner_transfer_method: Option<OwnerTransferMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owned: Option<bool>,
    #[serde(rename = "devowneruuid", default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(rename = "rowneruuid", default, skip_serializing_if = "Option::is_none")]
    pub resource_owner_id: Option<String>,
}

impl DoxmUpdate {
    pub fn select(method: OwnerTransferMethod) -> Self {
        Self {
            selected_owner_transfer_method: Some(method),
            ..Self::default()
        }
    }

    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Self::default()
        }
    }

    pub fn resource_owner(owner_id: impl Into<String>) -> Self {
        Self {
            resource_owner_id: Some(owner_id.into()),
            ..Self::default()
        }
    }

    pub fn owned(owned: bool) -> Self {
        Self {
            owned: Some(owned),
            ..Self::default()
        }
    }
}
