use serde::{Deserialize, Serialize};

pub const DEVICE_RESOURCE_TYPE: &str = "oic.wk.d";
pub const DISCOVERY_HREF: &str = "/oic/res";
pub const BASELINE_INTERFACE: &str = "oic.if.baseline";

/// Device descriptor (`/oic/d`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "di")]
    pub id: String,
    #[serde(rename = "n", default)]
    pub name: String,
    #[serde(rename = "rt", default)]
    pub resource_types: Vec<String>,
    #[serde(rename = "if", default)]
    pub interfaces: Vec<String>,
    #[serde(rename = "piid", default, skip_serializing_if = "String::is_empty")]
    pub protocol_independent_id: String,
    #[serde(rename = "dmv", default, skip_serializing_if = "String::is_empty")]
    pub data_model_version: String,
}
