// ── Provisioning status (`/oic/sec/pstat`) ──

use serde::{Deserialize, Serialize};

pub const PSTAT_HREF: &str = "/oic/sec/pstat";
pub const PSTAT_RESOURCE_TYPE: &str = "oic.r.pstat";

/// Device onboarding state (`dos.s`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, strum::Display)]
#[serde(try_from = "u8", into = "u8")]
#[strum(serialize_all = "UPPERCASE")]
pub enum OperationalState {
    /// Ready for ownership transfer.
    #[default]
    Reset,
    /// Ready for OTM.
    Rfotm,
    /// Ready for provisioning.
    Rfpro,
    /// Ready for normal operation.
    Rfnop,
    /// Soft reset.
    Srest,
}

impl From<OperationalState> for u8 {
    fn from(state: OperationalState) -> Self {
        match state {
            OperationalState::Reset => 0,
            OperationalState::Rfotm => 1,
            OperationalState::Rfpro => 2,
            OperationalState::Rfnop => 3,
            OperationalState::Srest => 4,
        }
    }
}

impl TryFrom<u8> for OperationalState {
    type Error = String;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Reset),
            1 => Ok(Self::Rfotm),
            2 => Ok(Self::Rfpro),
            3 => Ok(Self::Rfnop),
            4 => Ok(Self::Srest),
            other => Err(format!("unknown device onboarding state {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOnboardingState {
    #[serde(rename = "s")]
    pub state: OperationalState,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pstat {
    #[serde(rename = "dos", default)]
    pub onboarding: DeviceOnboardingState,
    #[serde(rename = "isop", default)]
    pub is_operational: bool,
    #[serde(rename = "rowneruuid", default)]
    pub resource_owner_id: String,
}

/// Partial pstat write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PstatUpdate {
    #[serde(rename = "dos", default, skip_serializing_if = "Option::is_none")]
    pub onboarding: Option<DeviceOnboardingState>,
    #[serde(rename = "rowneruuid", default, skip_serializing_if = "Option::is_none")]
    pub resource_owner_id: Option<String>,
}

impl PstatUpdate {
    pub fn state(state: OperationalState) -> Self {
        Self {
            onboarding: Some(DeviceOnboardingState {
                state,
                pending: None,
            }),
            resource_owner_id: None,
        }
    }

    pub fn resource_owner(owner_id: impl Into<String>) -> Self {
        Self {
            onboarding: None,
            resource_owner_id: Some(owner_id.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn reset_update_is_dos_zero() {
        let v = serde_json::to_value(PstatUpdate::state(OperationalState::Reset)).unwrap();
        assert_eq!(v, serde_json::json!({ "dos": { "s": 0 } }));
    }

    #[test]
    fn rejects_unknown_state() {
        let r: Result<Pstat, _> = serde_json::from_value(serde_json::json!({ "dos": { "s": 9 } }));
        assert!(r.is_err());
        let p: Pstat = serde_json::from_value(serde_json::json!({
            "dos": { "s": 3, "p": false }, "isop": true
        }))
        .unwrap();
        assert_eq!(p.onboarding.state, OperationalState::Rfnop);
        assert_eq!(p.onboarding.state.to_string(), "RFNOP");
    }
}
