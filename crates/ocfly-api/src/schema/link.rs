// ── Resource links ──
//
// Discovery payload types: `/oic/res` answers with an array of
// `DeviceLinks`, each carrying the device id and its resource links.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use crate::addr::{Addr, Scheme};
use crate::error::Error;

/// Href of the device descriptor resource.
pub const DEVICE_HREF: &str = "/oic/d";

/// Prefix of an OCF anchor (`ocf://<device id>`).
const ANCHOR_PREFIX: &str = "ocf://";

// ── Endpoint ────────────────────────────────────────────────────────

/// A transport endpoint advertised for a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "ep")]
    pub uri: String,
    #[serde(rename = "pri", default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u64>,
}

impl Endpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            priority: None,
        }
    }

    pub fn addr(&self) -> Result<Addr, Error> {
        Addr::parse(&self.uri)
    }
}

impl From<&Addr> for Endpoint {
    fn from(addr: &Addr) -> Self {
        Self::new(addr.to_string())
    }
}

// ── Policy ──────────────────────────────────────────────────────────

/// Link policy (`p`): discoverability/observability bitmask and whether
/// the resource is only reachable over a secured endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(rename = "bm", default)]
    pub bit_mask: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sec: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

// ── ResourceLink ────────────────────────────────────────────────────

/// A single addressable resource on a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLink {
    pub href: String,
    #[serde(rename = "rt", default)]
    pub resource_types: Vec<String>,
    #[serde(rename = "if", default)]
    pub interfaces: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub anchor: String,
    #[serde(rename = "di", default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,
    #[serde(rename = "eps", default)]
    pub endpoints: Vec<Endpoint>,
}

impl ResourceLink {
    /// Device id from `di`, falling back to the `ocf://` anchor.
    pub fn device_id(&self) -> Option<&str> {
        if !self.device_id.is_empty() {
            return Some(&self.device_id);
        }
        self.anchor
            .strip_prefix(ANCHOR_PREFIX)
            .map(|id| id.trim_end_matches('/'))
            .filter(|id| !id.is_empty())
    }

    pub fn has_resource_type(&self, resource_type: &str) -> bool {
        self.resource_types.iter().any(|rt| rt == resource_type)
    }

    /// Parsed endpoint addresses, skipping any that fail to parse.
    pub fn addrs(&self) -> Vec<Addr> {
        self.endpoints.iter().filter_map(|ep| ep.addr().ok()).collect()
    }

    /// Every endpoint ordered by transport preference (secured first).
    pub fn preferred_addrs(&self) -> Vec<Addr> {
        let mut addrs = self.addrs();
        addrs.sort_by_key(|a| a.scheme().preference());
        addrs
    }

    /// Rewrite every endpoint's host with the host actually observed on
    /// the connection the link was retrieved over. Scheme and port are
    /// kept. A link with no endpoints gets exactly the observed address.
    pub fn patch_endpoint(&self, observed: &Addr) -> Self {
        let endpoints = if self.endpoints.is_empty() {
            vec![Endpoint::from(observed)]
        } else {
            self.endpoints
                .iter()
                .map(|ep| match ep.addr() {
                    Ok(addr) => Endpoint {
                        uri: addr.with_host_of(observed).to_string(),
                        priority: ep.priority,
                    },
                    Err(_) => ep.clone(),
                })
                .collect()
        };
        Self {
            endpoints,
            ..self.clone()
        }
    }

    /// Keep only secured (`coaps`, `coaps+tcp`) endpoints.
    pub fn filter_secure_endpoints(&self) -> Self {
        self.filter_endpoints(Scheme::is_secure)
    }

    /// Keep only unsecured endpoints.
    pub fn filter_unsecure_endpoints(&self) -> Self {
        self.filter_endpoints(|s| !s.is_secure())
    }

    fn filter_endpoints(&self, keep: impl Fn(Scheme) -> bool) -> Self {
        let endpoints = self
            .endpoints
            .iter()
            .filter(|ep| ep.addr().is_ok_and(|a| keep(a.scheme())))
            .cloned()
            .collect();
        Self {
            endpoints,
            ..self.clone()
        }
    }
}

// ── ResourceLinks ───────────────────────────────────────────────────

/// The ordered link set of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceLinks(pub Vec<ResourceLink>);

impl ResourceLinks {
    pub fn get(&self, href: &str) -> Option<&ResourceLink> {
        self.0.iter().find(|l| l.href == href)
    }

    /// Like [`get`](Self::get) but an error naming the href on a miss.
    pub fn require(&self, href: &str) -> Result<&ResourceLink, Error> {
        self.get(href).ok_or_else(|| Error::NoEndpoint {
            href: href.to_owned(),
        })
    }

    /// The device descriptor link (`/oic/d`).
    pub fn device_link(&self) -> Option<&ResourceLink> {
        self.get(DEVICE_HREF)
    }

    pub fn patch_endpoint(&self, observed: &Addr) -> Self {
        Self(self.0.iter().map(|l| l.patch_endpoint(observed)).collect())
    }
}

impl Deref for ResourceLinks {
    type Target = Vec<ResourceLink>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ResourceLinks {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<ResourceLink>> for ResourceLinks {
    fn from(links: Vec<ResourceLink>) -> Self {
        Self(links)
    }
}

impl IntoIterator for ResourceLinks {
    type Item = ResourceLink;
    type IntoIter = std::vec::IntoIter<ResourceLink>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ── DeviceLinks ─────────────────────────────────────────────────────

/// One device's entry in a discovery response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLinks {
    #[serde(rename = "di", default)]
    pub device_id: String,
    #[serde(default)]
    pub links: ResourceLinks,
}

impl DeviceLinks {
    /// Device id from `di`, falling back to the descriptor link.
    pub fn device_id(&self) -> Option<&str> {
        if !self.device_id.is_empty() {
            return Some(&self.device_id);
        }
        self.links.device_link().and_then(ResourceLink::device_id)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn link(href: &str, eps: &[&str]) -> ResourceLink {
        ResourceLink {
            href: href.into(),
            resource_types: vec!["oic.wk.d".into()],
            endpoints: eps.iter().map(|e| Endpoint::new(*e)).collect(),
            ..ResourceLink::default()
        }
    }

    #[test]
    fn device_id_falls_back_to_anchor() {
        let mut l = link(DEVICE_HREF, &[]);
        l.anchor = "ocf://2b3f3b9e-5f1d-4c1e-8c1c-1f1b1f1b1f1b".into();
        assert_eq!(l.device_id(), Some("2b3f3b9e-5f1d-4c1e-8c1c-1f1b1f1b1f1b"));

        l.device_id = "explicit".into();
        assert_eq!(l.device_id(), Some("explicit"));
    }

    #[test]
    fn patch_rewrites_hosts_and_keeps_ports() {
        let l = link(
            "/light/1",
            &["coap://[fe80::1]:5683", "coaps+tcp://[fe80::1]:41000"],
        );
        let observed = Addr::parse("coap://192.168.0.10:5683").unwrap();
        let patched = l.patch_endpoint(&observed);
        let uris: Vec<_> = patched.endpoints.iter().map(|e| e.uri.as_str()).collect();
        assert_eq!(
            uris,
            vec!["coap://192.168.0.10:5683", "coaps+tcp://192.168.0.10:41000"]
        );
    }

    #[test]
    fn patch_without_endpoints_uses_observed_address() {
        let observed = Addr::parse("coap://192.168.0.10:5683").unwrap();
        let patched = link("/oic/d", &[]).patch_endpoint(&observed);
        assert_eq!(patched.endpoints, vec![Endpoint::new("coap://192.168.0.10:5683")]);
    }

    #[test]
    fn filter_secure_endpoints_drops_plain_coap() {
        let l = link(
            "/oic/sec/pstat",
            &[
                "coap://10.0.0.2:5683",
                "coaps://10.0.0.2:5684",
                "coap+tcp://10.0.0.2:6000",
                "coaps+tcp://10.0.0.2:6001",
            ],
        );
        let secure = l.filter_secure_endpoints();
        assert!(secure.addrs().iter().all(Addr::is_secure));
        assert_eq!(secure.endpoints.len(), 2);
        assert_eq!(l.filter_unsecure_endpoints().endpoints.len(), 2);
    }

    #[test]
    fn preferred_addrs_puts_tls_first() {
        let l = link("/x", &["coap://10.0.0.2:5683", "coaps+tcp://10.0.0.2:6001"]);
        assert_eq!(l.preferred_addrs()[0].scheme(), Scheme::TcpSecure);
    }

    #[test]
    fn device_links_deserialize_from_ocf_json() {
        let json = serde_json::json!([{
            "di": "2b3f3b9e-5f1d-4c1e-8c1c-1f1b1f1b1f1b",
            "links": [{
                "href": "/oic/d",
                "rt": ["oic.wk.d", "oic.d.light"],
                "if": ["oic.if.r", "oic.if.baseline"],
                "anchor": "ocf://2b3f3b9e-5f1d-4c1e-8c1c-1f1b1f1b1f1b",
                "p": { "bm": 3 },
                "eps": [{ "ep": "coap://[fe80::1]:5683", "pri": 1 }]
            }]
        }]);
        let parsed: Vec<DeviceLinks> = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.len(), 1);
        let device = &parsed[0];
        assert_eq!(device.device_id(), Some("2b3f3b9e-5f1d-4c1e-8c1c-1f1b1f1b1f1b"));
        let d = device.links.device_link().unwrap();
        assert!(d.has_resource_type("oic.d.light"));
        assert_eq!(d.policy.as_ref().unwrap().bit_mask, 3);
        assert_eq!(d.endpoints[0].priority, Some(1));
    }
}
