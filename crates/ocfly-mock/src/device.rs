//! A simulated OCF device: resources held as JSON values, the security
//! resources of the ownership protocol, and a log of every request.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use ocfly_api::schema::{
    BASELINE_INTERFACE, CRED_HREF, CSR_HREF, DEVICE_HREF, DEVICE_RESOURCE_TYPE, DISCOVERY_HREF,
    DOXM_HREF, DOXM_RESOURCE_TYPE, DeviceLinks, Endpoint, PSTAT_HREF, PSTAT_RESOURCE_TYPE,
    ResourceLink, ResourceLinks, USAGE_CERT,
};
use ocfly_api::{
    Addr, CborCodec, Codec, ContentFormat, Error, JsonCodec, Method, Request, Response,
    ResponseCode, Scheme, SessionEnd,
};
use rustls_pki_types::CertificateDer;
use rustls_pki_types::pem::PemObject;
use serde_json::{Value, json};

use crate::connection::MockConnection;

const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One resource hosted by a [`MockDevice`].
#[derive(Debug, Clone)]
pub struct MockResource {
    pub resource_types: Vec<String>,
    pub value: Value,
    /// Reachable only over a secured session.
    pub secure_only: bool,
}

/// A request as the device received it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub href: String,
    pub queries: Vec<String>,
    pub secure: bool,
    /// Decoded body; `Null` for empty or non-structured payloads.
    pub body: Value,
}

struct DeviceState {
    resources: BTreeMap<String, MockResource>,
    requests: Vec<RecordedRequest>,
    identity_chain: Option<Vec<CertificateDer<'static>>>,
    connections: Vec<Weak<MockConnection>>,
    failures: u32,
}

struct DeviceInner {
    id: String,
    host: String,
    endpoints: Vec<Addr>,
    manufacturer_chain: Option<Vec<CertificateDer<'static>>>,
    delay: Duration,
    reset_closes_session: bool,
    reachable: AtomicBool,
    state: Mutex<DeviceState>,
}

/// Cheaply cloneable handle to a simulated device.
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<DeviceInner>,
}

impl MockDevice {
    pub fn builder(id: impl Into<String>) -> MockDeviceBuilder {
        MockDeviceBuilder::new(id.into())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn endpoints(&self) -> &[Addr] {
        &self.inner.endpoints
    }

    /// Address multicast answers come from.
    pub fn unicast_addr(&self) -> Addr {
        self.endpoint(Scheme::Udp)
            .unwrap_or_else(|| Addr::new(Scheme::Udp, self.inner.host.clone(), 5683))
    }

    pub fn endpoint(&self, scheme: Scheme) -> Option<Addr> {
        self.inner
            .endpoints
            .iter()
            .find(|a| a.scheme() == scheme)
            .cloned()
    }

    pub(crate) fn delay(&self) -> Duration {
        self.inner.delay
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    /// Take the device off the network (or bring it back).
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Answer the next `count` unicast requests with 5.03.
    pub fn fail_next(&self, count: u32) {
        lock(&self.inner.state).failures = count;
    }

    pub fn resource(&self, href: &str) -> Option<Value> {
        lock(&self.inner.state)
            .resources
            .get(href)
            .map(|r| r.value.clone())
    }

    pub fn set_resource(&self, href: impl Into<String>, resource: MockResource) {
        lock(&self.inner.state)
            .resources
            .insert(href.into(), resource);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.inner.state).requests.clone()
    }

    /// Requests that wrote to `href`.
    pub fn writes_to(&self, href: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.href == href && matches!(r.method, Method::Post | Method::Put))
            .collect()
    }

    pub fn clear_requests(&self) {
        lock(&self.inner.state).requests.clear();
    }

    /// Number of sessions currently open to the device.
    pub fn open_sessions(&self) -> usize {
        lock(&self.inner.state)
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.ended())
            .count()
    }

    /// Reset every open session from the device side.
    pub fn drop_sessions(&self) {
        let connections: Vec<_> = lock(&self.inner.state)
            .connections
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        for conn in connections {
            conn.end(SessionEnd::Reset);
        }
    }

    pub(crate) fn register(&self, conn: &Arc<MockConnection>) {
        let mut state = lock(&self.inner.state);
        state.connections.retain(|c| c.strong_count() > 0);
        state.connections.push(Arc::downgrade(conn));
    }

    pub(crate) fn manufacturer_chain(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.inner.manufacturer_chain.clone()
    }

    pub(crate) fn identity_chain(&self) -> Option<Vec<CertificateDer<'static>>> {
        lock(&self.inner.state).identity_chain.clone()
    }

    // ── Discovery ────────────────────────────────────────────────

    pub fn links(&self) -> ResourceLinks {
        let state = lock(&self.inner.state);
        state
            .resources
            .iter()
            .map(|(href, resource)| ResourceLink {
                href: href.clone(),
                resource_types: resource.resource_types.clone(),
                interfaces: vec![BASELINE_INTERFACE.to_owned()],
                anchor: format!("ocf://{}", self.inner.id),
                endpoints: self
                    .inner
                    .endpoints
                    .iter()
                    .filter(|a| a.is_secure() || !resource.secure_only)
                    .map(Endpoint::from)
                    .collect(),
                ..ResourceLink::default()
            })
            .collect::<Vec<_>>()
            .into()
    }

    /// The `/oic/res` answer of this device.
    pub fn discovery_response(&self, accept: Option<ContentFormat>) -> Response {
        let payload = vec![DeviceLinks {
            device_id: self.inner.id.clone(),
            links: self.links(),
        }];
        encode_response(ResponseCode::Content, accept, &payload)
    }

    // ── Request handling ─────────────────────────────────────────

    pub(crate) fn handle(&self, secure: bool, request: &Request) -> Result<Response, Error> {
        let mut state = lock(&self.inner.state);
        state.requests.push(RecordedRequest {
            method: request.method,
            href: request.href.clone(),
            queries: request.queries.clone(),
            secure,
            body: decode_body(request),
        });

        if state.failures > 0 {
            state.failures -= 1;
            return Ok(Response::new(ResponseCode::ServiceUnavailable));
        }
        if request.href == DISCOVERY_HREF {
            drop(state);
            return Ok(self.discovery_response(request.accept));
        }

        let Some(resource) = state.resources.get_mut(&request.href) else {
            return Ok(Response::new(ResponseCode::NotFound));
        };
        if resource.secure_only && !secure {
            return Ok(Response::new(ResponseCode::Forbidden));
        }

        match request.method {
            Method::Get => Ok(encode_response(
                ResponseCode::Content,
                request.accept,
                &resource.value,
            )),
            Method::Delete => {
                state.resources.remove(&request.href);
                Ok(Response::new(ResponseCode::Deleted))
            }
            Method::Post | Method::Put => {
                let Some(patch) = structured_body(request) else {
                    // Opaque payload: echo it back untouched.
                    let format = request
                        .content_format
                        .unwrap_or(ContentFormat::APP_OCTET_STREAM);
                    return Ok(Response::new(ResponseCode::Changed)
                        .with_body(format, request.body.clone()));
                };
                merge(&mut resource.value, patch.clone());
                self.apply_side_effects(state, &request.href, &patch)
            }
        }
    }

    fn apply_side_effects(
        &self,
        mut state: MutexGuard<'_, DeviceState>,
        href: &str,
        patch: &Value,
    ) -> Result<Response, Error> {
        match href {
            PSTAT_HREF if patch.pointer("/dos/s") == Some(&json!(0)) => {
                reset(&mut state);
                drop(state);
                tracing::debug!(device_id = %self.inner.id, "mock device reset");
                if self.inner.reset_closes_session {
                    self.drop_sessions();
                    return Err(Error::ConnectionClosed {
                        reason: "device reset".into(),
                    });
                }
                Ok(Response::new(ResponseCode::Changed))
            }
            CRED_HREF => {
                if let Some(chain) = installed_identity(patch) {
                    state.identity_chain = Some(chain);
                }
                Ok(Response::new(ResponseCode::Changed))
            }
            _ => Ok(Response::new(ResponseCode::Changed)),
        }
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockDevice")
            .field("id", &self.inner.id)
            .field("host", &self.inner.host)
            .finish_non_exhaustive()
    }
}

// ── Builder ──────────────────────────────────────────────────────

pub struct MockDeviceBuilder {
    id: String,
    name: String,
    host: String,
    resource_types: Vec<String>,
    resources: BTreeMap<String, MockResource>,
    owner: Option<String>,
    identity_chain: Option<Vec<CertificateDer<'static>>>,
    manufacturer_chain: Option<Vec<CertificateDer<'static>>>,
    delay: Duration,
    reset_closes_session: bool,
    secure: bool,
}

impl MockDeviceBuilder {
    fn new(id: String) -> Self {
        Self {
            id,
            name: "mock device".into(),
            host: "10.0.0.1".into(),
            resource_types: vec![DEVICE_RESOURCE_TYPE.to_owned()],
            resources: BTreeMap::new(),
            owner: None,
            identity_chain: None,
            manufacturer_chain: None,
            delay: Duration::ZERO,
            reset_closes_session: true,
            secure: true,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Extra resource type on `/oic/d` besides `oic.wk.d`.
    pub fn resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_types.push(resource_type.into());
        self
    }

    /// Descriptor resource types replacing the defaults.
    pub fn resource_types(mut self, resource_types: Vec<String>) -> Self {
        self.resource_types = resource_types;
        self
    }

    pub fn resource(mut self, href: impl Into<String>, resource_type: &str, value: Value) -> Self {
        self.resources.insert(
            href.into(),
            MockResource {
                resource_types: vec![resource_type.to_owned()],
                value,
                secure_only: false,
            },
        );
        self
    }

    /// Mark the device owned by `owner` (`devowneruuid`).
    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Chain presented to identity-verified secured sessions.
    pub fn identity_chain(mut self, chain: Vec<CertificateDer<'static>>) -> Self {
        self.identity_chain = Some(chain);
        self
    }

    /// Chain presented during ownership transfer.
    pub fn manufacturer_chain(mut self, chain: Vec<CertificateDer<'static>>) -> Self {
        self.manufacturer_chain = Some(chain);
        self
    }

    /// Delay applied before every answer.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Whether a RESET write tears down the session (default `true`).
    pub fn reset_closes_session(mut self, closes: bool) -> Self {
        self.reset_closes_session = closes;
        self
    }

    /// Advertise only unsecured endpoints.
    pub fn unsecured(mut self) -> Self {
        self.secure = false;
        self
    }

    pub fn build(self) -> MockDevice {
        let mut endpoints = vec![Addr::new(Scheme::Udp, self.host.clone(), 5683)];
        if self.secure {
            endpoints.push(Addr::new(Scheme::UdpSecure, self.host.clone(), 5684));
        }

        let mut resources = self.resources;
        let owned = self.owner.is_some();
        let owner = self.owner.unwrap_or_else(|| NIL_UUID.to_owned());
        let builtin = [
            (
                DEVICE_HREF,
                self.resource_types.clone(),
                json!({"di": self.id, "n": self.name, "rt": self.resource_types}),
                false,
            ),
            (
                DOXM_HREF,
                vec![DOXM_RESOURCE_TYPE.to_owned()],
                json!({
                    "oxms": [0, 2],
                    "oxmsel": 0,
                    "sct": 9,
                    "owned": owned,
                    "deviceuuid": self.id,
                    "devowneruuid": owner,
                    "rowneruuid": owner,
                }),
                false,
            ),
            (
                PSTAT_HREF,
                vec![PSTAT_RESOURCE_TYPE.to_owned()],
                json!({
                    "dos": {"s": if owned { 3 } else { 1 }},
                    "isop": owned,
                    "rowneruuid": owner,
                }),
                true,
            ),
            (
                CSR_HREF,
                vec!["oic.r.csr".to_owned()],
                json!({
                    "csr": format!("-----BEGIN CERTIFICATE REQUEST-----\nuuid:{}\n-----END CERTIFICATE REQUEST-----\n", self.id),
                    "encoding": "oic.sec.encoding.pem",
                }),
                true,
            ),
            (
                CRED_HREF,
                vec!["oic.r.cred".to_owned()],
                json!({"creds": [], "rowneruuid": owner}),
                true,
            ),
        ];
        for (href, resource_types, value, secure_only) in builtin {
            resources.entry(href.to_owned()).or_insert(MockResource {
                resource_types,
                value,
                secure_only,
            });
        }

        MockDevice {
            inner: Arc::new(DeviceInner {
                id: self.id,
                host: self.host,
                endpoints,
                manufacturer_chain: self.manufacturer_chain,
                delay: self.delay,
                reset_closes_session: self.reset_closes_session,
                reachable: AtomicBool::new(true),
                state: Mutex::new(DeviceState {
                    resources,
                    requests: Vec::new(),
                    identity_chain: self.identity_chain,
                    connections: Vec::new(),
                    failures: 0,
                }),
            }),
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn encode_response<T: serde::Serialize + ?Sized>(
    code: ResponseCode,
    accept: Option<ContentFormat>,
    value: &T,
) -> Response {
    let encoded = match accept {
        Some(ContentFormat::APP_JSON) => JsonCodec
            .encode(value)
            .map(|body| (ContentFormat::APP_JSON, body)),
        _ => CborCodec
            .encode(value)
            .map(|body| (ContentFormat::APP_OCF_CBOR, body)),
    };
    match encoded {
        Ok((format, body)) => Response::new(code).with_body(format, body),
        Err(e) => {
            tracing::warn!(error = %e, "mock device cannot encode response");
            Response::new(ResponseCode::InternalServerError)
        }
    }
}

/// Body as JSON when it is a structured (CBOR/JSON) payload.
fn structured_body(request: &Request) -> Option<Value> {
    match request.content_format {
        Some(ContentFormat::APP_JSON) => JsonCodec.decode(request.content_format, &request.body).ok(),
        Some(ContentFormat::APP_CBOR | ContentFormat::APP_OCF_CBOR) => {
            CborCodec.decode(request.content_format, &request.body).ok()
        }
        _ => None,
    }
}

fn decode_body(request: &Request) -> Value {
    structured_body(request).unwrap_or(Value::Null)
}

/// Recursive object merge; non-object values replace.
fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                merge(target.entry(key).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Back to ready-for-ownership-transfer.
fn reset(state: &mut DeviceState) {
    let unowned = json!({
        "owned": false,
        "oxmsel": 0,
        "devowneruuid": NIL_UUID,
        "rowneruuid": NIL_UUID,
    });
    if let Some(doxm) = state.resources.get_mut(DOXM_HREF) {
        merge(&mut doxm.value, unowned);
    }
    if let Some(pstat) = state.resources.get_mut(PSTAT_HREF) {
        merge(
            &mut pstat.value,
            json!({"dos": {"s": 1}, "isop": false, "rowneruuid": NIL_UUID}),
        );
    }
    if let Some(cred) = state.resources.get_mut(CRED_HREF) {
        cred.value = json!({"creds": [], "rowneruuid": NIL_UUID});
    }
    state.identity_chain = None;
}

/// Identity chain carried by a cred write, if any.
fn installed_identity(patch: &Value) -> Option<Vec<CertificateDer<'static>>> {
    let pem = patch
        .get("creds")?
        .as_array()?
        .iter()
        .find(|c| c.get("credusage").and_then(Value::as_str) == Some(USAGE_CERT))?
        .pointer("/publicdata/data")?
        .as_str()?;
    let chain = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    (!chain.is_empty()).then_some(chain)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ID: &str = "5e9a0c1d-2222-4000-8000-00000000000a";

    fn post(href: &str, body: &Value) -> Request {
        Request::post(href).with_body(ContentFormat::APP_OCF_CBOR, CborCodec.encode(body).unwrap())
    }

    #[test]
    fn get_returns_cbor_by_default() {
        let device = MockDevice::builder(ID)
            .resource("/light/1", "oic.r.switch.binary", json!({"value": true}))
            .build();
        let response = device.handle(false, &Request::get("/light/1")).unwrap();
        assert_eq!(response.code, ResponseCode::Content);
        let value: Value = CborCodec.decode(response.content_format, &response.body).unwrap();
        assert_eq!(value, json!({"value": true}));
    }

    #[test]
    fn security_resources_need_secure_session() {
        let device = MockDevice::builder(ID).build();
        let response = device.handle(false, &Request::get(PSTAT_HREF)).unwrap();
        assert_eq!(response.code, ResponseCode::Forbidden);
        let response = device.handle(true, &Request::get(PSTAT_HREF)).unwrap();
        assert_eq!(response.code, ResponseCode::Content);
    }

    #[test]
    fn writes_merge_nested_objects() {
        let device = MockDevice::builder(ID).build();
        device
            .handle(true, &post(PSTAT_HREF, &json!({"dos": {"s": 3}})))
            .unwrap();
        let pstat = device.resource(PSTAT_HREF).unwrap();
        assert_eq!(pstat["dos"]["s"], 3);
        assert_eq!(pstat["rowneruuid"], NIL_UUID);
    }

    #[test]
    fn reset_clears_ownership_and_closes_session() {
        let device = MockDevice::builder(ID).owned_by("11111111-1111-4111-8111-111111111111").build();
        let err = device
            .handle(true, &post(PSTAT_HREF, &json!({"dos": {"s": 0}})))
            .unwrap_err();
        assert!(err.is_connection_closed());
        let doxm = device.resource(DOXM_HREF).unwrap();
        assert_eq!(doxm["owned"], false);
        assert_eq!(doxm["devowneruuid"], NIL_UUID);
    }

    #[test]
    fn opaque_payload_is_echoed() {
        let device = MockDevice::builder(ID)
            .resource("/blob", "x.blob", json!({}))
            .build();
        let request = Request::post("/blob").with_body(ContentFormat::APP_OCTET_STREAM, vec![1, 2, 3]);
        let response = device.handle(false, &request).unwrap();
        assert_eq!(response.body, vec![1, 2, 3]);
        assert_eq!(response.content_format, Some(ContentFormat::APP_OCTET_STREAM));
    }

    #[test]
    fn links_hide_unsecured_endpoints_of_secure_resources() {
        let device = MockDevice::builder(ID).build();
        let links = device.links();
        let pstat = links.get(PSTAT_HREF).unwrap();
        assert!(pstat.addrs().iter().all(Addr::is_secure));
        let doxm = links.get(DOXM_HREF).unwrap();
        assert_eq!(doxm.addrs().len(), 2);
    }
}
