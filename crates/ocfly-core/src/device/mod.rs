// ── Device handle ──
//
// A discovered device: its identity, the connections currently open to
// it, and the operations that run over them. Every exchange is wrapped by
// the retry orchestrator and bounded by the per-attempt timeout.

mod ownership;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ocfly_api::schema::{DISCOVERY_HREF, DeviceLinks, ResourceLink, ResourceLinks};
use ocfly_api::{
    Addr, CborCodec, Codec, Connection, ContentFormat, Dialer, Method, PeerVerification, Pool,
    Request, Response,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::IdentityConfig;
use crate::context::Context;
use crate::error::{CoreError, ErrorSink};
use crate::retry::{RetryFactory, operation_with_retries};

pub use ownership::{
    IdentityCertificateSigner, ManufacturerCertificate, OwnershipPhase, OwnershipTransferMethod,
};

// ── Shared settings ──────────────────────────────────────────────

/// Everything a device needs from its client, shared by all devices.
#[derive(Clone)]
pub(crate) struct DeviceSettings {
    pub dialer: Arc<dyn Dialer>,
    pub operation_timeout: Duration,
    pub retry: RetryFactory,
    pub error_sink: ErrorSink,
    pub identity: Option<IdentityConfig>,
    pub discovery_endpoints: Arc<[Addr]>,
    pub discovery_channel_capacity: usize,
}

impl DeviceSettings {
    pub fn identity(&self) -> Result<&IdentityConfig, CoreError> {
        self.identity.as_ref().ok_or_else(|| CoreError::Config {
            message: "no client identity configured for secured sessions".into(),
        })
    }
}

// ── Device ───────────────────────────────────────────────────────

/// A device found by discovery or lookup.
///
/// Owns its connections: call [`close`](Self::close) when done to release
/// them. Never holds two connections to the same endpoint.
pub struct Device {
    id: String,
    resource_types: Vec<String>,
    settings: DeviceSettings,
    connections: Pool,
    phase: watch::Sender<OwnershipPhase>,
}

impl Device {
    pub(crate) fn new(settings: DeviceSettings, id: String, resource_types: Vec<String>) -> Self {
        Self::with_pool(settings, id, resource_types, Pool::new())
    }

    /// A handle whose connections live in `connections`, possibly shared
    /// with other handles.
    pub(crate) fn with_pool(
        settings: DeviceSettings,
        id: String,
        resource_types: Vec<String>,
        connections: Pool,
    ) -> Self {
        let (phase, _) = watch::channel(OwnershipPhase::Unowned);
        Self {
            id,
            resource_types,
            settings,
            connections,
            phase,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource_types(&self) -> &[String] {
        &self.resource_types
    }

    pub fn phase(&self) -> OwnershipPhase {
        *self.phase.borrow()
    }

    /// Follow ownership phase changes.
    pub fn watch_phase(&self) -> watch::Receiver<OwnershipPhase> {
        self.phase.subscribe()
    }

    /// Number of open connections to this device.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close every connection held for this device.
    pub async fn close(&self) {
        self.connections.close_all().await;
        tracing::debug!(device_id = %self.id, "device closed");
    }

    pub(crate) fn set_phase(&self, phase: OwnershipPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            tracing::debug!(device_id = %self.id, from = %previous, to = %phase, "ownership phase");
        }
    }

    pub(crate) fn require_link<'a>(
        &self,
        links: &'a ResourceLinks,
        href: &str,
    ) -> Result<&'a ResourceLink, CoreError> {
        links.get(href).ok_or_else(|| CoreError::ResourceNotFound {
            device_id: self.id.clone(),
            href: href.to_owned(),
        })
    }

    // ── Resource operations ──────────────────────────────────────

    pub async fn get_resource<T, C>(
        &self,
        ctx: &Context,
        link: &ResourceLink,
        codec: &C,
        queries: &[String],
    ) -> Result<T, CoreError>
    where
        T: DeserializeOwned,
        C: Codec,
    {
        let request = Request::get(&link.href)
            .with_queries(queries.iter().cloned())
            .with_accept(codec.content_format());
        let response = self
            .exchange(ctx, &self.settings.retry, "get", link, request)
            .await?;
        self.decode(codec, "get", &link.href, &response)
    }

    /// POST `body` to the resource; the response body is decoded into `R`
    /// (use `()` to ignore it).
    pub async fn update_resource<B, R, C>(
        &self,
        ctx: &Context,
        link: &ResourceLink,
        codec: &C,
        body: &B,
        queries: &[String],
    ) -> Result<R, CoreError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
        C: Codec,
    {
        let request = encode_request(Method::Post, &link.href, codec, body)?
            .with_queries(queries.iter().cloned());
        let response = self
            .exchange(ctx, &self.settings.retry, "update", link, request)
            .await?;
        self.decode(codec, "update", &link.href, &response)
    }

    pub async fn delete_resource<R, C>(
        &self,
        ctx: &Context,
        link: &ResourceLink,
        codec: &C,
        queries: &[String],
    ) -> Result<R, CoreError>
    where
        R: DeserializeOwned,
        C: Codec,
    {
        let request = Request::delete(&link.href)
            .with_queries(queries.iter().cloned())
            .with_accept(codec.content_format());
        let response = self
            .exchange(ctx, &self.settings.retry, "delete", link, request)
            .await?;
        self.decode(codec, "delete", &link.href, &response)
    }

    /// The device's current resource links, patched with the address they
    /// were fetched from.
    ///
    /// Uses the best open connection (secured preferred); without one,
    /// falls back to a single-device discovery run.
    pub async fn get_resource_links(&self, ctx: &Context) -> Result<ResourceLinks, CoreError> {
        let Some(best) = self.find_best_connection() else {
            return crate::discovery::find_device_links(ctx, &self.settings, &self.id).await;
        };
        let addr = best.remote_addr().clone();
        let addr = &addr;
        let id = self.id.as_str();
        let request = Request::get(DISCOVERY_HREF).with_accept(ContentFormat::APP_OCF_CBOR);

        let response = operation_with_retries(
            ctx,
            &self.settings.retry,
            self.settings.operation_timeout,
            |_attempt| {
                let request = request.clone();
                async move {
                    let conn = match self.connections.get(addr) {
                        Some(conn) => conn,
                        None => self.dial(addr).await?,
                    };
                    conn.exchange(request)
                        .await
                        .and_then(|r| r.into_result(DISCOVERY_HREF))
                        .map_err(|e| CoreError::resource("get", id, DISCOVERY_HREF, e))
                }
            },
        )
        .await?;

        let devices: Vec<DeviceLinks> = self.decode(&CborCodec, "get", DISCOVERY_HREF, &response)?;
        let links = select_device_links(id, devices)?;
        Ok(links.patch_endpoint(addr))
    }

    // ── Connections ──────────────────────────────────────────────

    /// Open connection with the most preferred scheme (secured first).
    fn find_best_connection(&self) -> Option<Arc<dyn Connection>> {
        self.connections
            .connections()
            .into_iter()
            .filter(|c| !c.is_closed())
            .min_by_key(|c| c.remote_addr().scheme().preference())
    }

    /// Reuse a connection to one of the link's endpoints or dial them in
    /// preference order.
    async fn connect(
        &self,
        ctx: &Context,
        link: &ResourceLink,
    ) -> Result<Arc<dyn Connection>, CoreError> {
        let addrs = link.preferred_addrs();
        if let Some(conn) = addrs.iter().find_map(|a| self.connections.get(a)) {
            return Ok(conn);
        }

        let mut last = None;
        for addr in addrs {
            if addr.is_secure() && self.settings.identity.is_none() {
                continue;
            }
            match ctx.run(self.dial(&addr)).await {
                Ok(conn) => return Ok(conn),
                Err(e) if ctx.is_done() => return Err(e),
                Err(e) => {
                    tracing::debug!(device_id = %self.id, %addr, error = %e, "endpoint unreachable");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            CoreError::resource(
                "connect",
                &self.id,
                &link.href,
                ocfly_api::Error::NoEndpoint {
                    href: link.href.clone(),
                },
            )
        }))
    }

    async fn dial(&self, addr: &Addr) -> Result<Arc<dyn Connection>, CoreError> {
        let dialer = self.settings.dialer.as_ref();
        let conn = if addr.is_secure() {
            let identity = self.settings.identity()?;
            let verification = PeerVerification::Identity {
                trust_anchors: identity.trust_anchors.clone(),
                expected_device_id: Uuid::parse_str(&self.id).ok(),
            };
            let tls = Arc::clone(&identity.tls);
            self.connections
                .get_or_connect(addr, || dialer.dial_secure(addr, tls, verification))
                .await
        } else {
            self.connections.get_or_dial(addr, dialer).await
        };
        conn.map_err(|e| CoreError::resource("dial", &self.id, &addr.to_string(), e))
    }

    // ── Exchanges ────────────────────────────────────────────────

    /// One request/response over the best connection for `link`.
    async fn exchange_attempt(
        &self,
        ctx: &Context,
        operation: &'static str,
        link: &ResourceLink,
        request: Request,
    ) -> Result<Response, CoreError> {
        let conn = self.connect(ctx, link).await?;
        tracing::trace!(device_id = %self.id, href = %link.href, method = %request.method, "exchange");
        conn.exchange(request)
            .await
            .and_then(|r| r.into_result(&link.href))
            .map_err(|e| CoreError::resource(operation, &self.id, &link.href, e))
    }

    async fn exchange(
        &self,
        ctx: &Context,
        retry: &RetryFactory,
        operation: &'static str,
        link: &ResourceLink,
        request: Request,
    ) -> Result<Response, CoreError> {
        operation_with_retries(ctx, retry, self.settings.operation_timeout, |attempt| {
            let request = request.clone();
            async move { self.exchange_attempt(&attempt, operation, link, request).await }
        })
        .await
    }

    /// A single attempt bounded by the operation timeout, no retries.
    async fn exchange_once(
        &self,
        ctx: &Context,
        operation: &'static str,
        link: &ResourceLink,
        request: Request,
    ) -> Result<Response, CoreError> {
        let attempt = ctx.with_timeout(self.settings.operation_timeout);
        let result = attempt
            .run(self.exchange_attempt(&attempt, operation, link, request))
            .await;
        attempt.cancel();
        result
    }

    /// Retried exchange pinned to one connection.
    async fn exchange_on(
        &self,
        ctx: &Context,
        conn: &Arc<dyn Connection>,
        operation: &'static str,
        request: Request,
    ) -> Result<Response, CoreError> {
        let id = self.id.as_str();
        let href = request.href.clone();
        let href = href.as_str();
        operation_with_retries(
            ctx,
            &self.settings.retry,
            self.settings.operation_timeout,
            |_attempt| {
                let request = request.clone();
                let conn = Arc::clone(conn);
                async move {
                    conn.exchange(request)
                        .await
                        .and_then(|r| r.into_result(href))
                        .map_err(|e| CoreError::resource(operation, id, href, e))
                }
            },
        )
        .await
    }

    fn decode<T, C>(
        &self,
        codec: &C,
        operation: &'static str,
        href: &str,
        response: &Response,
    ) -> Result<T, CoreError>
    where
        T: DeserializeOwned,
        C: Codec,
    {
        decode_response(codec, response)
            .map_err(|e| CoreError::resource(operation, &self.id, href, e))
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("resource_types", &self.resource_types)
            .field("phase", &self.phase())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

// ── Helpers ──────────────────────────────────────────────────────

pub(crate) fn encode_request<C, B>(
    method: Method,
    href: &str,
    codec: &C,
    body: &B,
) -> Result<Request, CoreError>
where
    C: Codec,
    B: Serialize + ?Sized,
{
    let payload = codec.encode(body)?;
    Ok(Request::new(method, href)
        .with_body(codec.content_format(), payload)
        .with_accept(codec.content_format()))
}

/// Decode a response body; an empty body decodes as unit (`()`, `None`,
/// `Value::Null`) when the codec itself cannot decode it.
pub(crate) fn decode_response<T, C>(codec: &C, response: &Response) -> Result<T, ocfly_api::Error>
where
    T: DeserializeOwned,
    C: Codec,
{
    match codec.decode(response.content_format, &response.body) {
        Ok(value) => Ok(value),
        Err(e) if response.body.is_empty() => {
            T::deserialize(serde::de::value::UnitDeserializer::<serde::de::value::Error>::new())
                .map_err(|_| e)
        }
        Err(e) => Err(e),
    }
}

/// Pick this device's entry out of a `/oic/res` answer.
fn select_device_links(
    device_id: &str,
    devices: Vec<DeviceLinks>,
) -> Result<ResourceLinks, CoreError> {
    let count = devices.len();
    let mut anonymous = None;
    for device in devices {
        match device.device_id() {
            Some(id) if id == device_id => return Ok(device.links),
            None if count == 1 => anonymous = Some(device.links),
            _ => {}
        }
    }
    anonymous.ok_or_else(|| CoreError::DeviceNotFound {
        device_id: device_id.to_owned(),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ocfly_api::{JsonCodec, RawCodec, ResponseCode};

    #[test]
    fn empty_body_decodes_as_unit() {
        let response = Response::new(ResponseCode::Changed);
        decode_response::<(), _>(&CborCodec, &response).unwrap();
        let v: serde_json::Value = decode_response(&JsonCodec, &response).unwrap();
        assert!(v.is_null());
        let raw: Vec<u8> = decode_response(&RawCodec::default(), &response).unwrap();
        assert!(raw.is_empty());
    }

    #[test]
    fn select_device_links_matches_id() {
        let devices = vec![
            DeviceLinks {
                device_id: "a".into(),
                links: ResourceLinks::default(),
            },
            DeviceLinks {
                device_id: "b".into(),
                links: vec![ResourceLink {
                    href: "/oic/d".into(),
                    ..ResourceLink::default()
                }]
                .into(),
            },
        ];
        let links = select_device_links("b", devices.clone()).unwrap();
        assert_eq!(links.len(), 1);
        assert!(select_device_links("c", devices).unwrap_err().is_not_found());
    }
}
