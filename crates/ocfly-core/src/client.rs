// ── Client facade ──
//
// Entry point for applications: discovery, device lookup backed by the
// link cache, resource access by device id over a shared connection pool,
// and ownership operations.

use std::sync::Arc;

use async_trait::async_trait;
use ocfly_api::schema::{DEVICE_HREF, ResourceLink, ResourceLinks};
use ocfly_api::{Codec, ContentFormat, Dialer, Pool, RawCodec, interface_query};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::ClientConfig;
use crate::context::Context;
use crate::device::{Device, DeviceSettings, OwnershipTransferMethod};
use crate::discovery::{self, DeviceHandler, DiscoveryStream};
use crate::error::{CoreError, ErrorKind, ErrorSink, default_error_sink};
use crate::store::LinkCache;

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<ClientInner>`.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    settings: DeviceSettings,
    /// Connections used by id-addressed resource operations.
    pool: Pool,
    link_cache: Arc<LinkCache>,
}

impl Client {
    pub fn new(config: ClientConfig, dialer: Arc<dyn Dialer>) -> Self {
        Self::with_error_sink(config, dialer, default_error_sink())
    }

    /// Like [`new`](Self::new) with a custom sink for background errors.
    pub fn with_error_sink(
        config: ClientConfig,
        dialer: Arc<dyn Dialer>,
        error_sink: ErrorSink,
    ) -> Self {
        let settings = DeviceSettings {
            dialer,
            operation_timeout: config.operation_timeout,
            retry: config.retry.factory(),
            error_sink,
            identity: config.identity.clone(),
            discovery_endpoints: config.discovery_endpoints.clone().into(),
            discovery_channel_capacity: config.discovery_channel_capacity,
        };
        Self {
            inner: Arc::new(ClientInner {
                config,
                settings,
                pool: Pool::new(),
                link_cache: Arc::new(LinkCache::new()),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn link_cache(&self) -> &LinkCache {
        &self.inner.link_cache
    }

    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }

    // ── Discovery ────────────────────────────────────────────────

    /// Discover devices until `ctx` ends, feeding `handler`. Delivered
    /// links are also cached.
    pub async fn get_devices(
        &self,
        ctx: &Context,
        handler: Arc<dyn DeviceHandler>,
    ) -> Result<(), CoreError> {
        let handler = Arc::new(CachingHandler {
            cache: Arc::clone(&self.inner.link_cache),
            inner: handler,
        });
        discovery::get_devices(ctx, &self.inner.settings, handler).await
    }

    /// Discovery as a stream. Each call starts a fresh run; dropping the
    /// stream stops it.
    pub fn discover(&self, ctx: &Context) -> DiscoveryStream {
        discovery::discover(
            ctx,
            self.inner.settings.clone(),
            Some(Arc::clone(&self.inner.link_cache)),
        )
    }

    /// Discover one device by id, bypassing the cache.
    pub async fn find_device(
        &self,
        ctx: &Context,
        device_id: &str,
    ) -> Result<(Device, ResourceLinks), CoreError> {
        let (device, links) = discovery::find_device(ctx, &self.inner.settings, device_id).await?;
        self.inner.link_cache.put(device_id, links.clone());
        Ok((device, links))
    }

    /// A handle for `device_id`, from cached links when present.
    pub async fn get_device(
        &self,
        ctx: &Context,
        device_id: &str,
    ) -> Result<(Device, ResourceLinks), CoreError> {
        if let Some(links) = self.inner.link_cache.get(device_id) {
            tracing::trace!(%device_id, "device links from cache");
            let links = ResourceLinks::clone(&links);
            let device = Device::new(
                self.inner.settings.clone(),
                device_id.to_owned(),
                descriptor_types(&links),
            );
            return Ok((device, links));
        }
        self.find_device(ctx, device_id).await
    }

    // ── Resource access by id ────────────────────────────────────

    /// GET `href` on `device_id`, optionally through `interface`.
    pub async fn get_resource<T, C>(
        &self,
        ctx: &Context,
        device_id: &str,
        href: &str,
        codec: &C,
        interface: Option<&str>,
    ) -> Result<T, CoreError>
    where
        T: DeserializeOwned,
        C: Codec,
    {
        let (device, link) = self.resolve(ctx, device_id, href).await?;
        let result = device
            .get_resource(ctx, &link, codec, &queries(interface))
            .await;
        self.forget_on_unreachable(device_id, result)
    }

    pub async fn update_resource<B, R, C>(
        &self,
        ctx: &Context,
        device_id: &str,
        href: &str,
        codec: &C,
        body: &B,
        interface: Option<&str>,
    ) -> Result<R, CoreError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
        C: Codec,
    {
        let (device, link) = self.resolve(ctx, device_id, href).await?;
        let result = device
            .update_resource(ctx, &link, codec, body, &queries(interface))
            .await;
        self.forget_on_unreachable(device_id, result)
    }

    /// POST an already encoded payload of `content_format`; returns the raw
    /// response body.
    pub async fn update_resource_raw(
        &self,
        ctx: &Context,
        device_id: &str,
        href: &str,
        content_format: ContentFormat,
        body: &[u8],
    ) -> Result<Vec<u8>, CoreError> {
        let codec = RawCodec::new(content_format);
        self.update_resource(ctx, device_id, href, &codec, body, None)
            .await
    }

    pub async fn delete_resource<R, C>(
        &self,
        ctx: &Context,
        device_id: &str,
        href: &str,
        codec: &C,
    ) -> Result<R, CoreError>
    where
        R: DeserializeOwned,
        C: Codec,
    {
        let (device, link) = self.resolve(ctx, device_id, href).await?;
        let result = device.delete_resource(ctx, &link, codec, &[]).await;
        self.forget_on_unreachable(device_id, result)
    }

    // ── Ownership ────────────────────────────────────────────────

    pub async fn own_device(
        &self,
        ctx: &Context,
        device_id: &str,
        otm: &dyn OwnershipTransferMethod,
    ) -> Result<(), CoreError> {
        let (device, links) = self.get_device(ctx, device_id).await?;
        let result = device.own(ctx, &links, otm).await;
        device.close().await;
        result
    }

    /// Disown `device_id`. Its cached links and pooled connections are
    /// dropped on success since the device resets.
    pub async fn disown_device(&self, ctx: &Context, device_id: &str) -> Result<(), CoreError> {
        let (device, links) = self.get_device(ctx, device_id).await?;
        let result = device.disown(ctx, &links).await;
        device.close().await;
        if result.is_ok() {
            self.forget(device_id, &links).await;
        }
        result
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.inner.pool.close_all().await;
        tracing::debug!("client closed");
    }

    // ── Internals ────────────────────────────────────────────────

    /// Link for `href` plus a handle sharing the client pool.
    async fn resolve(
        &self,
        ctx: &Context,
        device_id: &str,
        href: &str,
    ) -> Result<(Device, ResourceLink), CoreError> {
        let links = match self.inner.link_cache.get(device_id) {
            Some(links) => links,
            None => {
                let (device, links) = self.find_device(ctx, device_id).await?;
                device.close().await;
                Arc::new(links)
            }
        };
        let link = links
            .get(href)
            .cloned()
            .ok_or_else(|| CoreError::ResourceNotFound {
                device_id: device_id.to_owned(),
                href: href.to_owned(),
            })?;
        let device = Device::with_pool(
            self.inner.settings.clone(),
            device_id.to_owned(),
            descriptor_types(&links),
            self.inner.pool.clone(),
        );
        Ok((device, link))
    }

    /// Drop cached links for a device that stopped answering so the next
    /// call rediscovers it.
    fn forget_on_unreachable<T>(
        &self,
        device_id: &str,
        result: Result<T, CoreError>,
    ) -> Result<T, CoreError> {
        if let Err(e) = &result {
            if e.kind() == ErrorKind::Unavailable && self.inner.link_cache.delete(device_id).is_some()
            {
                tracing::debug!(%device_id, error = %e, "dropping cached links");
            }
        }
        result
    }

    async fn forget(&self, device_id: &str, links: &ResourceLinks) {
        self.inner.link_cache.delete(device_id);
        for addr in links.iter().flat_map(ResourceLink::addrs) {
            if let Some(conn) = self.inner.pool.delete(&addr) {
                conn.close().await;
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .field("link_cache", &self.inner.link_cache)
            .finish()
    }
}

fn queries(interface: Option<&str>) -> Vec<String> {
    interface.map(interface_query).into_iter().collect()
}

fn descriptor_types(links: &ResourceLinks) -> Vec<String> {
    links
        .get(DEVICE_HREF)
        .map(|l| l.resource_types.clone())
        .unwrap_or_default()
}

/// Records every delivered device in the link cache before passing it on.
struct CachingHandler {
    cache: Arc<LinkCache>,
    inner: Arc<dyn DeviceHandler>,
}

#[async_trait]
impl DeviceHandler for CachingHandler {
    async fn handle(&self, ctx: &Context, device: Device, links: ResourceLinks) {
        self.cache.put(device.id(), links.clone());
        self.inner.handle(ctx, device, links).await;
    }

    fn error(&self, err: CoreError) {
        self.inner.error(err);
    }
}
