// ── Multicast discovery ──
//
// Query every discovery group for `/oic/res`, hand each newly seen device
// to a handler, and keep listening until the context ends. One task per
// socket; a device id is delivered at most once per run. Handlers run on
// their own tasks and may outlive the run.

use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use dashmap::DashSet;
use futures_core::Stream;
use ocfly_api::schema::{DISCOVERY_HREF, DeviceLinks, ResourceLinks};
use ocfly_api::{Addr, CborCodec, ContentFormat, MulticastConnection, Request, Response};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;
use uuid::Uuid;

use crate::context::Context;
use crate::device::{Device, DeviceSettings, decode_response};
use crate::error::{CoreError, ErrorSink};
use crate::store::LinkCache;

/// Receives the results of a discovery run.
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    /// A newly discovered device with its patched links. The handler owns
    /// `device` and must close it. Runs on its own task, so it may still be
    /// running after `get_devices` has returned.
    async fn handle(&self, ctx: &Context, device: Device, links: ResourceLinks);

    /// A malformed response or a failing socket; discovery continues.
    fn error(&self, err: CoreError);
}

// ── Engine ───────────────────────────────────────────────────────

pub(crate) async fn get_devices(
    ctx: &Context,
    settings: &DeviceSettings,
    handler: Arc<dyn DeviceHandler>,
) -> Result<(), CoreError> {
    let sockets = open_sockets(settings).await?;
    let request = Request::get(DISCOVERY_HREF).with_accept(ContentFormat::APP_OCF_CBOR);
    let seen: Arc<DashSet<Uuid>> = Arc::new(DashSet::new());
    let mut tasks = JoinSet::new();

    for socket in sockets {
        if let Err(e) = socket.send(request.clone()).await {
            tracing::debug!(group = %socket.group(), error = %e, "discovery request failed");
            handler.error(e.into());
            socket.close().await;
            continue;
        }

        let ctx = ctx.clone();
        let settings = settings.clone();
        let handler = Arc::clone(&handler);
        let seen = Arc::clone(&seen);
        tasks.spawn(async move {
            listen(&ctx, &settings, &handler, &seen, socket.as_ref()).await;
            socket.close().await;
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            (settings.error_sink)(&CoreError::internal(format!("discovery task failed: {e}")));
        }
    }
    tracing::debug!(devices = seen.len(), "discovery finished");
    Ok(())
}

async fn open_sockets(
    settings: &DeviceSettings,
) -> Result<Vec<Arc<dyn MulticastConnection>>, CoreError> {
    if settings.discovery_endpoints.is_empty() {
        return Err(CoreError::Config {
            message: "no discovery endpoints configured".into(),
        });
    }

    let mut sockets = Vec::with_capacity(settings.discovery_endpoints.len());
    let mut last = None;
    for group in settings.discovery_endpoints.iter() {
        match settings.dialer.listen_multicast(group).await {
            Ok(socket) => sockets.push(Arc::<dyn MulticastConnection>::from(socket)),
            Err(e) => {
                let err = CoreError::from(e);
                tracing::debug!(%group, error = %err, "cannot open discovery endpoint");
                (settings.error_sink)(&err);
                last = Some(err);
            }
        }
    }

    match (sockets.is_empty(), last) {
        (true, Some(err)) => Err(CoreError::internal_from(
            "cannot open any discovery endpoint",
            err,
        )),
        _ => Ok(sockets),
    }
}

async fn listen(
    ctx: &Context,
    settings: &DeviceSettings,
    handler: &Arc<dyn DeviceHandler>,
    seen: &DashSet<Uuid>,
    socket: &dyn MulticastConnection,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = ctx.done() => return,
            received = socket.recv() => received,
        };
        match received {
            Ok((response, from)) => {
                handle_response(ctx, settings, handler, seen, &response, &from);
            }
            Err(e) => {
                if !ctx.is_done() {
                    handler.error(e.into());
                }
                return;
            }
        }
    }
}

fn handle_response(
    ctx: &Context,
    settings: &DeviceSettings,
    handler: &Arc<dyn DeviceHandler>,
    seen: &DashSet<Uuid>,
    response: &Response,
    from: &Addr,
) {
    let invalid = |message: String| CoreError::InvalidDiscoveryResponse {
        from: from.to_string(),
        message,
    };

    if !response.code.is_success() {
        handler.error(invalid(format!("response code {}", response.code)));
        return;
    }
    let devices: Vec<DeviceLinks> = match decode_response(&CborCodec, response) {
        Ok(devices) => devices,
        Err(e) => {
            handler.error(invalid(e.to_string()));
            return;
        }
    };

    for entry in devices {
        let (uuid, device_id, resource_types) = match validate(&entry) {
            Ok(valid) => valid,
            Err(message) => {
                handler.error(invalid(message));
                continue;
            }
        };
        if !seen.insert(uuid) {
            tracing::trace!(%device_id, %from, "device already delivered");
            continue;
        }

        tracing::debug!(%device_id, %from, "device discovered");
        let links = entry.links.patch_endpoint(from);
        let device = Device::new(settings.clone(), device_id, resource_types);
        let handler = Arc::clone(handler);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handler.handle(&ctx, device, links).await;
        });
    }
}

/// Parsed id, advertised id and descriptor resource types of a
/// well-formed entry.
fn validate(entry: &DeviceLinks) -> Result<(Uuid, String, Vec<String>), String> {
    let Some(descriptor) = entry.links.device_link() else {
        return Err("missing /oic/d link".into());
    };
    let device_id = entry.device_id().unwrap_or_default();
    if device_id.is_empty() {
        return Err("empty device id".into());
    }
    let uuid = match Uuid::parse_str(device_id) {
        Ok(uuid) => uuid,
        Err(e) => return Err(format!("device id {device_id:?} is not a UUID: {e}")),
    };
    if descriptor.resource_types.is_empty() {
        return Err(format!("device {device_id}: /oic/d has no resource types"));
    }
    Ok((uuid, device_id.to_owned(), descriptor.resource_types.clone()))
}

// ── Stream surface ───────────────────────────────────────────────

/// One item of a [`DiscoveryStream`].
#[derive(Debug)]
pub enum DiscoveryEvent {
    Device {
        device: Device,
        links: ResourceLinks,
    },
    Error(CoreError),
}

/// A discovery run as a `Stream`. Dropping it stops the run.
pub struct DiscoveryStream {
    inner: ReceiverStream<DiscoveryEvent>,
    _run: DropGuard,
}

impl Stream for DiscoveryStream {
    type Item = DiscoveryEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

struct ChannelHandler {
    tx: mpsc::Sender<DiscoveryEvent>,
    cache: Option<Arc<LinkCache>>,
}

#[async_trait]
impl DeviceHandler for ChannelHandler {
    async fn handle(&self, _ctx: &Context, device: Device, links: ResourceLinks) {
        if let Some(cache) = &self.cache {
            cache.put(device.id(), links.clone());
        }
        if let Err(mpsc::error::SendError(DiscoveryEvent::Device { device, .. })) =
            self.tx.send(DiscoveryEvent::Device { device, links }).await
        {
            device.close().await;
        }
    }

    fn error(&self, err: CoreError) {
        if let Err(mpsc::error::TrySendError::Full(DiscoveryEvent::Error(err))) =
            self.tx.try_send(DiscoveryEvent::Error(err))
        {
            tracing::warn!(error = %err, "discovery stream full, dropping error");
        }
    }
}

/// Start a fresh discovery run feeding a bounded stream, recording every
/// delivered device's links in `cache` when given.
pub(crate) fn discover(
    ctx: &Context,
    settings: DeviceSettings,
    cache: Option<Arc<LinkCache>>,
) -> DiscoveryStream {
    let run = ctx.child();
    let (tx, rx) = mpsc::channel(settings.discovery_channel_capacity.max(1));
    let handler = Arc::new(ChannelHandler {
        tx: tx.clone(),
        cache,
    });

    let task_ctx = run.clone();
    tokio::spawn(async move {
        if let Err(e) = get_devices(&task_ctx, &settings, handler).await {
            let _ = tx.send(DiscoveryEvent::Error(e)).await;
        }
    });

    DiscoveryStream {
        inner: ReceiverStream::new(rx),
        _run: run.token().clone().drop_guard(),
    }
}

// ── Single-device lookup ─────────────────────────────────────────

enum LatchState {
    Waiting,
    Found(Device, ResourceLinks),
    /// The lookup has returned; late deliveries are closed.
    Closed,
}

/// Keeps the first device matching `device_id` and stops the run.
struct DeviceLatch {
    device_id: Uuid,
    state: Mutex<LatchState>,
    run: Context,
    error_sink: ErrorSink,
}

#[async_trait]
impl DeviceHandler for DeviceLatch {
    async fn handle(&self, _ctx: &Context, device: Device, links: ResourceLinks) {
        if Uuid::parse_str(device.id()).ok() != Some(self.device_id) {
            device.close().await;
            return;
        }

        let mut state = self.state.lock().await;
        if matches!(*state, LatchState::Waiting) {
            *state = LatchState::Found(device, links);
            drop(state);
            self.run.cancel();
        } else {
            drop(state);
            device.close().await;
        }
    }

    fn error(&self, err: CoreError) {
        (self.error_sink)(&err);
    }
}

/// Run discovery until `device_id` answers.
pub(crate) async fn find_device(
    ctx: &Context,
    settings: &DeviceSettings,
    device_id: &str,
) -> Result<(Device, ResourceLinks), CoreError> {
    let not_found = || CoreError::DeviceNotFound {
        device_id: device_id.to_owned(),
    };
    let target = Uuid::parse_str(device_id).map_err(|_| not_found())?;

    let run = ctx.child();
    let latch = Arc::new(DeviceLatch {
        device_id: target,
        state: Mutex::new(LatchState::Waiting),
        run: run.clone(),
        error_sink: Arc::clone(&settings.error_sink),
    });

    let result = get_devices(&run, settings, Arc::clone(&latch) as Arc<dyn DeviceHandler>).await;
    run.cancel();
    let state = std::mem::replace(&mut *latch.state.lock().await, LatchState::Closed);
    if let LatchState::Found(device, links) = state {
        return Ok((device, links));
    }
    result?;
    Err(not_found())
}

/// [`find_device`] keeping only the links; the device handle is closed.
pub(crate) async fn find_device_links(
    ctx: &Context,
    settings: &DeviceSettings,
    device_id: &str,
) -> Result<ResourceLinks, CoreError> {
    let (device, links) = find_device(ctx, settings, device_id).await?;
    device.close().await;
    Ok(links)
}
