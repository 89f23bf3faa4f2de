//! Shared in-memory network: the device registry plus a [`Dialer`] over it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use ocfly_api::{
    Addr, Connection, Dialer, Error, MulticastConnection, PeerVerification, Response, TlsIdentity,
};
use rustls_pki_types::UnixTime;

use crate::connection::{MockConnection, MockMulticast};
use crate::device::{MockDevice, lock};

/// In-memory registry of devices reachable through a [`MockDialer`].
///
/// Cloning shares the registry.
#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    devices: DashMap<String, MockDevice>,
    failing_groups: DashSet<Addr>,
    injected: Mutex<Vec<(Response, Addr)>>,
    dials: AtomicUsize,
    multicast_requests: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, device: MockDevice) {
        tracing::trace!(device_id = device.id(), "mock device joined");
        self.inner.devices.insert(device.id().to_owned(), device);
    }

    pub fn remove(&self, device_id: &str) -> Option<MockDevice> {
        self.inner.devices.remove(device_id).map(|(_, d)| d)
    }

    pub fn device(&self, device_id: &str) -> Option<MockDevice> {
        self.inner.devices.get(device_id).map(|d| d.clone())
    }

    pub fn devices(&self) -> Vec<MockDevice> {
        self.inner.devices.iter().map(|d| d.clone()).collect()
    }

    /// The device serving `addr`, if any.
    pub fn device_at(&self, addr: &Addr) -> Option<MockDevice> {
        self.inner
            .devices
            .iter()
            .find(|d| d.endpoints().contains(addr))
            .map(|d| d.clone())
    }

    /// Joining `group` fails from now on.
    pub fn fail_group(&self, group: Addr) {
        self.inner.failing_groups.insert(group);
    }

    /// Extra answer delivered to every discovery request, e.g. a malformed
    /// payload.
    pub fn inject_discovery_response(&self, from: Addr, response: Response) {
        lock(&self.inner.injected).push((response, from));
    }

    pub(crate) fn injected_responses(&self) -> Vec<(Response, Addr)> {
        lock(&self.inner.injected).clone()
    }

    pub(crate) fn record_multicast(&self, group: &Addr) {
        tracing::trace!(%group, "mock multicast request");
        self.inner.multicast_requests.fetch_add(1, Ordering::SeqCst);
    }

    /// Unicast dials attempted so far, secured or not.
    pub fn dial_count(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub fn multicast_request_count(&self) -> usize {
        self.inner.multicast_requests.load(Ordering::SeqCst)
    }

    pub fn dialer(&self) -> Arc<MockDialer> {
        Arc::new(MockDialer {
            network: self.clone(),
        })
    }

    fn reachable_device(&self, addr: &Addr) -> Result<MockDevice, Error> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        self.device_at(addr)
            .filter(MockDevice::is_reachable)
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("no device at {addr}"),
                ))
            })
    }
}

impl std::fmt::Debug for MockNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNetwork")
            .field("devices", &self.inner.devices.len())
            .finish_non_exhaustive()
    }
}

// ── Dialer ───────────────────────────────────────────────────────

/// [`Dialer`] that connects to devices registered on a [`MockNetwork`].
///
/// Secured dials run the real [`PeerVerification`] against the chain the
/// device presents: its manufacturer chain during ownership transfer,
/// its identity chain otherwise.
#[derive(Debug, Clone)]
pub struct MockDialer {
    network: MockNetwork,
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, addr: &Addr) -> Result<Arc<dyn Connection>, Error> {
        if addr.is_secure() {
            return Err(Error::Unsupported("unsecured dial to a secured endpoint"));
        }
        let device = self.network.reachable_device(addr)?;
        tracing::trace!(%addr, "mock dial");
        Ok(MockConnection::open(device, addr.clone(), false))
    }

    async fn dial_secure(
        &self,
        addr: &Addr,
        _identity: Arc<TlsIdentity>,
        verification: PeerVerification,
    ) -> Result<Arc<dyn Connection>, Error> {
        if !addr.is_secure() {
            return Err(Error::Unsupported("secured dial to an unsecured endpoint"));
        }
        let device = self.network.reachable_device(addr)?;
        let chain = match verification {
            PeerVerification::Manufacturer { .. } => device.manufacturer_chain(),
            PeerVerification::Identity { .. } => device.identity_chain(),
        }
        .ok_or_else(|| Error::Tls(format!("device at {addr} presented no certificate")))?;
        let Some((leaf, intermediates)) = chain.split_first() else {
            return Err(Error::Tls(format!("device at {addr} presented an empty chain")));
        };

        verification
            .verifier()?
            .verify_chain(leaf, intermediates, UnixTime::now())?;
        tracing::trace!(%addr, "mock secured dial");
        Ok(MockConnection::open(device, addr.clone(), true))
    }

    async fn listen_multicast(&self, group: &Addr) -> Result<Box<dyn MulticastConnection>, Error> {
        if self.network.inner.failing_groups.contains(group) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("cannot join {group}"),
            )));
        }
        Ok(Box::new(MockMulticast::new(group.clone(), self.network.clone())))
    }
}
