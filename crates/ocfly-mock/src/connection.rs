//! Unicast sessions and multicast sockets backed by [`MockDevice`]s.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ocfly_api::schema::DISCOVERY_HREF;
use ocfly_api::{
    Addr, Connection, Error, MulticastConnection, Request, Response, SessionEnd, SessionObserver,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::device::{MockDevice, lock};
use crate::network::MockNetwork;

// ── Unicast ──────────────────────────────────────────────────────

#[derive(Default)]
struct Session {
    ended: Option<SessionEnd>,
    observers: Vec<SessionObserver>,
}

/// A session with one device endpoint.
pub struct MockConnection {
    device: MockDevice,
    remote: Addr,
    secure: bool,
    session: Mutex<Session>,
}

impl MockConnection {
    pub(crate) fn open(device: MockDevice, remote: Addr, secure: bool) -> Arc<Self> {
        let conn = Arc::new(Self {
            device,
            remote,
            secure,
            session: Mutex::new(Session::default()),
        });
        conn.device.register(&conn);
        conn
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub(crate) fn ended(&self) -> bool {
        lock(&self.session).ended.is_some()
    }

    /// End the session once; later calls are ignored.
    pub(crate) fn end(&self, reason: SessionEnd) {
        let observers = {
            let mut session = lock(&self.session);
            if session.ended.is_some() {
                return;
            }
            session.ended = Some(reason.clone());
            std::mem::take(&mut session.observers)
        };
        tracing::trace!(remote = %self.remote, %reason, "mock session ended");
        for observer in observers {
            observer(reason.clone());
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn remote_addr(&self) -> &Addr {
        &self.remote
    }

    async fn exchange(&self, request: Request) -> Result<Response, Error> {
        let ended = lock(&self.session).ended.clone();
        if let Some(reason) = ended {
            return Err(Error::ConnectionClosed {
                reason: reason.to_string(),
            });
        }
        let delay = self.device.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.device.is_reachable() {
            self.end(SessionEnd::Error("device unreachable".into()));
            return Err(Error::ConnectionClosed {
                reason: "device unreachable".into(),
            });
        }

        let result = self.device.handle(self.secure, &request);
        if let Err(e) = &result {
            if e.is_connection_closed() {
                self.end(SessionEnd::Reset);
            }
        }
        result
    }

    fn observe_session_end(&self, observer: SessionObserver) {
        let mut session = lock(&self.session);
        match session.ended.clone() {
            Some(reason) => {
                drop(session);
                observer(reason);
            }
            None => session.observers.push(observer),
        }
    }

    fn is_closed(&self) -> bool {
        self.ended()
    }

    async fn close(&self) {
        self.end(SessionEnd::Closed);
    }
}

impl fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnection")
            .field("device", &self.device.id())
            .field("remote", &self.remote)
            .field("secure", &self.secure)
            .field("ended", &self.ended())
            .finish()
    }
}

// ── Multicast ────────────────────────────────────────────────────

/// A socket joined to one discovery group of a [`MockNetwork`].
pub struct MockMulticast {
    group: Addr,
    network: MockNetwork,
    tx: mpsc::UnboundedSender<(Response, Addr)>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Response, Addr)>>,
    closed: CancellationToken,
}

impl MockMulticast {
    pub(crate) fn new(group: Addr, network: MockNetwork) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            group,
            network,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl MulticastConnection for MockMulticast {
    fn group(&self) -> &Addr {
        &self.group
    }

    async fn send(&self, request: Request) -> Result<(), Error> {
        if self.closed.is_cancelled() {
            return Err(Error::ConnectionClosed {
                reason: "multicast socket closed".into(),
            });
        }
        self.network.record_multicast(&self.group);
        if request.href != DISCOVERY_HREF {
            return Ok(());
        }

        for device in self.network.devices() {
            if !device.is_reachable() {
                continue;
            }
            let answer = (device.discovery_response(request.accept), device.unicast_addr());
            let delay = device.delay();
            if delay.is_zero() {
                let _ = self.tx.send(answer);
            } else {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(answer);
                });
            }
        }
        for answer in self.network.injected_responses() {
            let _ = self.tx.send(answer);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<(Response, Addr), Error> {
        let closed = || Error::ConnectionClosed {
            reason: "multicast socket closed".into(),
        };
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(closed()),
            answer = async { self.rx.lock().await.recv().await } => answer.ok_or_else(closed),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ocfly_api::ResponseCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ID: &str = "5e9a0c1d-2222-4000-8000-00000000000b";

    #[tokio::test]
    async fn observers_fire_once_and_late_observers_immediately() {
        let device = MockDevice::builder(ID).build();
        let conn = MockConnection::open(device.clone(), device.unicast_addr(), false);
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&fired);
        conn.observe_session_end(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        conn.close().await;
        conn.close().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&fired);
        conn.observe_session_end(Box::new(move |end| {
            assert_eq!(end, SessionEnd::Closed);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(conn.exchange(Request::get("/oic/d")).await.is_err());
    }

    #[tokio::test]
    async fn device_side_reset_ends_session() {
        let device = MockDevice::builder(ID).build();
        let conn = MockConnection::open(device.clone(), device.unicast_addr(), false);
        assert_eq!(device.open_sessions(), 1);
        device.drop_sessions();
        assert!(conn.is_closed());
        assert_eq!(device.open_sessions(), 0);
    }

    #[tokio::test]
    async fn multicast_answers_for_every_reachable_device() {
        let network = MockNetwork::new();
        network.add(MockDevice::builder(ID).build());
        let offline = MockDevice::builder("5e9a0c1d-2222-4000-8000-00000000000c").build();
        offline.set_reachable(false);
        network.add(offline);

        let socket = MockMulticast::new(Addr::new(ocfly_api::Scheme::Udp, "224.0.1.187", 5683), network);
        socket.send(Request::get(DISCOVERY_HREF)).await.unwrap();
        let (response, from) = socket.recv().await.unwrap();
        assert_eq!(response.code, ResponseCode::Content);
        assert_eq!(from.host(), "10.0.0.1");

        socket.close().await;
        assert!(socket.recv().await.is_err());
    }
}
