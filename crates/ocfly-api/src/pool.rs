// Connection pool.
//
// Address-keyed cache of live connections. Every connection that enters
// the pool registers a session-end observer that removes exactly its own
// entry; an observer left behind by an older connection can never evict a
// newer one for the same address. Dialing is single-flight per address.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::addr::Addr;
use crate::error::Error;
use crate::transport::{Connection, Dialer};

struct PoolEntry {
    id: u64,
    conn: Arc<dyn Connection>,
}

struct PoolInner {
    entries: DashMap<Addr, PoolEntry>,
    dialing: DashMap<Addr, Arc<Mutex<()>>>,
    next_id: AtomicU64,
}

/// Shared handle to a connection pool. Cloning is cheap.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Pool {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                entries: DashMap::new(),
                dialing: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Live connection for `addr`, if any. Stale closed entries are dropped.
    pub fn get(&self, addr: &Addr) -> Option<Arc<dyn Connection>> {
        let conn = self.inner.entries.get(addr).map(|e| Arc::clone(&e.conn))?;
        if conn.is_closed() {
            self.inner
                .entries
                .remove_if(addr, |_, e| same_connection(&e.conn, &conn));
            return None;
        }
        Some(conn)
    }

    /// Insert `conn` under its remote address.
    pub async fn put(&self, conn: Arc<dyn Connection>) {
        let addr = conn.remote_addr().clone();
        self.put_at(addr, conn).await;
    }

    /// Insert `conn` under `addr`, closing any different connection it
    /// displaces.
    pub async fn put_at(&self, addr: Addr, conn: Arc<dyn Connection>) {
        if let Some(existing) = self.inner.entries.get(&addr) {
            if same_connection(&existing.conn, &conn) {
                return;
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let displaced = self.inner.entries.insert(
            addr.clone(),
            PoolEntry {
                id,
                conn: Arc::clone(&conn),
            },
        );
        tracing::debug!(%addr, id, "connection pooled");

        // Registered after insertion: an already-ended session removes
        // itself right away.
        conn.observe_session_end(evict_on_end(Arc::downgrade(&self.inner), addr, id));

        if let Some(old) = displaced {
            if !same_connection(&old.conn, &conn) {
                old.conn.close().await;
            }
        }
    }

    pub fn delete(&self, addr: &Addr) -> Option<Arc<dyn Connection>> {
        self.inner.entries.remove(addr).map(|(_, e)| e.conn)
    }

    /// Cached connection for `addr`, or one produced by `connect`.
    ///
    /// At most one `connect` runs per address at a time; concurrent callers
    /// wait for it and reuse its connection.
    pub async fn get_or_connect<F, Fut>(
        &self,
        addr: &Addr,
        connect: F,
    ) -> Result<Arc<dyn Connection>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn Connection>, Error>>,
    {
        if let Some(conn) = self.get(addr) {
            return Ok(conn);
        }

        let slot = DialSlot {
            dialing: &self.inner.dialing,
            addr,
            lock: Arc::clone(&self.inner.dialing.entry(addr.clone()).or_default()),
        };
        let _guard = slot.lock.lock().await;
        if let Some(conn) = self.get(addr) {
            return Ok(conn);
        }
        tracing::debug!(%addr, "dialing");
        let conn = connect().await?;
        self.put_at(addr.clone(), Arc::clone(&conn)).await;
        Ok(conn)
    }

    /// [`get_or_connect`](Self::get_or_connect) with an unsecured dial.
    pub async fn get_or_dial(
        &self,
        addr: &Addr,
        dialer: &dyn Dialer,
    ) -> Result<Arc<dyn Connection>, Error> {
        self.get_or_connect(addr, || dialer.dial(addr)).await
    }

    /// Snapshot of every pooled connection.
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.inner
            .entries
            .iter()
            .map(|e| Arc::clone(&e.conn))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Close and drop every entry.
    pub async fn close_all(&self) {
        let addrs: Vec<Addr> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        for addr in addrs {
            if let Some(conn) = self.delete(&addr) {
                conn.close().await;
            }
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("connections", &self.inner.entries.len())
            .finish_non_exhaustive()
    }
}

/// A caller's claim on the per-address dial lock. Dropping the last claim
/// removes the lock from the map, including when the dialing future is
/// cancelled mid-dial.
struct DialSlot<'a> {
    dialing: &'a DashMap<Addr, Arc<Mutex<()>>>,
    addr: &'a Addr,
    lock: Arc<Mutex<()>>,
}

impl Drop for DialSlot<'_> {
    fn drop(&mut self) {
        // Map + our clone: nobody else is waiting.
        self.dialing.remove_if(self.addr, |_, l| {
            Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) <= 2
        });
    }
}

fn evict_on_end(
    pool: Weak<PoolInner>,
    addr: Addr,
    id: u64,
) -> crate::transport::SessionObserver {
    Box::new(move |end| {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if inner.entries.remove_if(&addr, |_, e| e.id == id).is_some() {
            tracing::debug!(%addr, id, reason = %end, "connection evicted");
        }
    })
}
