// ── Resource link cache ──
//
// Device id -> the device's last known resource links. Values are whole
// `Arc` snapshots: a put replaces the previous list atomically, and
// readers never observe a partially updated list.

use std::sync::Arc;

use dashmap::DashMap;
use ocfly_api::schema::{ResourceLink, ResourceLinks};
use tokio::sync::watch;

pub struct LinkCache {
    by_device: DashMap<String, Arc<ResourceLinks>>,

    /// Bumped on every mutation.
    version: watch::Sender<u64>,
}

impl LinkCache {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0u64);
        Self {
            by_device: DashMap::new(),
            version,
        }
    }

    /// Replace the cached links for `device_id`.
    pub fn put(&self, device_id: impl Into<String>, links: ResourceLinks) {
        let device_id = device_id.into();
        tracing::trace!(%device_id, links = links.len(), "caching resource links");
        self.by_device.insert(device_id, Arc::new(links));
        self.bump_version();
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<ResourceLinks>> {
        self.by_device.get(device_id).map(|r| Arc::clone(r.value()))
    }

    /// Cached link for `href` on `device_id`.
    pub fn get_link(&self, device_id: &str, href: &str) -> Option<ResourceLink> {
        self.get(device_id)?.get(href).cloned()
    }

    pub fn delete(&self, device_id: &str) -> Option<Arc<ResourceLinks>> {
        let removed = self.by_device.remove(device_id).map(|(_, v)| v);
        if removed.is_some() {
            self.bump_version();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.by_device.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_device.is_empty()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.by_device.iter().map(|r| r.key().clone()).collect()
    }

    /// Version counter that changes on every put/delete.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    fn bump_version(&self) {
        // `send_modify` updates unconditionally, even with zero receivers.
        self.version.send_modify(|v| *v += 1);
    }
}

impl Default for LinkCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LinkCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkCache")
            .field("devices", &self.by_device.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn links(hrefs: &[&str]) -> ResourceLinks {
        hrefs
            .iter()
            .map(|h| ResourceLink {
                href: (*h).to_owned(),
                ..ResourceLink::default()
            })
            .collect::<Vec<_>>()
            .into()
    }

    #[test]
    fn second_put_replaces_first() {
        let cache = LinkCache::new();
        cache.put("dev", links(&["/oic/d", "/light/1"]));
        cache.put("dev", links(&["/oic/d"]));

        let got = cache.get("dev").unwrap();
        assert_eq!(got.len(), 1);
        assert!(cache.get_link("dev", "/light/1").is_none());
        assert!(cache.get_link("dev", "/oic/d").is_some());
    }

    #[test]
    fn miss_is_none() {
        let cache = LinkCache::new();
        assert!(cache.get("unknown").is_none());
        assert!(cache.delete("unknown").is_none());
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let cache = LinkCache::new();
        cache.put("dev", links(&["/a", "/b"]));
        let before = cache.get("dev").unwrap();
        cache.put("dev", links(&["/c"]));
        assert_eq!(before.len(), 2);
        assert_eq!(cache.get("dev").unwrap().len(), 1);
    }

    #[test]
    fn mutations_bump_version() {
        let cache = LinkCache::new();
        let rx = cache.subscribe();
        cache.put("a", links(&["/oic/d"]));
        cache.put("b", links(&["/oic/d"]));
        cache.delete("a");
        assert_eq!(*rx.borrow(), 3);
        assert_eq!(cache.device_ids(), vec!["b".to_owned()]);
    }
}
