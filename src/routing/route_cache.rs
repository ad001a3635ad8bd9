use std::sync::Arc;

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, trace, warn};

use crate::addr::NetworkAddress;
use crate::config::StackConfig;
use crate::error::RouteError;
use crate::medium::NetworkMedium;
use crate::routing_header::{RoutePath, RoutingHeader};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RouteState {
    Pending,
    Resolved(RoutePath),
    Failed,
}

struct RouteCacheEntry {
    /// Callers waiting for the outcome of discovery hold receivers; their number is the entry's
    ///  waiter count.
    state: watch::Sender<RouteState>,
    /// number of discovery broadcasts so far
    broadcast_count: u32,
    discovery_id: u32,
    /// retry timer while Pending, eviction timer once Resolved
    timer: Option<JoinHandle<()>>,
}

impl RouteCacheEntry {
    fn is_pending(&self) -> bool {
        *self.state.borrow() == RouteState::Pending
    }

    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Default)]
struct RouteCacheInner {
    entries: FxHashMap<NetworkAddress, RouteCacheEntry>,
}

/// The route cache has at most one entry per destination, and that entry coordinates discovery
///  for everybody interested in the destination: The first caller starts flooding, and callers
///  arriving while discovery is in progress wait for the same outcome.
///
/// A resolved route is kept for a fixed interval and then discarded, so that the next send
///  re-discovers and picks up changes in topology. A failed entry is discarded as soon as no
///  caller is waiting for it any more.
#[derive(Clone)]
pub struct RouteCache {
    myself: NetworkAddress,
    config: Arc<StackConfig>,
    medium: Arc<dyn NetworkMedium>,
    inner: Arc<RwLock<RouteCacheInner>>,
}

impl RouteCache {
    pub fn new(config: Arc<StackConfig>, medium: Arc<dyn NetworkMedium>) -> RouteCache {
        RouteCache {
            myself: medium.local_addr(),
            config,
            medium,
            inner: Default::default(),
        }
    }

    /// Returns a path starting with this node and ending with `destination`, running route
    ///  discovery if there is no cached path.
    pub async fn resolve(&self, destination: NetworkAddress) -> Result<RoutePath, RouteError> {
        if destination == self.myself {
            return Ok(RoutePath::new(self.myself));
        }

        let mut receiver = {
            let mut inner = self.inner.write().await;

            let existing = inner.entries.get(&destination)
                .map(|e| (e.state.borrow().clone(), e.state.receiver_count()));

            match existing {
                Some((RouteState::Resolved(path), _)) => {
                    trace!("cached route to {:?}: {:?}", destination, path);
                    return Ok(path);
                }
                Some((RouteState::Failed, num_waiters)) => {
                    if num_waiters == 0 {
                        inner.entries.remove(&destination);
                    }
                    return Err(RouteError::Unreachable);
                }
                Some((RouteState::Pending, _)) => {
                    trace!("joining route discovery for {:?} in progress", destination);
                }
                None => {
                    debug!("starting route discovery for {:?}", destination);
                    let (state, _) = watch::channel(RouteState::Pending);
                    self.broadcast_discovery(destination, 0).await;
                    inner.entries.insert(destination, RouteCacheEntry {
                        state,
                        broadcast_count: 1,
                        discovery_id: 0,
                        timer: Some(self.arm_retry_timer(destination, 0)),
                    });
                }
            }

            match inner.entries.get(&destination) {
                Some(entry) => entry.state.subscribe(),
                None => return Err(RouteError::Unreachable),
            }
        };

        let outcome = receiver.wait_for(|s| *s != RouteState::Pending).await
            .map(|s| s.clone());
        drop(receiver);

        match outcome {
            Ok(RouteState::Resolved(path)) => Ok(path),
            _ => {
                self.remove_if_failed_and_unwatched(destination).await;
                Err(RouteError::Unreachable)
            }
        }
    }

    async fn remove_if_failed_and_unwatched(&self, destination: NetworkAddress) {
        let mut inner = self.inner.write().await;
        let is_stale = inner.entries.get(&destination)
            .is_some_and(|e| *e.state.borrow() == RouteState::Failed && e.state.receiver_count() == 0);
        if is_stale {
            debug!("discarding failed route cache entry for {:?}", destination);
            inner.entries.remove(&destination);
        }
    }

    async fn broadcast_discovery(&self, destination: NetworkAddress, discovery_id: u32) {
        let mut buf = BytesMut::with_capacity(RoutingHeader::SERIALIZED_LEN);
        RoutingHeader::discovery(destination, discovery_id, self.myself)
            .ser(&mut buf);

        trace!("broadcasting discovery #{} for {:?}", discovery_id, destination);
        if let Err(e) = self.medium.broadcast(&buf).await {
            // the retry timer takes care of this like of any other lost broadcast
            error!("error broadcasting route discovery for {:?}: {}", destination, e);
        }
    }

    fn arm_retry_timer(&self, destination: NetworkAddress, discovery_id: u32) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            sleep(cache.config.discovery_retry_interval).await;
            cache.on_retry_timer(destination, discovery_id).await;
        })
    }

    async fn on_retry_timer(&self, destination: NetworkAddress, armed_discovery_id: u32) {
        let mut inner = self.inner.write().await;
        let entry = match inner.entries.get_mut(&destination) {
            Some(entry) if entry.is_pending() && entry.discovery_id == armed_discovery_id => entry,
            _ => return,
        };

        // the timer handle refers to this very task
        entry.timer = None;

        if entry.broadcast_count >= self.config.max_discovery_retries {
            debug!("route discovery for {:?} failed after {} broadcasts", destination, entry.broadcast_count);
            entry.state.send_replace(RouteState::Failed);
            if entry.state.receiver_count() == 0 {
                inner.entries.remove(&destination);
            }
            return;
        }

        entry.discovery_id = entry.discovery_id.wrapping_add(1);
        entry.broadcast_count += 1;
        let discovery_id = entry.discovery_id;

        debug!("no reply for route discovery to {:?} - retrying with id {}", destination, discovery_id);
        self.broadcast_discovery(destination, discovery_id).await;
        if let Some(entry) = inner.entries.get_mut(&destination) {
            entry.timer = Some(self.arm_retry_timer(destination, discovery_id));
        }
    }

    /// Handles a route reply addressed to this node. `reply_path` is the path as carried by the
    ///  reply, i.e. starting at the discovered destination and ending with this node.
    pub async fn on_reply(&self, discovery_id: u32, reply_path: &RoutePath) {
        let destination = reply_path.first();
        let path = reply_path.reversed();
        if path.first() != self.myself {
            warn!("route reply for {:?} does not end with this node: {:?} - dropping", destination, reply_path);
            return;
        }

        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get_mut(&destination) else {
            debug!("route reply for {:?} without a cache entry - dropping", destination);
            return;
        };
        if !entry.is_pending() {
            trace!("route to {:?} is not pending any more - dropping reply", destination);
            return;
        }
        if entry.discovery_id != discovery_id {
            debug!("stale route reply for {:?}: id {}, expected {} - dropping", destination, discovery_id, entry.discovery_id);
            return;
        }

        debug!("resolved route to {:?}: {:?}", destination, path);
        entry.abort_timer();
        entry.state.send_replace(RouteState::Resolved(path));
        entry.timer = Some(self.arm_eviction_timer(destination));
    }

    fn arm_eviction_timer(&self, destination: NetworkAddress) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            sleep(cache.config.route_eviction_interval).await;

            let mut inner = cache.inner.write().await;
            let is_resolved = inner.entries.get(&destination)
                .is_some_and(|e| matches!(*e.state.borrow(), RouteState::Resolved(_)));
            if is_resolved {
                trace!("evicting cached route to {:?}", destination);
                inner.entries.remove(&destination);
            }
        })
    }

    /// Cancels all timers and discards all entries. Callers waiting for a discovery fail with
    ///  [RouteError::Unreachable].
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        for (_, mut entry) in inner.entries.drain() {
            entry.abort_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::time::advance;

    use super::*;
    use crate::medium::MockNetworkMedium;
    use crate::routing_header::RoutingPacketKind;

    fn addr(n: u8) -> NetworkAddress {
        NetworkAddress::new(Ipv4Addr::new(10, 0, 0, n), 4000 + n as u16)
    }

    fn path(hops: &[u8]) -> RoutePath {
        RoutePath::from_hops(hops.iter().map(|&n| addr(n)).collect()).unwrap()
    }

    /// a route cache for node 1 that records all broadcast headers
    fn cache_with_recording_medium() -> (RouteCache, Arc<Mutex<Vec<RoutingHeader>>>) {
        let broadcasts = Arc::new(Mutex::new(Vec::new()));

        let mut medium = MockNetworkMedium::new();
        medium.expect_local_addr()
            .return_const(addr(1));
        let b = broadcasts.clone();
        medium.expect_broadcast()
            .returning(move |packet| {
                let mut buf = packet;
                b.lock().unwrap().push(RoutingHeader::try_deser(&mut buf).unwrap());
                Ok(())
            });
        medium.expect_send_to()
            .never();

        (RouteCache::new(Arc::new(StackConfig::default()), Arc::new(medium)), broadcasts)
    }

    /// give spawned tasks the chance to run to their next await point
    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_self() {
        let (cache, broadcasts) = cache_with_recording_medium();
        assert_eq!(cache.resolve(addr(1)).await.unwrap(), path(&[1]));
        assert!(broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_via_reply() {
        let (cache, broadcasts) = cache_with_recording_medium();

        let c = cache.clone();
        let resolving = tokio::spawn(async move { c.resolve(addr(3)).await });
        settle().await;

        {
            let sent = broadcasts.lock().unwrap();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].kind, RoutingPacketKind::Discovery);
            assert_eq!(sent[0].destination, addr(3));
            assert_eq!(sent[0].discovery_id, 0);
            assert_eq!(sent[0].path, path(&[1]));
        }

        cache.on_reply(0, &path(&[3, 2, 1])).await;
        assert_eq!(resolving.await.unwrap().unwrap(), path(&[1, 2, 3]));

        // cached: no further broadcast
        assert_eq!(cache.resolve(addr(3)).await.unwrap(), path(&[1, 2, 3]));
        assert_eq!(broadcasts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolve_single_flight() {
        let (cache, broadcasts) = cache_with_recording_medium();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let c = cache.clone();
            handles.push(tokio::spawn(async move { c.resolve(addr(4)).await }));
        }
        settle().await;
        assert_eq!(broadcasts.lock().unwrap().len(), 1);

        cache.on_reply(0, &path(&[4, 3, 2, 1])).await;
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), path(&[1, 2, 3, 4]));
        }
        assert_eq!(broadcasts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolve_all_fail() {
        let (cache, broadcasts) = cache_with_recording_medium();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let c = cache.clone();
            handles.push(tokio::spawn(async move { c.resolve(addr(9)).await }));
        }
        settle().await;

        advance(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(broadcasts.lock().unwrap().len(), 2);
        assert_eq!(broadcasts.lock().unwrap()[1].discovery_id, 1);

        advance(Duration::from_secs(15)).await;
        settle().await;
        assert_eq!(broadcasts.lock().unwrap().len(), 3);
        assert!(handles.iter().all(|h| !h.is_finished()));

        advance(Duration::from_secs(15)).await;
        for h in handles {
            assert!(matches!(h.await.unwrap(), Err(RouteError::Unreachable)));
        }
        assert_eq!(broadcasts.lock().unwrap().len(), 3);

        // the last waiter discards the entry
        assert!(cache.inner.read().await.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_waiters_discards_entry() {
        let (cache, _) = cache_with_recording_medium();

        let c = cache.clone();
        let resolving = tokio::spawn(async move { c.resolve(addr(9)).await });
        settle().await;
        resolving.abort();
        settle().await;

        for _ in 0..3 {
            assert!(!cache.inner.read().await.entries.is_empty());
            advance(Duration::from_secs(15)).await;
            settle().await;
        }
        assert!(cache.inner.read().await.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_reply_ignored() {
        let (cache, _) = cache_with_recording_medium();

        let c = cache.clone();
        let resolving = tokio::spawn(async move { c.resolve(addr(3)).await });
        settle().await;
        advance(Duration::from_secs(15)).await;
        settle().await;

        // the reply to the first broadcast arrives after the retry
        cache.on_reply(0, &path(&[3, 2, 1])).await;
        settle().await;
        assert!(!resolving.is_finished());

        cache.on_reply(1, &path(&[3, 1])).await;
        assert_eq!(resolving.await.unwrap().unwrap(), path(&[1, 3]));

        // later replies do not change the resolved route
        cache.on_reply(1, &path(&[3, 2, 1])).await;
        assert_eq!(cache.resolve(addr(3)).await.unwrap(), path(&[1, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_without_entry_ignored() {
        let (cache, _) = cache_with_recording_medium();
        cache.on_reply(0, &path(&[3, 1])).await;
        assert!(cache.inner.read().await.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction() {
        let (cache, broadcasts) = cache_with_recording_medium();

        let c = cache.clone();
        let resolving = tokio::spawn(async move { c.resolve(addr(2)).await });
        settle().await;
        cache.on_reply(0, &path(&[2, 1])).await;
        resolving.await.unwrap().unwrap();

        advance(Duration::from_millis(2999)).await;
        assert_eq!(cache.resolve(addr(2)).await.unwrap(), path(&[1, 2]));

        advance(Duration::from_millis(2)).await;
        settle().await;
        assert!(cache.inner.read().await.entries.is_empty());

        let c = cache.clone();
        let _resolving = tokio::spawn(async move { c.resolve(addr(2)).await });
        settle().await;
        assert_eq!(broadcasts.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_fails_waiters() {
        let (cache, _) = cache_with_recording_medium();

        let c = cache.clone();
        let resolving = tokio::spawn(async move { c.resolve(addr(3)).await });
        settle().await;

        cache.clear().await;
        assert!(matches!(resolving.await.unwrap(), Err(RouteError::Unreachable)));
        assert!(cache.inner.read().await.entries.is_empty());
    }
}
