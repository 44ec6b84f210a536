//! The cache group: local store, ownership ring and load deduplication.
//!
//! A key owned by this process is loaded from the origin and kept in the
//! local store. A key owned by another peer is fetched from that peer and
//! passed through without a local copy, so every response lives in exactly
//! one process's memory. If the owner cannot be reached the origin is asked
//! directly and that result is not kept either.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::codec::{response, CacheKey, KeyCodec};
use crate::error::Result;
use crate::metrics;
use crate::origin::Origin;
use crate::peer::PeerClient;
use crate::ring::{HashRing, Peer, PeerSet};
use crate::singleflight::Group;
use crate::store::{LocalStore, StoreStats};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    /// Served from this process's store.
    Hit,
    /// Owned here, loaded from the origin and stored.
    Miss,
    /// Served by the owning peer from its memory.
    RemoteHit,
    /// The owning peer loaded it from the origin.
    RemoteMiss,
    /// The owning peer failed; loaded from the origin and not stored.
    Fallback,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::RemoteHit => "REMOTE_HIT",
            CacheStatus::RemoteMiss => "REMOTE_MISS",
            CacheStatus::Fallback => "FALLBACK",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lookup {
    pub value: Bytes,
    pub status: CacheStatus,
}

#[derive(Clone, Debug)]
pub struct GroupOptions {
    pub name: String,
    pub capacity_bytes: u64,
    pub replicas: usize,
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    local_hits: AtomicU64,
    peer_loads: AtomicU64,
    peer_errors: AtomicU64,
    origin_loads: AtomicU64,
    origin_errors: AtomicU64,
    loads_deduped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    pub gets: u64,
    pub local_hits: u64,
    pub peer_loads: u64,
    pub peer_errors: u64,
    pub origin_loads: u64,
    pub origin_errors: u64,
    pub loads_deduped: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Cheap to clone; clones share the store, the ring and the in-flight loads.
#[derive(Clone)]
pub struct CacheGroup {
    name: Arc<str>,
    peers: Arc<PeerSet>,
    ring: Arc<HashRing>,
    store: Arc<LocalStore>,
    // Owned loads and forwarded loads never join each other: a peer asking
    // for a key this process is itself forwarding must not wait on that
    // forward, or two disagreeing rings would deadlock until timeout.
    owned_loads: Arc<Group<CacheKey, Result<Lookup>>>,
    forwarded_loads: Arc<Group<CacheKey, Result<Lookup>>>,
    origin: Arc<dyn Origin>,
    peer_client: Arc<dyn PeerClient>,
    counters: Arc<Counters>,
}

impl CacheGroup {
    pub fn new(
        opts: GroupOptions,
        peers: PeerSet,
        origin: Arc<dyn Origin>,
        peer_client: Arc<dyn PeerClient>,
    ) -> Self {
        let ring = HashRing::new(peers.all(), opts.replicas);
        log::info!(
            "cache group {:?}: self={:?} peers={} replicas={} capacity={}B",
            opts.name,
            peers.local().address(),
            ring.peers().len(),
            ring.replicas(),
            opts.capacity_bytes
        );
        Self {
            name: Arc::from(opts.name.as_str()),
            peers: Arc::new(peers),
            ring: Arc::new(ring),
            store: Arc::new(LocalStore::new(opts.capacity_bytes)),
            owned_loads: Arc::new(Group::new()),
            forwarded_loads: Arc::new(Group::new()),
            origin,
            peer_client,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// The peer that owns `key`, or `None` when this process does.
    pub fn remote_owner(&self, key: &CacheKey) -> Option<&Peer> {
        let owner = self.ring.owner(key.as_bytes())?;
        if self.peers.is_local(owner) {
            None
        } else {
            Some(owner)
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Bytes> {
        self.lookup(key).await.map(|found| found.value)
    }

    pub async fn lookup(&self, key: &CacheKey) -> Result<Lookup> {
        bump(&self.counters.gets);
        if let Some(found) = self.lookup_store(key) {
            return Ok(found);
        }
        match self.remote_owner(key).cloned() {
            Some(peer) => self.load_forwarded(key.clone(), peer).await,
            None => self.load_owned(key.clone()).await,
        }
    }

    /// Resolves `key` as its owner: never forwards to another peer.
    pub async fn get_owned(&self, key: &CacheKey) -> Result<Lookup> {
        bump(&self.counters.gets);
        if let Some(found) = self.lookup_store(key) {
            return Ok(found);
        }
        self.load_owned(key.clone()).await
    }

    pub fn stats(&self) -> GroupStats {
        let c = &self.counters;
        GroupStats {
            gets: c.gets.load(Ordering::Relaxed),
            local_hits: c.local_hits.load(Ordering::Relaxed),
            peer_loads: c.peer_loads.load(Ordering::Relaxed),
            peer_errors: c.peer_errors.load(Ordering::Relaxed),
            origin_loads: c.origin_loads.load(Ordering::Relaxed),
            origin_errors: c.origin_errors.load(Ordering::Relaxed),
            loads_deduped: c.loads_deduped.load(Ordering::Relaxed),
        }
    }

    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    fn lookup_store(&self, key: &CacheKey) -> Option<Lookup> {
        let value = self.store.get(key)?;
        bump(&self.counters.local_hits);
        Some(Lookup {
            value,
            status: CacheStatus::Hit,
        })
    }

    async fn load_owned(&self, key: CacheKey) -> Result<Lookup> {
        let this = self.clone();
        let (result, shared) = self
            .owned_loads
            .do_call_shared(key.clone(), move || async move { this.load_locally(key).await })
            .await;
        if shared {
            bump(&self.counters.loads_deduped);
        }
        result?
    }

    async fn load_forwarded(&self, key: CacheKey, peer: Peer) -> Result<Lookup> {
        let this = self.clone();
        let (result, shared) = self
            .forwarded_loads
            .do_call_shared(key.clone(), move || async move { this.load_from_peer(key, peer).await })
            .await;
        if shared {
            bump(&self.counters.loads_deduped);
        }
        result?
    }

    async fn load_locally(&self, key: CacheKey) -> Result<Lookup> {
        // A flight that finished just before this one started may have filled it.
        if let Some(found) = self.lookup_store(&key) {
            return Ok(found);
        }
        let value = self.fetch_origin(&key).await?;
        self.store.put(key, value.clone());
        metrics::set_store_bytes(self.store.size());
        Ok(Lookup {
            value,
            status: CacheStatus::Miss,
        })
    }

    async fn load_from_peer(&self, key: CacheKey, peer: Peer) -> Result<Lookup> {
        bump(&self.counters.peer_loads);
        match self.peer_client.fetch(&peer, &self.name, &key).await {
            Ok(fetched) => {
                metrics::record_peer_fetch("ok");
                Ok(Lookup {
                    value: fetched.value,
                    status: if fetched.hit {
                        CacheStatus::RemoteHit
                    } else {
                        CacheStatus::RemoteMiss
                    },
                })
            }
            Err(err) => {
                bump(&self.counters.peer_errors);
                metrics::record_peer_fetch(err.kind());
                log::warn!("peer load of {} from {} failed, loading from origin: {}", key, peer, err);
                let value = self.fetch_origin(&key).await?;
                Ok(Lookup {
                    value,
                    status: CacheStatus::Fallback,
                })
            }
        }
    }

    async fn fetch_origin(&self, key: &CacheKey) -> Result<Bytes> {
        let req = KeyCodec::decode(key)?;
        bump(&self.counters.origin_loads);
        match self.origin.fetch(req).await {
            Ok(resp) => {
                metrics::record_origin_fetch("ok");
                Ok(response::encode(&resp))
            }
            Err(err) => {
                bump(&self.counters.origin_errors);
                metrics::record_origin_fetch(err.kind());
                log::warn!("origin load of {} failed: {}", key, err);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use http::{HeaderMap, Method, StatusCode};

    use super::*;
    use crate::codec::{CachedResponse, ProxyRequest};
    use crate::error::Error;
    use crate::peer::PeerFetch;
    use crate::BoxFuture;

    struct CountingOrigin {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingOrigin {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Origin for CountingOrigin {
        fn fetch(&self, req: ProxyRequest) -> BoxFuture<Result<CachedResponse>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if fail {
                    return Err(Error::OriginUnavailable("connection refused".to_string()));
                }
                let mut headers = HeaderMap::new();
                headers.insert("content-length", "3".parse().unwrap());
                let body = if req.target == "/a" { "abc" } else { "xyz" };
                Ok(CachedResponse::new(StatusCode::OK, headers, Bytes::from(body)))
            })
        }
    }

    struct StubPeers {
        calls: AtomicUsize,
        answer: Result<PeerFetch>,
    }

    impl StubPeers {
        fn new(answer: Result<PeerFetch>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                answer,
            })
        }
    }

    impl PeerClient for StubPeers {
        fn fetch(&self, _peer: &Peer, _group: &str, _key: &CacheKey) -> BoxFuture<Result<PeerFetch>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.answer.clone();
            Box::pin(async move { answer })
        }
    }

    fn options(capacity: u64) -> GroupOptions {
        GroupOptions {
            name: "http".to_string(),
            capacity_bytes: capacity,
            replicas: 50,
        }
    }

    fn standalone(origin: Arc<CountingOrigin>) -> CacheGroup {
        CacheGroup::new(options(1 << 20), PeerSet::new("", &[]), origin, StubPeers::new(Err(Error::StreamClosed)))
    }

    fn two_peers(origin: Arc<CountingOrigin>, peers: Arc<StubPeers>) -> CacheGroup {
        let set = PeerSet::new("self:1", &["self:1".to_string(), "other:1".to_string()]);
        CacheGroup::new(options(1 << 20), set, origin, peers)
    }

    fn key_for(target: &str) -> CacheKey {
        KeyCodec::default().encode(&ProxyRequest::new(Method::GET, target).with_header("host", "example.com"))
    }

    fn remote_key(group: &CacheGroup) -> CacheKey {
        (0..)
            .map(|i| key_for(&format!("/r{i}")))
            .find(|key| group.remote_owner(key).is_some())
            .unwrap()
    }

    fn local_key(group: &CacheGroup) -> CacheKey {
        (0..)
            .map(|i| key_for(&format!("/l{i}")))
            .find(|key| group.remote_owner(key).is_none())
            .unwrap()
    }

    #[tokio::test]
    async fn first_get_loads_then_hits() {
        let origin = CountingOrigin::new(false);
        let group = standalone(origin.clone());
        let key = key_for("/a");

        let first = group.lookup(&key).await.unwrap();
        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(response::decode(&first.value).unwrap().body, Bytes::from("abc"));
        assert_eq!(origin.calls(), 1);

        let second = group.lookup(&key).await.unwrap();
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.value, first.value);
        assert_eq!(origin.calls(), 1);

        let stats = group.stats();
        assert_eq!(stats.gets, 2);
        assert_eq!(stats.local_hits, 1);
        assert_eq!(stats.origin_loads, 1);
    }

    #[tokio::test]
    async fn concurrent_gets_fetch_once() {
        let origin = CountingOrigin::new(false);
        let group = standalone(origin.clone());
        let key = key_for("/a");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let group = group.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { group.get(&key).await }));
        }
        for handle in handles {
            let blob = handle.await.unwrap().unwrap();
            assert_eq!(response::decode(&blob).unwrap().body, Bytes::from("abc"));
        }
        assert_eq!(origin.calls(), 1);
        assert_eq!(group.store().len(), 1);
    }

    #[tokio::test]
    async fn failed_loads_are_shared_and_not_cached() {
        let origin = CountingOrigin::new(true);
        let group = standalone(origin.clone());
        let key = key_for("/a");

        let (a, b) = tokio::join!(group.get(&key), group.get(&key));
        assert!(matches!(a, Err(Error::OriginUnavailable(_))));
        assert_eq!(a, b);
        assert_eq!(origin.calls(), 1);
        assert!(group.store().is_empty());

        let _ = group.get(&key).await;
        assert_eq!(origin.calls(), 2);
        assert_eq!(group.stats().origin_errors, 2);
    }

    #[tokio::test]
    async fn malformed_key_never_reaches_origin() {
        let origin = CountingOrigin::new(false);
        let group = standalone(origin.clone());
        let err = group.get(&CacheKey::from_bytes("not a request")).await.unwrap_err();
        assert!(matches!(err, Error::KeyDecode(_)));
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test]
    async fn remote_owner_answer_is_not_stored() {
        let origin = CountingOrigin::new(false);
        let peers = StubPeers::new(Ok(PeerFetch {
            value: Bytes::from("blob"),
            hit: true,
        }));
        let group = two_peers(origin.clone(), peers.clone());
        let key = remote_key(&group);

        let found = group.lookup(&key).await.unwrap();
        assert_eq!(found.status, CacheStatus::RemoteHit);
        assert_eq!(found.value, Bytes::from("blob"));
        assert_eq!(origin.calls(), 0);
        assert!(group.store().is_empty());

        // Not stored, so the next get asks the owner again.
        group.lookup(&key).await.unwrap();
        assert_eq!(peers.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn peer_failure_falls_back_to_origin_without_storing() {
        let origin = CountingOrigin::new(false);
        let peers = StubPeers::new(Err(Error::PeerUnavailable {
            peer: "other:1".to_string(),
            reason: "connection refused".to_string(),
        }));
        let group = two_peers(origin.clone(), peers);
        let key = remote_key(&group);

        let found = group.lookup(&key).await.unwrap();
        assert_eq!(found.status, CacheStatus::Fallback);
        assert_eq!(origin.calls(), 1);
        assert!(group.store().is_empty());
        assert_eq!(group.stats().peer_errors, 1);
    }

    #[tokio::test]
    async fn owned_keys_never_touch_peers() {
        let origin = CountingOrigin::new(false);
        let peers = StubPeers::new(Err(Error::StreamClosed));
        let group = two_peers(origin.clone(), peers.clone());
        let key = local_key(&group);

        assert_eq!(group.lookup(&key).await.unwrap().status, CacheStatus::Miss);
        assert_eq!(peers.calls.load(Ordering::SeqCst), 0);
        assert_eq!(group.store().len(), 1);
    }

    #[tokio::test]
    async fn get_owned_loads_remote_keys_locally() {
        let origin = CountingOrigin::new(false);
        let peers = StubPeers::new(Err(Error::StreamClosed));
        let group = two_peers(origin.clone(), peers.clone());
        let key = remote_key(&group);

        let found = group.get_owned(&key).await.unwrap();
        assert_eq!(found.status, CacheStatus::Miss);
        assert_eq!(peers.calls.load(Ordering::SeqCst), 0);
        assert_eq!(group.store().len(), 1);
        assert_eq!(group.get_owned(&key).await.unwrap().status, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn small_capacity_keeps_three_byte_body() {
        let origin = CountingOrigin::new(false);
        let group = CacheGroup::new(options(4096), PeerSet::new("", &[]), origin, StubPeers::new(Err(Error::StreamClosed)));
        let key = key_for("/a");
        let blob = group.get(&key).await.unwrap();
        assert_eq!(group.store().size(), blob.len() as u64);
        assert_eq!(response::decode(&blob).unwrap().content_length(), Some(3));
    }

    #[tokio::test]
    async fn peer_timeout_falls_back_to_origin() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let origin = CountingOrigin::new(false);
        let set = PeerSet::new("self:1", &["self:1".to_string(), silent]);
        let client = Arc::new(crate::peer::HttpPeerClient::new(Duration::from_millis(200)));
        let group = CacheGroup::new(options(1 << 20), set, origin.clone(), client);
        let key = remote_key(&group);

        let started = std::time::Instant::now();
        let found = group.lookup(&key).await.unwrap();
        assert_eq!(found.status, CacheStatus::Fallback);
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
        assert_eq!(origin.calls(), 1);
        assert!(group.store().is_empty());
        assert_eq!(group.stats().peer_errors, 1);
    }
}
