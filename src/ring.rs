use std::collections::HashSet;
use std::fmt;

use crc32fast::Hasher;

pub const DEFAULT_REPLICAS: usize = 50;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Peer {
    address: String,
}

impl Peer {
    /// `http://10.0.0.1:4000/` and `10.0.0.1:4000` name the same peer.
    pub fn new(address: &str) -> Self {
        let trimmed = address.trim();
        let without_scheme = trimmed
            .strip_prefix("http://")
            .unwrap_or(trimmed);
        Self {
            address: without_scheme.trim_end_matches('/').to_string(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// The configured fleet as seen from one process.
#[derive(Clone, Debug)]
pub struct PeerSet {
    local: Peer,
    all: Vec<Peer>,
}

impl PeerSet {
    /// Builds the set from the configured addresses. Blank entries and
    /// duplicates are dropped; the local peer is always a member.
    pub fn new(local: &str, addresses: &[String]) -> Self {
        let local = Peer::new(local);
        let mut seen = HashSet::new();
        let mut all: Vec<Peer> = addresses
            .iter()
            .filter(|addr| !addr.trim().is_empty())
            .map(|addr| Peer::new(addr))
            .filter(|peer| seen.insert(peer.clone()))
            .collect();
        if !local.address.is_empty() && !seen.contains(&local) {
            all.insert(0, local.clone());
        }
        Self { local, all }
    }

    pub fn local(&self) -> &Peer {
        &self.local
    }

    pub fn all(&self) -> &[Peer] {
        &self.all
    }

    pub fn remotes(&self) -> impl Iterator<Item = &Peer> {
        self.all.iter().filter(move |peer| **peer != self.local)
    }

    pub fn is_local(&self, peer: &Peer) -> bool {
        *peer == self.local
    }
}

#[derive(Clone)]
struct RingEntry {
    hash: u32,
    peer_index: usize,
}

/// Consistent-hash ring over a fixed peer set. Immutable once built.
pub struct HashRing {
    replicas: usize,
    peers: Vec<Peer>,
    ring: Vec<RingEntry>,
}

impl HashRing {
    pub fn new(peers: &[Peer], replicas: usize) -> Self {
        // Sorting makes the ring a function of the peer set, not of list order.
        let mut peers: Vec<Peer> = peers.to_vec();
        peers.sort();
        peers.dedup();
        let replicas = replicas.max(1);
        Self {
            ring: build_ring(&peers, replicas),
            replicas,
            peers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn owner(&self, key: &[u8]) -> Option<&Peer> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = hash_bytes(key);
        let idx = self.ring.partition_point(|entry| entry.hash < hash);
        let entry = if idx >= self.ring.len() {
            &self.ring[0]
        } else {
            &self.ring[idx]
        };
        Some(&self.peers[entry.peer_index])
    }
}

fn build_ring(peers: &[Peer], replicas: usize) -> Vec<RingEntry> {
    let mut ring = Vec::with_capacity(peers.len() * replicas);
    for (idx, peer) in peers.iter().enumerate() {
        for replica in 0..replicas {
            let key = format!("{}{}", replica, peer.address());
            ring.push(RingEntry {
                hash: hash_bytes(key.as_bytes()),
                peer_index: idx,
            });
        }
    }
    // Peers are sorted, so equal hashes resolve to the same peer everywhere.
    ring.sort_by(|a, b| a.hash.cmp(&b.hash).then(a.peer_index.cmp(&b.peer_index)));
    ring
}

fn hash_bytes(input: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(input);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn peers(addrs: &[&str]) -> Vec<Peer> {
        addrs.iter().map(|a| Peer::new(a)).collect()
    }

    #[test]
    fn owner_is_stable_across_calls_and_instances() {
        let a = HashRing::new(&peers(&["10.0.0.1:4000", "10.0.0.2:4000", "10.0.0.3:4000"]), DEFAULT_REPLICAS);
        let b = HashRing::new(&peers(&["10.0.0.3:4000", "http://10.0.0.1:4000/", "10.0.0.2:4000"]), DEFAULT_REPLICAS);
        for i in 0..500 {
            let key = format!("GET /tiles/{i} HTTP/1.1\r\n\r\n");
            let first = a.owner(key.as_bytes()).cloned();
            assert_eq!(a.owner(key.as_bytes()).cloned(), first);
            assert_eq!(b.owner(key.as_bytes()).cloned(), first);
        }
    }

    #[test]
    fn keys_spread_over_every_peer() {
        let ring = HashRing::new(&peers(&["a:1", "b:1", "c:1"]), DEFAULT_REPLICAS);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for i in 0..3000 {
            let owner = ring.owner(format!("key-{i}").as_bytes()).unwrap();
            *counts.entry(owner.address().to_string()).or_default() += 1;
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|n| *n > 300), "{counts:?}");
    }

    #[test]
    fn owner_wraps_past_the_last_position() {
        let ring = HashRing::new(&peers(&["only:1"]), 3);
        let last = ring.ring.last().unwrap().hash;
        // Any key hashing past the last position belongs to the first entry.
        let key = (0u32..)
            .map(|i| format!("wrap-{i}"))
            .find(|k| hash_bytes(k.as_bytes()) > last)
            .unwrap();
        assert_eq!(ring.owner(key.as_bytes()).unwrap().address(), "only:1");
    }

    #[test]
    fn removing_a_peer_only_moves_its_keys() {
        let full = HashRing::new(&peers(&["a:1", "b:1", "c:1"]), DEFAULT_REPLICAS);
        let reduced = HashRing::new(&peers(&["a:1", "b:1"]), DEFAULT_REPLICAS);
        for i in 0..1000 {
            let key = format!("k{i}");
            let before = full.owner(key.as_bytes()).unwrap();
            if before.address() != "c:1" {
                assert_eq!(reduced.owner(key.as_bytes()).unwrap(), before);
            }
        }
    }

    #[test]
    fn empty_ring_has_no_owner() {
        let ring = HashRing::new(&[], DEFAULT_REPLICAS);
        assert!(ring.is_empty());
        assert!(ring.owner(b"anything").is_none());
    }

    #[test]
    fn peer_set_filters_self_without_skipping_neighbours() {
        let addrs: Vec<String> = ["b:1", "a:1", "a:1", "", "c:1"].iter().map(|s| s.to_string()).collect();
        let set = PeerSet::new("a:1", &addrs);
        let all: Vec<_> = set.all().iter().map(|p| p.address()).collect();
        assert_eq!(all, vec!["b:1", "a:1", "c:1"]);
        let remotes: Vec<_> = set.remotes().map(|p| p.address()).collect();
        assert_eq!(remotes, vec!["b:1", "c:1"]);
        assert!(set.is_local(&Peer::new("http://a:1")));
    }

    #[test]
    fn peer_set_always_contains_self() {
        let set = PeerSet::new("me:1", &["other:1".to_string()]);
        let all: Vec<_> = set.all().iter().map(|p| p.address()).collect();
        assert_eq!(all, vec!["me:1", "other:1"]);
    }
}
