//! Byte-bounded LRU store for the keys this process owns.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;
use serde::Serialize;

use crate::codec::CacheKey;

pub const DEFAULT_CAPACITY_BYTES: u64 = 3_000_000;

#[derive(Debug)]
struct CacheEntry {
    value: Bytes,
    size: u64,
    sequence: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub items: u64,
    pub bytes: u64,
    pub capacity: u64,
    pub gets: u64,
    pub hits: u64,
    pub evictions: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    map: HashMap<CacheKey, CacheEntry>,
    // Recency queue, oldest first. A record is live only while its sequence
    // matches the entry's; everything else is skipped on eviction.
    order: VecDeque<(CacheKey, u64)>,
    next_sequence: u64,
    bytes: u64,
    gets: u64,
    hits: u64,
    evictions: u64,
}

impl StoreInner {
    fn touch(&mut self, key: &CacheKey) -> Option<Bytes> {
        let sequence = self.next_sequence + 1;
        let entry = self.map.get_mut(key)?;
        self.next_sequence = sequence;
        entry.sequence = sequence;
        let value = entry.value.clone();
        self.order.push_back((key.clone(), sequence));
        self.compact();
        Some(value)
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, sequence)) = self.order.pop_front() {
            let live = self.map.get(&key).map(|e| e.sequence == sequence).unwrap_or(false);
            if !live {
                continue;
            }
            if let Some(entry) = self.map.remove(&key) {
                self.bytes -= entry.size;
                self.evictions += 1;
                log::debug!("local store evicted {} ({} bytes)", key, entry.size);
            }
            return true;
        }
        false
    }

    fn compact(&mut self) {
        if self.order.len() <= self.map.len() * 2 + 64 {
            return;
        }
        let map = &self.map;
        self.order
            .retain(|(key, sequence)| map.get(key).map(|e| e.sequence == *sequence).unwrap_or(false));
    }
}

/// Every operation, including a hit that only refreshes recency, takes the
/// single store mutex.
#[derive(Debug)]
pub struct LocalStore {
    capacity: u64,
    inner: Mutex<StoreInner>,
}

impl LocalStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn get(&self, key: &CacheKey) -> Option<Bytes> {
        let mut inner = self.inner.lock().expect("local store");
        inner.gets += 1;
        let value = inner.touch(key)?;
        inner.hits += 1;
        Some(value)
    }

    /// Stores `value`, evicting least recently used entries until it fits.
    /// Returns false when the value alone is larger than the capacity, in
    /// which case nothing changes.
    pub fn put(&self, key: CacheKey, value: Bytes) -> bool {
        let size = value.len() as u64;
        if size > self.capacity {
            log::debug!(
                "local store skipped {}: {} bytes exceeds capacity {}",
                key,
                size,
                self.capacity
            );
            return false;
        }

        let mut inner = self.inner.lock().expect("local store");
        if let Some(old) = inner.map.remove(&key) {
            inner.bytes -= old.size;
        }
        while inner.bytes + size > self.capacity {
            if !inner.evict_oldest() {
                break;
            }
        }
        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        inner.order.push_back((key.clone(), sequence));
        inner.map.insert(
            key,
            CacheEntry {
                value,
                size,
                sequence,
            },
        );
        inner.bytes += size;
        inner.compact();
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("local store").map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().expect("local store").bytes
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().expect("local store");
        StoreStats {
            items: inner.map.len() as u64,
            bytes: inner.bytes,
            capacity: self.capacity,
            gets: inner.gets,
            hits: inner.hits,
            evictions: inner.evictions,
        }
    }
}
