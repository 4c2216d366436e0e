use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, trace, warn};

use crate::models::VideoId;

/// Cache key of one segment payload
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub video_id: VideoId,
    pub index: usize,
}

impl SegmentKey {
    pub fn new(video_id: VideoId, index: usize) -> Self {
        Self { video_id, index }
    }
}

/// A resident payload
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Bytes,
}

impl CacheEntry {
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Result of an insert: whether the payload became resident and what was evicted for it
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    pub stored: bool,
    pub evicted: Vec<SegmentKey>,
}

/// Byte-budgeted segment store with coarse insertion-order eviction.
///
/// The LRU list is only ever touched by `put`, never by lookups, so its order is
/// insertion order and `pop_lru` yields the oldest insert.
pub struct SegmentCache {
    entries: LruCache<SegmentKey, CacheEntry>,
    current_size: u64,
    budget: u64,
}

impl SegmentCache {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            current_size: 0,
            budget: budget_bytes,
        }
    }

    /// Insert a payload, evicting the oldest half of the entries (repeatedly, if a
    /// single round does not free enough) when it would not fit.
    ///
    /// Payloads larger than the whole budget are rejected and evict nothing.
    pub fn insert(&mut self, key: SegmentKey, payload: Bytes) -> InsertOutcome {
        let size = payload.len() as u64;
        if size > self.budget {
            warn!(
                "Segment {} of {} is {} bytes, larger than the {} byte budget; not caching",
                key.index, key.video_id, size, self.budget
            );
            return InsertOutcome::default();
        }

        if let Some(previous) = self.entries.pop(&key) {
            self.current_size -= previous.size();
        }

        let mut evicted = Vec::new();
        while self.current_size + size > self.budget && !self.entries.is_empty() {
            evicted.extend(self.evict_oldest_half());
        }

        self.entries.put(key, CacheEntry { payload });
        self.current_size += size;

        trace!(
            "Cache now holds {} entries, {}/{} bytes",
            self.entries.len(),
            self.current_size,
            self.budget
        );

        InsertOutcome {
            stored: true,
            evicted,
        }
    }

    fn evict_oldest_half(&mut self) -> Vec<SegmentKey> {
        let count = (self.entries.len() / 2).max(1);
        let mut evicted = Vec::with_capacity(count);

        for _ in 0..count {
            match self.entries.pop_lru() {
                Some((key, entry)) => {
                    self.current_size -= entry.size();
                    evicted.push(key);
                }
                None => break,
            }
        }

        debug!(
            "Evicted {} cache entries, {} bytes remain resident",
            evicted.len(),
            self.current_size
        );
        evicted
    }

    pub fn get(&self, key: &SegmentKey) -> Option<&Bytes> {
        self.entries.peek(key).map(|entry| &entry.payload)
    }

    pub fn contains(&self, key: &SegmentKey) -> bool {
        self.entries.contains(key)
    }

    pub fn remove(&mut self, key: &SegmentKey) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.current_size -= entry.size();
        Some(entry)
    }

    /// Drop every payload of one video, returning how many were resident
    pub fn remove_video(&mut self, video_id: &VideoId) -> usize {
        let keys: Vec<SegmentKey> = self
            .entries
            .iter()
            .filter(|(key, _)| &key.video_id == video_id)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_size = 0;
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of resident payload sizes, computed from scratch
    pub fn resident_size(&self) -> u64 {
        self.entries.iter().map(|(_, entry)| entry.size()).sum()
    }
}
