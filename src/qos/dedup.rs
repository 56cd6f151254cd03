//! Inbound packet-id dedup cache
//!
//! A bounded map of recently-seen inbound packet identifiers. At capacity
//! the oldest entry by insertion time is evicted; a periodic sweep drops
//! entries older than the retention window regardless of pressure.

use std::time::{Duration, Instant};

use ahash::AHashMap;

/// How long a remembered packet id stays relevant
pub(crate) const DEDUP_RETENTION: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub(crate) struct DedupCache {
    entries: AHashMap<u16, Instant>,
    capacity: usize,
}

impl DedupCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: AHashMap::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Remember a packet id, evicting the oldest entry when full
    pub(crate) fn insert(&mut self, packet_id: u16) {
        if !self.entries.contains_key(&packet_id) && self.entries.len() >= self.capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, inserted_at)| **inserted_at)
                .map(|(id, _)| *id)
            {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(packet_id, Instant::now());
    }

    pub(crate) fn contains(&self, packet_id: u16) -> bool {
        self.entries.contains_key(&packet_id)
    }

    pub(crate) fn remove(&mut self, packet_id: u16) -> bool {
        self.entries.remove(&packet_id).is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop entries older than `max_age`; returns how many were removed
    pub(crate) fn cleanup(&mut self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, inserted_at| now.duration_since(*inserted_at) < max_age);
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
