//! Prioritized scan over the local log for sync selection
//!
//! Fresh events go out within one round of a peer becoming reachable; older
//! events are revisited round-robin so a stable peer filter still eventually
//! sees the whole log.

use std::collections::HashMap;
use weft_core::bloom::{BloomFilter, Membership};
use weft_core::config::SyncConfig;
use weft_core::types::{DeviceId, EventId};

use crate::store::{EventStore, StoreError};

#[derive(Clone, Copy, Debug)]
struct ScanEntry {
    event_id: EventId,
    created_at: i64,
}

/// The prioritized walk used to select events to send. Refreshed from the
/// store whenever it has grown.
pub struct ScanQueue {
    recency_window_ms: u64,
    recent_batch: usize,
    older_batch: usize,
    max_per_round: usize,
    /// Events inside the recency window, newest first.
    recent: Vec<ScanEntry>,
    /// Everything else, ascending by age.
    older: Vec<ScanEntry>,
    /// Per-peer position into the older ring.
    cursors: HashMap<DeviceId, usize>,
    dirty: bool,
    indexed_count: usize,
}

impl ScanQueue {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            recency_window_ms: config.recency_window_ms,
            recent_batch: config.recent_batch,
            older_batch: config.older_batch,
            max_per_round: config.max_per_round,
            recent: Vec::new(),
            older: Vec::new(),
            cursors: HashMap::new(),
            dirty: true,
            indexed_count: 0,
        }
    }

    /// Flag that the store changed under us.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn needs_refresh(&self, store_count: usize) -> bool {
        self.dirty || store_count != self.indexed_count
    }

    /// Rebuild the recent/older partition from the store. Peer cursors are
    /// kept; they wrap modulo the new older-set size.
    pub fn refresh(&mut self, store: &dyn EventStore, now_ms: u64) -> Result<(), StoreError> {
        let cutoff = now_ms as i64 - self.recency_window_ms as i64;
        self.recent.clear();
        self.older.clear();
        for record in store.iter_by_created_at() {
            let record = record?;
            let entry = ScanEntry {
                event_id: record.event_id,
                created_at: record.created_at,
            };
            if entry.created_at >= cutoff {
                self.recent.push(entry);
            } else {
                self.older.push(entry);
            }
        }
        // Store iteration is oldest-first; the recent set walks newest-first.
        self.recent.reverse();
        self.indexed_count = self.recent.len() + self.older.len();
        self.dirty = false;
        Ok(())
    }

    /// Pick events the peer's filter does not contain.
    ///
    /// Walks the recent set newest-first, collecting up to `recent_batch`
    /// entries the filter lacks (entries the peer already has cost nothing),
    /// then examines `older_batch` older entries from this peer's cursor; the
    /// cursor then advances by `older_batch` modulo the older-set size. Never
    /// returns more than `max_per_round` events.
    pub fn select_events_to_send(
        &mut self,
        peer: DeviceId,
        peer_filter: &BloomFilter,
    ) -> Vec<EventId> {
        let mut out = Vec::new();
        let recent_budget = self.recent_batch.min(self.max_per_round);

        for entry in self.recent.iter() {
            if out.len() >= recent_budget {
                break;
            }
            if peer_filter.test(&entry.event_id) == Membership::DefinitelyAbsent {
                out.push(entry.event_id);
            }
        }

        if !self.older.is_empty() {
            let len = self.older.len();
            let cursor = self.cursors.get(&peer).copied().unwrap_or(0) % len;
            for i in 0..self.older_batch.min(len) {
                if out.len() >= self.max_per_round {
                    break;
                }
                let entry = &self.older[(cursor + i) % len];
                if peer_filter.test(&entry.event_id) == Membership::DefinitelyAbsent {
                    out.push(entry.event_id);
                }
            }
            self.cursors.insert(peer, (cursor + self.older_batch) % len);
        }

        out
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn older_len(&self) -> usize {
        self.older.len()
    }
}
