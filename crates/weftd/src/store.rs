//! Per-device append-only event stores
//!
//! Any key->blob backend satisfies the contract: idempotent insert keyed by
//! content hash, point lookup, and iteration ordered by `created_at` with
//! ties broken by event-id byte order. The sled store is the production
//! backend; the memory store backs simulation.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use thiserror::Error;
use weft_core::codec::event_id_for;
use weft_core::types::{EventId, EventRecord};

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Ciphertext hash does not match the record's event id.
    #[error("corrupt event id: ciphertext hashes to {computed}, record claims {claimed}")]
    CorruptId { computed: String, claimed: String },
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

impl From<sled::Error> for StoreError {
    fn from(e: sled::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Insert result: the store is idempotent, re-inserting a known id is a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// The per-device record log. Single writer, concurrent readers.
pub trait EventStore: Send + Sync {
    fn insert(&self, record: EventRecord) -> Result<InsertOutcome, StoreError>;
    fn get(&self, id: &EventId) -> Result<Option<EventRecord>, StoreError>;
    fn contains(&self, id: &EventId) -> Result<bool, StoreError>;
    fn count(&self) -> usize;
    /// Ascending by `created_at`, ties by event-id byte order. A late-arriving
    /// older event sorts before newer events regardless of insertion order.
    fn iter_by_created_at(
        &self,
    ) -> Box<dyn Iterator<Item = Result<EventRecord, StoreError>> + Send + '_>;
}

fn validate_content_address(record: &EventRecord) -> Result<(), StoreError> {
    let computed = event_id_for(&record.ciphertext);
    if computed != record.event_id {
        return Err(StoreError::CorruptId {
            computed: hex::encode(computed.0),
            claimed: hex::encode(record.event_id.0),
        });
    }
    Ok(())
}

// =============================================================================
// MEMORY STORE
// =============================================================================

#[derive(Default)]
struct MemoryInner {
    records: HashMap<EventId, EventRecord>,
    /// Secondary index in exposed iteration order.
    order: BTreeSet<(i64, EventId)>,
}

/// In-memory store used by the simulator and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for MemoryStore {
    fn insert(&self, record: EventRecord) -> Result<InsertOutcome, StoreError> {
        validate_content_address(&record)?;
        let mut inner = self.inner.write();
        if inner.records.contains_key(&record.event_id) {
            return Ok(InsertOutcome::Duplicate);
        }
        inner.order.insert((record.created_at, record.event_id));
        inner.records.insert(record.event_id, record);
        Ok(InsertOutcome::Inserted)
    }

    fn get(&self, id: &EventId) -> Result<Option<EventRecord>, StoreError> {
        Ok(self.inner.read().records.get(id).cloned())
    }

    fn contains(&self, id: &EventId) -> Result<bool, StoreError> {
        Ok(self.inner.read().records.contains_key(id))
    }

    fn count(&self) -> usize {
        self.inner.read().records.len()
    }

    fn iter_by_created_at(
        &self,
    ) -> Box<dyn Iterator<Item = Result<EventRecord, StoreError>> + Send + '_> {
        // Snapshot under the read lock; readers never block the writer.
        let inner = self.inner.read();
        let records: Vec<EventRecord> = inner
            .order
            .iter()
            .filter_map(|(_, id)| inner.records.get(id).cloned())
            .collect();
        Box::new(records.into_iter().map(Ok))
    }
}

// =============================================================================
// SLED STORE
// =============================================================================

/// Order-preserving big-endian encoding for signed timestamps.
fn order_key(created_at: i64, id: &EventId) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..8].copy_from_slice(&((created_at as u64) ^ (1 << 63)).to_be_bytes());
    key[8..].copy_from_slice(&id.0);
    key
}

/// Persistent store backed by sled.
pub struct SledStore {
    db: sled::Db,
    /// event_id -> EventRecord
    events: sled::Tree,
    /// (created_at, event_id) -> event_id
    order: sled::Tree,
}

impl SledStore {
    /// Open storage at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let events = db.open_tree("events")?;
        let order = db.open_tree("created_at_order")?;
        Ok(Self { db, events, order })
    }

    /// Flush all pending writes.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl EventStore for SledStore {
    fn insert(&self, record: EventRecord) -> Result<InsertOutcome, StoreError> {
        validate_content_address(&record)?;
        if self.events.contains_key(record.event_id.0)? {
            return Ok(InsertOutcome::Duplicate);
        }
        let value = postcard::to_allocvec(&record)?;
        self.events.insert(record.event_id.0, value)?;
        self.order.insert(
            order_key(record.created_at, &record.event_id),
            &record.event_id.0[..],
        )?;
        Ok(InsertOutcome::Inserted)
    }

    fn get(&self, id: &EventId) -> Result<Option<EventRecord>, StoreError> {
        match self.events.get(id.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn contains(&self, id: &EventId) -> Result<bool, StoreError> {
        Ok(self.events.contains_key(id.0)?)
    }

    fn count(&self) -> usize {
        self.events.len()
    }

    fn iter_by_created_at(
        &self,
    ) -> Box<dyn Iterator<Item = Result<EventRecord, StoreError>> + Send + '_> {
        Box::new(self.order.iter().map(move |entry| {
            let (_, id_bytes) = entry?;
            let id: [u8; 16] = id_bytes
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Backend("malformed order index entry".into()))?;
            match self.events.get(id)? {
                Some(bytes) => Ok(postcard::from_bytes(&bytes)?),
                None => Err(StoreError::Backend(format!(
                    "order index points at missing event {}",
                    hex::encode(id)
                ))),
            }
        }))
    }
}
