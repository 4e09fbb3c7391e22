//! Per-device sync engine
//!
//! Runs in response to three event kinds: local writes, timer ticks, and
//! inbound datagrams. Every entry point runs to completion before the next
//! begins on a given device; nothing is stored outside the event store and
//! the in-memory filters, so every operation is restartable.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use weft_core::bloom::{BloomFilter, CumulativeBloomFilter};
use weft_core::clock::Clock;
use weft_core::codec::{event_id_for, EventCodec, Rejected};
use weft_core::config::SyncConfig;
use weft_core::types::{DeviceId, EventId, EventPayload, EventRecord};
use weft_net::link::DatagramLink;
use weft_net::wire::{self, Datagram};

use crate::scan::ScanQueue;
use crate::store::{EventStore, InsertOutcome, StoreError};
use crate::timeline::{self, Timeline};

/// Engine errors surfaced to local callers. Inbound-path failures never
/// appear here; they are dropped and counted.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("codec error: {0}")]
    Codec(#[from] weft_core::Error),
    #[error("event too large for a single datagram: {0} bytes")]
    EventTooLarge(usize),
}

/// Most recently received digest from a peer.
#[derive(Clone, Debug)]
pub struct PeerKnowledge {
    pub filter: BloomFilter,
    pub received_at: u64,
    pub event_count: u32,
}

/// Sync progress derived from peer-advertised event counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncStatus {
    pub known_events: usize,
    pub estimated_total_events: usize,
    pub percent: u8,
    pub is_synced: bool,
}

#[derive(Default)]
struct Counters {
    events_received: AtomicU64,
    events_sent: AtomicU64,
    duplicates_dropped: AtomicU64,
    rejected_signature_unknown: AtomicU64,
    rejected_signature_invalid: AtomicU64,
    rejected_aead: AtomicU64,
    rejected_parse: AtomicU64,
    blooms_received: AtomicU64,
    blooms_malformed: AtomicU64,
    blooms_sent: AtomicU64,
    announces_received: AtomicU64,
    sends_failed: AtomicU64,
}

/// Snapshot of the engine's drop-and-count surfaces.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub events_received: u64,
    pub events_sent: u64,
    pub duplicates_dropped: u64,
    pub rejected_signature_unknown: u64,
    pub rejected_signature_invalid: u64,
    pub rejected_aead: u64,
    pub rejected_parse: u64,
    pub blooms_received: u64,
    pub blooms_malformed: u64,
    pub blooms_sent: u64,
    pub announces_received: u64,
    pub sends_failed: u64,
}

type EventObserver = Box<dyn Fn(EventId, &EventPayload) + Send + Sync>;

/// One instance per local device.
pub struct SyncEngine {
    device_id: DeviceId,
    clock: Arc<dyn Clock>,
    store: Arc<dyn EventStore>,
    codec: EventCodec,
    link: Arc<dyn DatagramLink>,
    config: SyncConfig,
    local_filter: Mutex<CumulativeBloomFilter>,
    peers: Mutex<HashMap<DeviceId, PeerKnowledge>>,
    last_sync: Mutex<HashMap<DeviceId, u64>>,
    scan: Mutex<ScanQueue>,
    counters: Counters,
    observers: Mutex<Vec<EventObserver>>,
}

impl SyncEngine {
    /// Build the engine, reload the local filter from the store, and hook the
    /// link's inbound path.
    pub fn start(
        device_id: DeviceId,
        clock: Arc<dyn Clock>,
        store: Arc<dyn EventStore>,
        codec: EventCodec,
        link: Arc<dyn DatagramLink>,
        config: SyncConfig,
    ) -> Result<Arc<Self>, EngineError> {
        config.validate()?;

        let mut ids = Vec::with_capacity(store.count());
        for record in store.iter_by_created_at() {
            ids.push(record?.event_id);
        }
        let mut filter =
            CumulativeBloomFilter::new(config.bloom_target_items, config.bloom_target_fpr);
        for id in &ids {
            filter.add(id);
        }
        // A store reloaded from disk may already exceed the initial sizing.
        while filter.is_saturated() {
            filter.rebuild(ids.iter().copied());
        }

        let engine = Arc::new(Self {
            device_id,
            clock,
            store,
            codec,
            link,
            scan: Mutex::new(ScanQueue::new(&config)),
            config,
            local_filter: Mutex::new(filter),
            peers: Mutex::new(HashMap::new()),
            last_sync: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            observers: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&engine);
        engine.link.subscribe(Arc::new(move |from, bytes: &[u8]| {
            if let Some(engine) = weak.upgrade() {
                engine.on_datagram(from, bytes);
            }
        }));

        Ok(engine)
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn codec(&self) -> &EventCodec {
        &self.codec
    }

    /// Register an observer for newly inserted events. Observers see events
    /// in insertion order and must not call back into the engine.
    pub fn subscribe(&self, observer: impl Fn(EventId, &EventPayload) + Send + Sync + 'static) {
        self.observers.lock().push(Box::new(observer));
    }

    /// Encode, persist, and optimistically broadcast a locally authored
    /// payload. Returns the new event id; re-submitting identical ciphertext
    /// is a no-op returning the same id.
    pub fn submit_local(&self, payload: &EventPayload) -> Result<EventId, EngineError> {
        let encoded = self.codec.encode(payload)?;
        let now = self.clock.now_ms();

        let datagram = wire::encode(
            self.device_id,
            &Datagram::Event {
                ciphertext: encoded.ciphertext.clone(),
                signature: encoded.signature.clone(),
            },
        )
        .map_err(|_| {
            EngineError::EventTooLarge(encoded.ciphertext.len())
        })?;

        let record = EventRecord {
            event_id: encoded.event_id,
            author: self.codec.local_device_id().unwrap_or(self.device_id),
            created_at: payload.timestamp().unwrap_or(now as i64),
            received_at: now as i64,
            ciphertext: encoded.ciphertext,
            signature: encoded.signature,
        };

        match self.store.insert(record)? {
            InsertOutcome::Duplicate => return Ok(encoded.event_id),
            InsertOutcome::Inserted => {}
        }
        self.record_inserted(encoded.event_id, payload);

        if self.link.is_online() {
            self.link.broadcast(&datagram);
            if let EventPayload::FileChunk(chunk) = payload {
                // Optional availability hint; correctness never depends on it.
                if let Ok(announce) = wire::encode(
                    self.device_id,
                    &Datagram::ChunkAnnounce {
                        prf_tag: chunk.prf_tag,
                        chunk_index: chunk.chunk_index,
                        is_parity: chunk.is_parity,
                    },
                ) {
                    self.link.broadcast(&announce);
                }
            }
        }

        Ok(encoded.event_id)
    }

    /// Inbound datagram dispatch. Every failure here is drop-and-count.
    pub fn on_datagram(&self, from: DeviceId, bytes: &[u8]) {
        match wire::decode(bytes) {
            Ok((src, Datagram::Event { ciphertext, signature })) => {
                self.handle_event(src, ciphertext, signature)
            }
            Ok((src, Datagram::Bloom { event_count, filter })) => {
                self.handle_bloom(src, event_count, &filter)
            }
            Ok((src, Datagram::ChunkAnnounce { prf_tag, .. })) => {
                self.counters.announces_received.fetch_add(1, Ordering::Relaxed);
                trace!(%src, tag = %hex::encode(prf_tag), "chunk announce");
            }
            Err(e) => {
                trace!(%from, "dropping undecodable datagram: {e}");
            }
        }
    }

    /// Advertise the local digest to any peer whose sync interval elapsed.
    pub fn sync_tick(&self) {
        if !self.link.is_online() {
            return;
        }
        self.refresh_scan_if_needed();

        let now = self.clock.now_ms();
        let bloom = {
            let filter = self.local_filter.lock();
            Datagram::Bloom {
                event_count: filter.count().min(u32::MAX as u64) as u32,
                filter: filter.serialize(),
            }
        };
        let bytes = match wire::encode(self.device_id, &bloom) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("bloom digest does not fit a datagram: {e}");
                return;
            }
        };

        for peer in self.link.peers() {
            let due = {
                let last_sync = self.last_sync.lock();
                last_sync
                    .get(&peer)
                    .map(|last| now.saturating_sub(*last) >= self.config.sync_interval_ms)
                    .unwrap_or(true)
            };
            if !due {
                continue;
            }
            match self.link.send(peer, &bytes) {
                Ok(()) => {
                    self.counters.blooms_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.counters.sends_failed.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, "bloom send failed: {e}");
                }
            }
            self.last_sync.lock().insert(peer, now);
        }
    }

    /// Progress estimate against the largest log any peer has advertised.
    pub fn sync_status(&self) -> SyncStatus {
        let known = self.store.count();
        let advertised = self
            .peers
            .lock()
            .values()
            .map(|k| k.event_count as usize)
            .max()
            .unwrap_or(0);
        let estimated = known.max(advertised);
        let percent = (100.0 * known as f64 / estimated.max(1) as f64).round() as u8;
        SyncStatus {
            known_events: known,
            estimated_total_events: estimated,
            percent,
            is_synced: percent >= 95,
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        let c = &self.counters;
        CounterSnapshot {
            events_received: c.events_received.load(Ordering::Relaxed),
            events_sent: c.events_sent.load(Ordering::Relaxed),
            duplicates_dropped: c.duplicates_dropped.load(Ordering::Relaxed),
            rejected_signature_unknown: c.rejected_signature_unknown.load(Ordering::Relaxed),
            rejected_signature_invalid: c.rejected_signature_invalid.load(Ordering::Relaxed),
            rejected_aead: c.rejected_aead.load(Ordering::Relaxed),
            rejected_parse: c.rejected_parse.load(Ordering::Relaxed),
            blooms_received: c.blooms_received.load(Ordering::Relaxed),
            blooms_malformed: c.blooms_malformed.load(Ordering::Relaxed),
            blooms_sent: c.blooms_sent.load(Ordering::Relaxed),
            announces_received: c.announces_received.load(Ordering::Relaxed),
            sends_failed: c.sends_failed.load(Ordering::Relaxed),
        }
    }

    /// Decrypt the log and join reactions onto their targets, ordered by
    /// `created_at`.
    pub fn timeline(&self) -> Result<Timeline, EngineError> {
        Ok(timeline::build(self.store.as_ref(), &self.codec)?)
    }

    fn handle_event(&self, src: DeviceId, ciphertext: Vec<u8>, signature: Option<Vec<u8>>) {
        let event_id = event_id_for(&ciphertext);
        match self.store.contains(&event_id) {
            Ok(true) => {
                self.counters.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(%event_id, "store lookup failed: {e}");
                return;
            }
        }

        let decoded = match self.codec.decode(src, &ciphertext, signature.as_deref()) {
            Ok(decoded) => decoded,
            Err(rejected) => {
                let counter = match rejected {
                    Rejected::SignatureUnknownAuthor => &self.counters.rejected_signature_unknown,
                    Rejected::SignatureInvalid => &self.counters.rejected_signature_invalid,
                    Rejected::AeadTagInvalid => &self.counters.rejected_aead,
                    Rejected::PayloadParseError => &self.counters.rejected_parse,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                trace!(%src, %event_id, "event rejected: {rejected}");
                return;
            }
        };

        let now = self.clock.now_ms() as i64;
        let record = EventRecord {
            event_id,
            author: decoded.author,
            created_at: decoded.payload.timestamp().unwrap_or(now),
            received_at: now,
            ciphertext,
            signature,
        };
        match self.store.insert(record) {
            Ok(InsertOutcome::Inserted) => {
                self.counters.events_received.fetch_add(1, Ordering::Relaxed);
                self.record_inserted(event_id, &decoded.payload);
            }
            Ok(InsertOutcome::Duplicate) => {
                self.counters.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(%event_id, "insert failed: {e}");
            }
        }
    }

    fn handle_bloom(&self, peer: DeviceId, event_count: u32, filter_bytes: &[u8]) {
        let filter = match BloomFilter::deserialize(filter_bytes) {
            Ok(filter) => filter,
            Err(e) => {
                self.counters.blooms_malformed.fetch_add(1, Ordering::Relaxed);
                trace!(%peer, "malformed bloom digest: {e}");
                return;
            }
        };
        self.counters.blooms_received.fetch_add(1, Ordering::Relaxed);
        self.peers.lock().insert(
            peer,
            PeerKnowledge {
                filter: filter.clone(),
                received_at: self.clock.now_ms(),
                event_count,
            },
        );

        self.refresh_scan_if_needed();
        let selected = self.scan.lock().select_events_to_send(peer, &filter);
        if selected.is_empty() {
            return;
        }
        debug!(%peer, n = selected.len(), "sending events the peer lacks");

        for event_id in selected {
            let record = match self.store.get(&event_id) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(%event_id, "store read failed: {e}");
                    continue;
                }
            };
            let datagram = wire::encode(
                self.device_id,
                &Datagram::Event {
                    ciphertext: record.ciphertext,
                    signature: record.signature,
                },
            );
            match datagram {
                Ok(bytes) => match self.link.send(peer, &bytes) {
                    Ok(()) => {
                        self.counters.events_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        self.counters.sends_failed.fetch_add(1, Ordering::Relaxed);
                        debug!(%peer, %event_id, "event send failed: {e}");
                    }
                },
                Err(e) => {
                    debug!(%event_id, "event does not fit a datagram: {e}");
                }
            }
        }
    }

    fn refresh_scan_if_needed(&self) {
        let mut scan = self.scan.lock();
        if scan.needs_refresh(self.store.count()) {
            if let Err(e) = scan.refresh(self.store.as_ref(), self.clock.now_ms()) {
                warn!("scan refresh failed: {e}");
            }
        }
    }

    fn record_inserted(&self, event_id: EventId, payload: &EventPayload) {
        {
            let mut filter = self.local_filter.lock();
            filter.add(&event_id);
            if filter.is_saturated() {
                let ids: Vec<EventId> = self
                    .store
                    .iter_by_created_at()
                    .filter_map(|r| r.ok().map(|r| r.event_id))
                    .collect();
                info!(n = ids.len(), "rotating saturated bloom filter");
                filter.rebuild(ids);
            }
        }
        self.scan.lock().mark_dirty();
        for observer in self.observers.lock().iter() {
            observer(event_id, payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use weft_core::clock::SimClock;
    use weft_core::codec::KeyPair;
    use weft_core::types::MessageBody;
    use weft_net::sim::{LinkConfig, SimNetwork};

    struct Rig {
        clock: Arc<SimClock>,
        net: Arc<SimNetwork>,
        engines: Vec<Arc<SyncEngine>>,
        keypairs: Vec<KeyPair>,
    }

    fn rig(n: usize, link: LinkConfig) -> Rig {
        let clock = Arc::new(SimClock::new());
        let net = SimNetwork::new(clock.clone(), link, 7);
        let keypairs: Vec<KeyPair> = (0..n)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
            .collect();
        let engines = keypairs
            .iter()
            .map(|kp| {
                let mut codec = EventCodec::new(&[9u8; 32]).with_signing(kp);
                for other in &keypairs {
                    codec = codec.with_trusted_peer(other.verifying_key());
                }
                let link = net.register(kp.device_id());
                SyncEngine::start(
                    kp.device_id(),
                    clock.clone(),
                    Arc::new(MemoryStore::new()),
                    codec,
                    link,
                    SyncConfig::default(),
                )
                .unwrap()
            })
            .collect();
        Rig {
            clock,
            net,
            engines,
            keypairs,
        }
    }

    impl Rig {
        fn step(&self, ms: u64) {
            let mut elapsed = 0;
            while elapsed < ms {
                self.clock.advance(50).unwrap();
                elapsed += 50;
                self.net.tick(self.clock.now_ms());
                for engine in &self.engines {
                    engine.sync_tick();
                }
            }
        }

        fn message(&self, author: usize, content: &str) -> EventPayload {
            EventPayload::Message(MessageBody {
                content: content.into(),
                author: self.keypairs[author].device_id(),
                timestamp: self.clock.now_ms() as i64,
                attachments: vec![],
            })
        }
    }

    #[test]
    fn test_submit_broadcasts_directly() {
        let rig = rig(2, LinkConfig::lossless());
        let id = rig.engines[0]
            .submit_local(&rig.message(0, "hi"))
            .unwrap();

        rig.step(100);
        assert!(rig.engines[1].store().contains(&id).unwrap());
        assert_eq!(rig.engines[1].counters().events_received, 1);
    }

    #[test]
    fn test_bloom_round_fills_gap() {
        let rig = rig(2, LinkConfig::lossless());

        // Author while offline: the direct broadcast is suppressed, so only
        // the bloom exchange can deliver these.
        rig.engines[0].link.set_local_online(false);
        let ids: Vec<EventId> = (0..5)
            .map(|i| {
                rig.engines[0]
                    .submit_local(&rig.message(0, &format!("m{i}")))
                    .unwrap()
            })
            .collect();
        assert_eq!(rig.net.records().len(), 0);

        rig.engines[0].link.set_local_online(true);
        rig.step(5_000);
        for id in &ids {
            assert!(rig.engines[1].store().contains(id).unwrap());
        }
    }

    #[test]
    fn test_duplicate_event_datagram_dropped() {
        let rig = rig(2, LinkConfig::lossless());
        let payload = rig.message(0, "hi");
        let encoded = rig.engines[0].codec().encode(&payload).unwrap();
        let bytes = wire::encode(
            rig.engines[0].device_id(),
            &Datagram::Event {
                ciphertext: encoded.ciphertext,
                signature: encoded.signature,
            },
        )
        .unwrap();

        let b = &rig.engines[1];
        b.on_datagram(rig.engines[0].device_id(), &bytes);
        b.on_datagram(rig.engines[0].device_id(), &bytes);
        assert_eq!(b.store().count(), 1);
        assert_eq!(b.counters().events_received, 1);
        assert_eq!(b.counters().duplicates_dropped, 1);
    }

    #[test]
    fn test_untrusted_author_counted_and_dropped() {
        let rig = rig(2, LinkConfig::lossless());
        let mallory = KeyPair::from_seed(&[99; 32]);
        let mallory_codec = EventCodec::new(&[9u8; 32]).with_signing(&mallory);
        let encoded = mallory_codec
            .encode(&EventPayload::Message(MessageBody {
                content: "spoof".into(),
                author: mallory.device_id(),
                timestamp: 0,
                attachments: vec![],
            }))
            .unwrap();
        let bytes = wire::encode(
            mallory.device_id(),
            &Datagram::Event {
                ciphertext: encoded.ciphertext,
                signature: encoded.signature,
            },
        )
        .unwrap();

        rig.engines[1].on_datagram(mallory.device_id(), &bytes);
        assert_eq!(rig.engines[1].store().count(), 0);
        assert_eq!(rig.engines[1].counters().rejected_signature_unknown, 1);
    }

    #[test]
    fn test_sync_status_uses_advertised_counts() {
        let rig = rig(2, LinkConfig::lossless());
        let a = &rig.engines[0];
        let b = &rig.engines[1];

        for i in 0..4 {
            a.submit_local(&rig.message(0, &format!("m{i}"))).unwrap();
        }
        // Nothing exchanged yet: B knows of no events at all.
        assert_eq!(b.sync_status().percent, 0);

        rig.step(3_000);
        let status = b.sync_status();
        assert_eq!(status.known_events, 4);
        assert_eq!(status.estimated_total_events, 4);
        assert_eq!(status.percent, 100);
        assert!(status.is_synced);
    }

    #[test]
    fn test_unknown_datagram_type_ignored() {
        let rig = rig(2, LinkConfig::lossless());
        let mut bytes = wire::encode(
            rig.engines[0].device_id(),
            &Datagram::Bloom {
                event_count: 0,
                filter: vec![],
            },
        )
        .unwrap();
        bytes[1] = 0x66;
        rig.engines[1].on_datagram(rig.engines[0].device_id(), &bytes);
        assert_eq!(rig.engines[1].counters(), CounterSnapshot::default());
    }

    #[test]
    fn test_unknown_payload_variant_is_stored_not_dropped() {
        let rig = rig(2, LinkConfig::lossless());
        // A future payload kind this build does not understand.
        let payload = EventPayload::Unknown {
            tag: 0x7e,
            body: vec![1, 2, 3, 4],
        };
        let id = rig.engines[0].submit_local(&payload).unwrap();
        rig.step(100);

        let b = &rig.engines[1];
        assert!(b.store().contains(&id).unwrap());
        // Readers skip it without removing it from the log.
        assert!(b.timeline().unwrap().entries.is_empty());
    }

    #[test]
    fn test_observer_sees_inserted_events() {
        let rig = rig(2, LinkConfig::lossless());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        rig.engines[1].subscribe(move |id, _| sink.lock().push(id));

        let id = rig.engines[0].submit_local(&rig.message(0, "hi")).unwrap();
        rig.step(100);
        assert_eq!(*seen.lock(), vec![id]);
    }
}
