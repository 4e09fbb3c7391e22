//! In-process simulated datagram network
//!
//! Runs any number of devices on one thread, driven by a shared [`SimClock`].
//! Each send samples loss and latency from a seeded RNG, so a whole
//! multi-device scenario replays identically for a given seed. Every send
//! attempt leaves an observability record tests can assert on.

use crate::link::{DatagramHandler, DatagramLink, LinkError};
use crate::wire::MAX_DATAGRAM_BYTES;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Arc;
use tracing::trace;
use weft_core::clock::{Clock, SimClock};
use weft_core::types::DeviceId;

/// Per-link delivery characteristics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinkConfig {
    /// Probability in [0, 1] that a datagram is lost at send time.
    pub packet_loss_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
    /// Symmetric jitter added to the sampled latency, clamped at zero.
    pub jitter_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            packet_loss_rate: 0.0,
            min_latency_ms: 10,
            max_latency_ms: 50,
            jitter_ms: 0,
        }
    }
}

impl LinkConfig {
    pub fn lossless() -> Self {
        Self::default()
    }

    pub fn with_loss(loss: f64) -> Self {
        Self {
            packet_loss_rate: loss,
            ..Self::default()
        }
    }
}

/// Outcome of one send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// Scheduled, not yet due.
    InFlight,
    Delivered,
    DroppedLoss,
    DroppedSourceOffline,
    DroppedTargetOffline,
}

/// Observability record for one send attempt.
#[derive(Clone, Debug)]
pub struct SendRecord {
    pub from: DeviceId,
    pub to: DeviceId,
    pub bytes_len: usize,
    pub sent_at: u64,
    pub deliver_at: Option<u64>,
    pub status: SendStatus,
}

struct FlightEntry {
    deliver_at: u64,
    seq: u64,
    from: DeviceId,
    to: DeviceId,
    bytes: Vec<u8>,
    record: usize,
}

impl PartialEq for FlightEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deliver_at == other.deliver_at && self.seq == other.seq
    }
}

impl Eq for FlightEntry {}

impl PartialOrd for FlightEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlightEntry {
    // Reversed: the heap pops the earliest deadline, ties FIFO by seq.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.deliver_at, other.seq).cmp(&(self.deliver_at, self.seq))
    }
}

struct Endpoint {
    online: bool,
    handler: Option<DatagramHandler>,
}

struct NetState {
    rng: StdRng,
    endpoints: BTreeMap<DeviceId, Endpoint>,
    links: HashMap<(DeviceId, DeviceId), LinkConfig>,
    in_flight: BinaryHeap<FlightEntry>,
    seq: u64,
    records: Vec<SendRecord>,
}

/// The shared simulated network. One instance per scenario; devices join via
/// [`SimNetwork::register`].
pub struct SimNetwork {
    clock: Arc<SimClock>,
    default_link: LinkConfig,
    state: Mutex<NetState>,
}

impl SimNetwork {
    pub fn new(clock: Arc<SimClock>, default_link: LinkConfig, seed: u64) -> Arc<Self> {
        Arc::new(Self {
            clock,
            default_link,
            state: Mutex::new(NetState {
                rng: StdRng::seed_from_u64(seed),
                endpoints: BTreeMap::new(),
                links: HashMap::new(),
                in_flight: BinaryHeap::new(),
                seq: 0,
                records: Vec::new(),
            }),
        })
    }

    /// Join a device to the network and get its link handle. Devices start
    /// online.
    pub fn register(self: &Arc<Self>, device: DeviceId) -> Arc<SimLink> {
        self.state.lock().endpoints.insert(
            device,
            Endpoint {
                online: true,
                handler: None,
            },
        );
        Arc::new(SimLink {
            device,
            network: self.clone(),
        })
    }

    /// Override delivery characteristics for one direction of one link.
    pub fn set_link(&self, from: DeviceId, to: DeviceId, config: LinkConfig) {
        self.state.lock().links.insert((from, to), config);
    }

    pub fn set_online(&self, device: DeviceId, online: bool) {
        if let Some(ep) = self.state.lock().endpoints.get_mut(&device) {
            ep.online = online;
        }
    }

    pub fn is_online(&self, device: DeviceId) -> bool {
        self.state
            .lock()
            .endpoints
            .get(&device)
            .map(|ep| ep.online)
            .unwrap_or(false)
    }

    fn send_from(&self, from: DeviceId, to: DeviceId, bytes: &[u8]) -> Result<(), LinkError> {
        if bytes.len() > MAX_DATAGRAM_BYTES {
            return Err(LinkError::Oversize(bytes.len()));
        }
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        if !state.endpoints.contains_key(&to) {
            return Err(LinkError::UnknownPeer(to));
        }

        let source_online = state.endpoints.get(&from).map(|ep| ep.online).unwrap_or(false);
        if !source_online {
            state.records.push(SendRecord {
                from,
                to,
                bytes_len: bytes.len(),
                sent_at: now,
                deliver_at: None,
                status: SendStatus::DroppedSourceOffline,
            });
            return Ok(());
        }

        let link = *state.links.get(&(from, to)).unwrap_or(&self.default_link);
        if state.rng.gen::<f64>() < link.packet_loss_rate {
            state.records.push(SendRecord {
                from,
                to,
                bytes_len: bytes.len(),
                sent_at: now,
                deliver_at: None,
                status: SendStatus::DroppedLoss,
            });
            trace!(%from, %to, "sim drop: loss");
            return Ok(());
        }

        let base = state.rng.gen_range(link.min_latency_ms..=link.max_latency_ms) as i64;
        let jitter = if link.jitter_ms > 0 {
            let j = link.jitter_ms as i64;
            state.rng.gen_range(-j..=j)
        } else {
            0
        };
        let latency = (base + jitter).max(0) as u64;
        let deliver_at = now + latency;

        let record = state.records.len();
        state.records.push(SendRecord {
            from,
            to,
            bytes_len: bytes.len(),
            sent_at: now,
            deliver_at: Some(deliver_at),
            status: SendStatus::InFlight,
        });
        let seq = state.seq;
        state.seq += 1;
        state.in_flight.push(FlightEntry {
            deliver_at,
            seq,
            from,
            to,
            bytes: bytes.to_vec(),
            record,
        });
        Ok(())
    }

    /// Deliver every scheduled datagram whose deadline has passed, in
    /// ascending deadline order. Targets offline at delivery time drop the
    /// datagram with `DroppedTargetOffline`.
    pub fn tick(&self, now: u64) {
        loop {
            let (entry, handler) = {
                let mut state = self.state.lock();
                match state.in_flight.peek() {
                    Some(top) if top.deliver_at <= now => {
                        let entry = state.in_flight.pop().expect("peeked entry");
                        let ep = state.endpoints.get(&entry.to);
                        let online = ep.map(|e| e.online).unwrap_or(false);
                        let handler = ep.and_then(|e| e.handler.clone());
                        if !online || handler.is_none() {
                            state.records[entry.record].status = SendStatus::DroppedTargetOffline;
                            continue;
                        }
                        state.records[entry.record].status = SendStatus::Delivered;
                        (entry, handler.expect("checked above"))
                    }
                    _ => break,
                }
            };
            // Deliver outside the lock: handlers send datagrams of their own.
            handler(entry.from, &entry.bytes);
        }
    }

    /// Snapshot of every send attempt so far.
    pub fn records(&self) -> Vec<SendRecord> {
        self.state.lock().records.clone()
    }

    pub fn count_status(&self, status: SendStatus) -> usize {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.status == status)
            .count()
    }

    fn peers_of(&self, device: DeviceId) -> Vec<DeviceId> {
        self.state
            .lock()
            .endpoints
            .keys()
            .copied()
            .filter(|id| *id != device)
            .collect()
    }

    fn set_handler(&self, device: DeviceId, handler: DatagramHandler) {
        if let Some(ep) = self.state.lock().endpoints.get_mut(&device) {
            ep.handler = Some(handler);
        }
    }
}

/// One device's handle onto the simulated network.
pub struct SimLink {
    device: DeviceId,
    network: Arc<SimNetwork>,
}

impl SimLink {
    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }
}

impl DatagramLink for SimLink {
    fn send(&self, to: DeviceId, bytes: &[u8]) -> Result<(), LinkError> {
        self.network.send_from(self.device, to, bytes)
    }

    fn broadcast(&self, bytes: &[u8]) {
        for peer in self.network.peers_of(self.device) {
            if let Err(e) = self.network.send_from(self.device, peer, bytes) {
                trace!(from = %self.device, to = %peer, "sim broadcast failed: {e}");
            }
        }
    }

    fn subscribe(&self, handler: DatagramHandler) {
        self.network.set_handler(self.device, handler);
    }

    fn set_local_online(&self, online: bool) {
        self.network.set_online(self.device, online);
    }

    fn is_online(&self) -> bool {
        self.network.is_online(self.device)
    }

    fn peers(&self) -> Vec<DeviceId> {
        self.network.peers_of(self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(n: u8) -> DeviceId {
        DeviceId([n; 16])
    }

    fn world(link: LinkConfig) -> (Arc<SimClock>, Arc<SimNetwork>) {
        let clock = Arc::new(SimClock::new());
        let net = SimNetwork::new(clock.clone(), link, 42);
        (clock, net)
    }

    fn collect_into(link: &Arc<SimLink>) -> Arc<Mutex<Vec<(DeviceId, Vec<u8>)>>> {
        let inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = inbox.clone();
        link.subscribe(Arc::new(move |from, bytes: &[u8]| {
            sink.lock().push((from, bytes.to_vec()));
        }));
        inbox
    }

    #[test]
    fn test_delivery_after_latency() {
        let (clock, net) = world(LinkConfig {
            packet_loss_rate: 0.0,
            min_latency_ms: 30,
            max_latency_ms: 30,
            jitter_ms: 0,
        });
        let a = net.register(device(1));
        let b = net.register(device(2));
        let inbox = collect_into(&b);

        a.send(device(2), b"ping").unwrap();
        net.tick(clock.now_ms());
        assert!(inbox.lock().is_empty());

        clock.advance(30).unwrap();
        net.tick(clock.now_ms());
        let got = inbox.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], (device(1), b"ping".to_vec()));
        assert_eq!(net.count_status(SendStatus::Delivered), 1);
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let (clock, net) = world(LinkConfig::with_loss(1.0));
        let a = net.register(device(1));
        let b = net.register(device(2));
        let inbox = collect_into(&b);

        for _ in 0..10 {
            a.send(device(2), b"x").unwrap();
        }
        clock.advance(1000).unwrap();
        net.tick(clock.now_ms());
        assert!(inbox.lock().is_empty());
        assert_eq!(net.count_status(SendStatus::DroppedLoss), 10);
    }

    #[test]
    fn test_offline_gating_statuses() {
        let (clock, net) = world(LinkConfig {
            packet_loss_rate: 0.0,
            min_latency_ms: 10,
            max_latency_ms: 10,
            jitter_ms: 0,
        });
        let a = net.register(device(1));
        let b = net.register(device(2));
        let inbox = collect_into(&b);

        // Source offline: dropped at send.
        a.set_local_online(false);
        a.send(device(2), b"x").unwrap();
        assert_eq!(net.count_status(SendStatus::DroppedSourceOffline), 1);

        // Target offline at delivery time: dropped at tick.
        a.set_local_online(true);
        a.send(device(2), b"y").unwrap();
        b.set_local_online(false);
        clock.advance(10).unwrap();
        net.tick(clock.now_ms());
        assert_eq!(net.count_status(SendStatus::DroppedTargetOffline), 1);
        assert!(inbox.lock().is_empty());

        // Back online: new sends get through.
        b.set_local_online(true);
        a.send(device(2), b"z").unwrap();
        clock.advance(10).unwrap();
        net.tick(clock.now_ms());
        assert_eq!(inbox.lock().len(), 1);
    }

    #[test]
    fn test_deliveries_in_deadline_order() {
        let (clock, net) = world(LinkConfig {
            packet_loss_rate: 0.0,
            min_latency_ms: 5,
            max_latency_ms: 80,
            jitter_ms: 10,
        });
        let a = net.register(device(1));
        let b = net.register(device(2));
        let inbox = collect_into(&b);

        for i in 0..20u8 {
            a.send(device(2), &[i]).unwrap();
        }
        clock.advance(200).unwrap();
        net.tick(clock.now_ms());

        // Arrival order matches ascending scheduled deadlines (send order
        // breaks ties).
        let mut expected: Vec<(u64, u8)> = net
            .records()
            .iter()
            .enumerate()
            .map(|(i, r)| (r.deliver_at.unwrap(), i as u8))
            .collect();
        expected.sort();
        let arrived: Vec<u8> = inbox.lock().iter().map(|(_, bytes)| bytes[0]).collect();
        assert_eq!(arrived, expected.into_iter().map(|(_, i)| i).collect::<Vec<u8>>());
    }

    #[test]
    fn test_same_seed_same_outcomes() {
        let run = || {
            let (clock, net) = world(LinkConfig::with_loss(0.5));
            let a = net.register(device(1));
            let _b = net.register(device(2));
            for _ in 0..50 {
                a.send(device(2), b"x").unwrap();
            }
            clock.advance(500).unwrap();
            net.tick(clock.now_ms());
            net.count_status(SendStatus::DroppedLoss)
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_broadcast_reaches_all_peers() {
        let (clock, net) = world(LinkConfig {
            packet_loss_rate: 0.0,
            min_latency_ms: 10,
            max_latency_ms: 10,
            jitter_ms: 0,
        });
        let a = net.register(device(1));
        let b = net.register(device(2));
        let c = net.register(device(3));
        let inbox_b = collect_into(&b);
        let inbox_c = collect_into(&c);

        a.broadcast(b"all");
        clock.advance(10).unwrap();
        net.tick(clock.now_ms());
        assert_eq!(inbox_b.lock().len(), 1);
        assert_eq!(inbox_c.lock().len(), 1);
    }

    #[test]
    fn test_per_link_override() {
        let (clock, net) = world(LinkConfig {
            packet_loss_rate: 0.0,
            min_latency_ms: 10,
            max_latency_ms: 10,
            jitter_ms: 0,
        });
        let a = net.register(device(1));
        let b = net.register(device(2));
        let inbox = collect_into(&b);

        // One direction of one link is fully lossy; the reverse still works.
        net.set_link(device(1), device(2), LinkConfig::with_loss(1.0));
        a.send(device(2), b"gone").unwrap();
        clock.advance(100).unwrap();
        net.tick(clock.now_ms());
        assert!(inbox.lock().is_empty());

        let inbox_a = collect_into(&a);
        b.send(device(1), b"fine").unwrap();
        clock.advance(100).unwrap();
        net.tick(clock.now_ms());
        assert_eq!(inbox_a.lock().len(), 1);
    }

    #[test]
    fn test_unknown_peer_is_an_error() {
        let (_clock, net) = world(LinkConfig::default());
        let a = net.register(device(1));
        assert!(matches!(
            a.send(device(9), b"x"),
            Err(LinkError::UnknownPeer(_))
        ));
    }
}
