//! Shared simulation harness for integration tests
//!
//! Builds a fleet of devices on one simulated network driven by a single
//! SimClock, with full key exchange between every pair.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use weft_core::clock::{Clock, SimClock};
use weft_core::codec::{EventCodec, KeyPair};
use weft_core::config::SyncConfig;
use weft_core::types::{DeviceId, EventId, EventPayload, MessageBody};
use weft_net::sim::{LinkConfig, SimNetwork};
use weftd::engine::SyncEngine;
use weftd::files::FileAssembler;
use weftd::store::{EventStore, MemoryStore};

pub struct SimDevice {
    pub keypair: KeyPair,
    pub engine: Arc<SyncEngine>,
    pub files: Arc<Mutex<FileAssembler>>,
}

impl SimDevice {
    pub fn id(&self) -> DeviceId {
        self.keypair.device_id()
    }

    pub fn event_ids(&self) -> Vec<EventId> {
        let mut ids: Vec<EventId> = self
            .engine
            .store()
            .iter_by_created_at()
            .map(|r| r.unwrap().event_id)
            .collect();
        ids.sort();
        ids
    }
}

pub struct SimWorld {
    pub clock: Arc<SimClock>,
    pub net: Arc<SimNetwork>,
    pub devices: Vec<SimDevice>,
}

/// Build `n` devices that all trust each other, share one community key, and
/// sit on one simulated network.
pub fn build_world(n: usize, link: LinkConfig, config: SyncConfig, seed: u64) -> SimWorld {
    let clock = Arc::new(SimClock::new());
    let net = SimNetwork::new(clock.clone(), link, seed);
    let community_key = [0x51u8; 32];

    let keypairs: Vec<KeyPair> = (0..n)
        .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
        .collect();

    let devices = keypairs
        .iter()
        .map(|keypair| {
            let mut codec = EventCodec::new(&community_key).with_signing(keypair);
            for other in &keypairs {
                codec = codec.with_trusted_peer(other.verifying_key());
            }
            let link = net.register(keypair.device_id());
            let engine = SyncEngine::start(
                keypair.device_id(),
                clock.clone(),
                Arc::new(MemoryStore::new()),
                codec,
                link,
                config.clone(),
            )
            .expect("engine start");

            let files = Arc::new(Mutex::new(FileAssembler::new(&config)));
            FileAssembler::attach(&files, &engine);

            SimDevice {
                keypair: keypair.clone(),
                engine,
                files,
            }
        })
        .collect();

    SimWorld {
        clock,
        net,
        devices,
    }
}

impl SimWorld {
    pub fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Advance simulated time in 50 ms steps, delivering datagrams and firing
    /// sync ticks along the way.
    pub fn step(&self, ms: u64) {
        let target = self.clock.now_ms() + ms;
        while self.clock.now_ms() < target {
            self.clock.advance(50.min((target - self.clock.now_ms()) as i64)).unwrap();
            self.net.tick(self.clock.now_ms());
            for device in &self.devices {
                device.engine.sync_tick();
            }
        }
    }

    /// Step until every store holds the same id set, up to `cap_ms`. Returns
    /// the sim time at convergence.
    pub fn step_until_converged(&self, cap_ms: u64) -> u64 {
        let deadline = self.clock.now_ms() + cap_ms;
        while self.clock.now_ms() < deadline {
            self.step(200);
            if self.converged() {
                return self.clock.now_ms();
            }
        }
        panic!("stores did not converge within {cap_ms} ms of sim time");
    }

    pub fn converged(&self) -> bool {
        let reference = self.devices[0].event_ids();
        self.devices.iter().all(|d| d.event_ids() == reference)
    }

    pub fn set_online(&self, device: usize, online: bool) {
        self.net.set_online(self.devices[device].id(), online);
    }

    /// A message payload timestamped with the current sim time.
    pub fn message(&self, author: usize, content: &str) -> EventPayload {
        EventPayload::Message(MessageBody {
            content: content.into(),
            author: self.devices[author].id(),
            timestamp: self.clock.now_ms() as i64,
            attachments: vec![],
        })
    }
}
