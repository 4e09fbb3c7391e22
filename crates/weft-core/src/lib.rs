//! Weft Core Library
//!
//! This crate provides the protocol types, event codec, and Bloom digests for
//! Weft, a peer-to-peer encrypted event-log sync substrate.
//!
//! # Modules
//!
//! - [`types`]: Protocol types (DeviceId, EventId, EventRecord, payloads)
//! - [`codec`]: AEAD encryption, author signatures, content addressing
//! - [`bloom`]: Bloom filter digests of the local log
//! - [`clock`]: Simulation and wall clocks
//! - [`config`]: Immutable sync tuning record
//! - [`error`]: Error types

pub mod bloom;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod types;

pub use bloom::{BloomFilter, CumulativeBloomFilter, Membership};
pub use clock::{Clock, ClockError, SimClock, SystemClock};
pub use codec::{event_id_for, device_id_for, EncodedEvent, EventCodec, KeyPair, Rejected};
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use types::*;
