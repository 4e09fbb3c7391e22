//! Datagram transports for the Weft sync protocol
//!
//! This crate provides:
//! - The shared datagram wire format and size cap
//! - The [`DatagramLink`] transport abstraction with online/offline gating
//! - A deterministic in-process network simulator for tests
//! - A UDP transport for production

pub mod link;
pub mod sim;
pub mod udp;
pub mod wire;

pub use link::{DatagramHandler, DatagramLink, LinkError};
pub use sim::{LinkConfig, SendRecord, SendStatus, SimLink, SimNetwork};
pub use udp::UdpLink;
pub use wire::{Datagram, DatagramType, WireError, MAX_DATAGRAM_BYTES, WIRE_VERSION};
