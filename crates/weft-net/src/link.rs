//! Abstract unreliable datagram transport
//!
//! The sync engine talks to peers only through [`DatagramLink`]. Two
//! implementations exist: the in-process [`crate::sim`] network for
//! deterministic tests and the [`crate::udp`] socket link for production.

use std::sync::Arc;
use thiserror::Error;
use weft_core::types::DeviceId;

/// Transport errors. All of these are transient: the caller logs and moves
/// on; the next sync round closes the gap.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("datagram exceeds safe size: {0} bytes")]
    Oversize(usize),
    #[error("unknown peer: {0}")]
    UnknownPeer(DeviceId),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Inbound delivery callback: `(from_device_id, datagram_bytes)`.
pub type DatagramHandler = Arc<dyn Fn(DeviceId, &[u8]) + Send + Sync>;

/// An unreliable, unordered, unacknowledged datagram transport with
/// per-device online gating.
///
/// When the local device is offline, outbound datagrams are dropped at the
/// link and inbound datagrams are not delivered. Send is fire-and-forget;
/// there is no retry at this layer.
pub trait DatagramLink: Send + Sync {
    /// Send one datagram to a configured peer.
    fn send(&self, to: DeviceId, bytes: &[u8]) -> Result<(), LinkError>;

    /// Send one datagram to every configured peer. Per-peer failures are
    /// logged, not returned.
    fn broadcast(&self, bytes: &[u8]);

    /// Register the inbound delivery handler. Later calls replace earlier
    /// ones; a link has exactly one consumer.
    fn subscribe(&self, handler: DatagramHandler);

    /// Gate both sending and delivery for the local device.
    fn set_local_online(&self, online: bool);

    fn is_online(&self) -> bool;

    /// The configured peer set.
    fn peers(&self) -> Vec<DeviceId>;
}
