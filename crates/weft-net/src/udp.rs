//! UDP datagram transport
//!
//! One socket per device, peers configured as `device_id -> address`. No
//! acknowledgement, no retry: a lost datagram is recovered by the next sync
//! round, never by the transport.

use crate::link::{DatagramHandler, DatagramLink, LinkError};
use crate::wire::{self, MAX_DATAGRAM_BYTES};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};
use weft_core::types::DeviceId;

/// UDP implementation of [`DatagramLink`].
pub struct UdpLink {
    socket: UdpSocket,
    peers: RwLock<HashMap<DeviceId, SocketAddr>>,
    online: AtomicBool,
    handler: RwLock<Option<DatagramHandler>>,
}

impl UdpLink {
    /// Bind the device's socket. Peers are added afterwards with
    /// [`UdpLink::add_peer`].
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(Self {
            socket,
            peers: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            handler: RwLock::new(None),
        }))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn add_peer(&self, device: DeviceId, addr: SocketAddr) {
        self.peers.write().insert(device, addr);
    }

    /// Receive loop. Spawn this once; it runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; 2048];
        loop {
            let (len, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(ok) => ok,
                Err(e) => {
                    warn!("udp recv error: {e}");
                    continue;
                }
            };
            if !self.online.load(Ordering::Relaxed) {
                trace!(%addr, "inbound datagram dropped: local offline");
                continue;
            }
            let bytes = &buf[..len];
            let Some(from) = wire::source_of(bytes) else {
                trace!(%addr, "inbound datagram dropped: bad header");
                continue;
            };
            if !self.peers.read().contains_key(&from) {
                trace!(%from, %addr, "inbound datagram dropped: unknown source");
                continue;
            }
            let handler = self.handler.read().clone();
            if let Some(handler) = handler {
                handler(from, bytes);
            }
        }
    }
}

impl DatagramLink for UdpLink {
    fn send(&self, to: DeviceId, bytes: &[u8]) -> Result<(), LinkError> {
        if bytes.len() > MAX_DATAGRAM_BYTES {
            return Err(LinkError::Oversize(bytes.len()));
        }
        if !self.online.load(Ordering::Relaxed) {
            trace!(%to, "outbound datagram dropped: local offline");
            return Ok(());
        }
        let addr = self
            .peers
            .read()
            .get(&to)
            .copied()
            .ok_or(LinkError::UnknownPeer(to))?;
        self.socket.try_send_to(bytes, addr)?;
        Ok(())
    }

    fn broadcast(&self, bytes: &[u8]) {
        for peer in self.peers() {
            if let Err(e) = self.send(peer, bytes) {
                debug!(%peer, "broadcast send failed: {e}");
            }
        }
    }

    fn subscribe(&self, handler: DatagramHandler) {
        *self.handler.write() = Some(handler);
    }

    fn set_local_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    fn peers(&self) -> Vec<DeviceId> {
        self.peers.read().keys().copied().collect()
    }
}
