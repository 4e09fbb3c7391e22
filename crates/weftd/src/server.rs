//! weftd server - main service loop

use crate::config::Config;
use crate::engine::{CounterSnapshot, EngineError, SyncEngine, SyncStatus};
use crate::files::FileAssembler;
use crate::store::{EventStore, SledStore, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};
use weft_core::clock::SystemClock;
use weft_core::codec::{device_id_for, EventCodec};
use weft_core::types::DeviceId;
use weft_net::udp::UdpLink;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Server state
pub struct Server {
    device_id: DeviceId,
    store: Arc<SledStore>,
    link: Arc<UdpLink>,
    engine: Arc<SyncEngine>,
    files: Arc<Mutex<FileAssembler>>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub device_id: DeviceId,
    pub event_count: usize,
    pub sync: SyncStatus,
    pub counters: CounterSnapshot,
}

impl Server {
    /// Create a new server instance
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        let keypair = config
            .identity()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let community_key = config
            .community_key_bytes()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let peers = config
            .peers()
            .map_err(|e| ServerError::Config(e.to_string()))?;
        let device_id = keypair.device_id();

        let store = Arc::new(SledStore::open(&config.data_dir)?);

        let mut codec = EventCodec::new(&community_key).with_signing(&keypair);
        for (key, _) in &peers {
            codec = codec.with_trusted_peer(*key);
        }

        let link = UdpLink::bind(config.listen).await?;
        for (key, addr) in &peers {
            link.add_peer(device_id_for(key), *addr);
        }

        let sync_config = config.sync_config();
        let engine = SyncEngine::start(
            device_id,
            Arc::new(SystemClock::new()),
            store.clone() as Arc<dyn crate::store::EventStore>,
            codec,
            link.clone() as Arc<dyn weft_net::link::DatagramLink>,
            sync_config.clone(),
        )?;

        let files = Arc::new(Mutex::new(FileAssembler::new(&sync_config)));
        FileAssembler::attach(&files, &engine);

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            device_id,
            store,
            link,
            engine,
            files,
            shutdown_tx,
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Run the server until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        info!(
            "weftd listening on {} as device {}",
            self.link.local_addr()?,
            self.device_id
        );

        let recv_handle = tokio::spawn(self.link.clone().run());

        let mut ticker = interval(Duration::from_millis(500));
        let mut stats_countdown = 60u32;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.engine.sync_tick();

                    for (file_id, bytes) in self.files.lock().take_completed() {
                        info!(%file_id, len = bytes.len(), "file reassembled");
                    }

                    stats_countdown -= 1;
                    if stats_countdown == 0 {
                        stats_countdown = 60;
                        let stats = self.stats();
                        debug!(
                            events = stats.event_count,
                            percent = stats.sync.percent,
                            "sync progress"
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        recv_handle.abort();
        if let Err(e) = self.store.flush() {
            warn!("flush on shutdown failed: {e}");
        }
        Ok(())
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            device_id: self.device_id,
            event_count: self.store.count(),
            sync: self.engine.sync_status(),
            counters: self.engine.counters(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            data_dir: dir.to_path_buf(),
            identity_seed: hex::encode([3u8; 32]),
            community_key: hex::encode([4u8; 32]),
            peer: vec![],
            sync_interval_ms: 2000,
            recency_window_ms: 60_000,
            verbose: false,
            log_format: "pretty".into(),
        }
    }

    #[tokio::test]
    async fn test_server_creation() {
        let dir = tempdir().unwrap();
        let server = Server::new(test_config(dir.path())).await.unwrap();
        let stats = server.stats();
        assert_eq!(stats.event_count, 0);
        assert_eq!(stats.sync.known_events, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let dir = tempdir().unwrap();
        let server = Arc::new(Server::new(test_config(dir.path())).await.unwrap());
        let run_handle = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.shutdown();
        run_handle.await.unwrap().unwrap();
    }
}
