//! Configuration for weftd

use anyhow::Context;
use clap::Parser;
use ed25519_dalek::VerifyingKey;
use std::net::SocketAddr;
use std::path::PathBuf;
use weft_core::codec::KeyPair;
use weft_core::config::SyncConfig;

/// weftd - Weft encrypted event sync daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "weftd")]
#[command(about = "Weft encrypted peer-to-peer event log sync daemon")]
pub struct Config {
    /// UDP listen address
    #[arg(short, long, default_value = "0.0.0.0:9400")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/weftd")]
    pub data_dir: PathBuf,

    /// 32-byte identity seed as hex (deterministic device identity)
    #[arg(long, env = "WEFT_IDENTITY_SEED")]
    pub identity_seed: String,

    /// 32-byte community AEAD key as hex, shared across trusted peers
    #[arg(long, env = "WEFT_COMMUNITY_KEY")]
    pub community_key: String,

    /// Trusted peers as ed25519_pubkey_hex@host:port (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub peer: Vec<String>,

    /// Minimum interval between Bloom digests to the same peer
    #[arg(long, default_value = "2000")]
    pub sync_interval_ms: u64,

    /// Scan-queue recency window
    #[arg(long, default_value = "60000")]
    pub recency_window_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

fn parse_key32(hex_str: &str, what: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = hex::decode(hex_str.trim()).with_context(|| format!("{what} is not hex"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("{what} must be exactly 32 bytes, got {}", bytes.len()))
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        parse_key32(&self.identity_seed, "identity seed")?;
        parse_key32(&self.community_key, "community key")?;
        self.peers()?;
        self.sync_config()
            .validate()
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(())
    }

    pub fn identity(&self) -> anyhow::Result<KeyPair> {
        Ok(KeyPair::from_seed(&parse_key32(
            &self.identity_seed,
            "identity seed",
        )?))
    }

    pub fn community_key_bytes(&self) -> anyhow::Result<[u8; 32]> {
        parse_key32(&self.community_key, "community key")
    }

    /// Parse the configured peer set.
    pub fn peers(&self) -> anyhow::Result<Vec<(VerifyingKey, SocketAddr)>> {
        self.peer
            .iter()
            .map(|entry| {
                let (key_hex, addr) = entry
                    .split_once('@')
                    .with_context(|| format!("peer '{entry}' is not pubkey_hex@host:port"))?;
                let key_bytes = parse_key32(key_hex, "peer public key")?;
                let key = VerifyingKey::from_bytes(&key_bytes)
                    .map_err(|e| anyhow::anyhow!("peer public key invalid: {e}"))?;
                let addr: SocketAddr = addr
                    .parse()
                    .with_context(|| format!("peer address '{addr}' invalid"))?;
                Ok((key, addr))
            })
            .collect()
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            sync_interval_ms: self.sync_interval_ms,
            recency_window_ms: self.recency_window_ms,
            ..SyncConfig::default()
        }
    }
}
