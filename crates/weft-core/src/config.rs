//! Immutable sync tuning configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Tuning knobs consumed by the sync engine, scan queue, Bloom digests, and
/// file chunker. Construct once per device and treat as immutable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    /// Minimum sim-time between successive Bloom digests to the same peer.
    pub sync_interval_ms: u64,
    /// Scan-queue recent-set cutoff.
    pub recency_window_ms: u64,
    /// Recent entries examined per selection round.
    pub recent_batch: usize,
    /// Older entries examined per selection round (round-robin window).
    pub older_batch: usize,
    /// Hard cap on events sent in response to one peer digest.
    pub max_per_round: usize,
    /// Bloom sizing target: expected member count.
    pub bloom_target_items: usize,
    /// Bloom sizing target: false-positive rate at the target count.
    pub bloom_target_fpr: f64,
    /// File chunk plaintext size.
    pub chunk_size_bytes: usize,
    /// Data chunks per XOR parity group; must be >= 1.
    pub parity_group_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_ms: 2000,
            recency_window_ms: 60_000,
            recent_batch: 10,
            older_batch: 5,
            max_per_round: 20,
            bloom_target_items: 500,
            bloom_target_fpr: 0.05,
            chunk_size_bytes: 500,
            parity_group_size: 2,
        }
    }
}

impl SyncConfig {
    /// Validate invariants the rest of the core assumes.
    pub fn validate(&self) -> Result<()> {
        if self.parity_group_size < 1 {
            return Err(Error::InvalidConfig("parity_group_size must be >= 1".into()));
        }
        if self.chunk_size_bytes == 0 {
            return Err(Error::InvalidConfig("chunk_size_bytes must be > 0".into()));
        }
        if self.max_per_round == 0 {
            return Err(Error::InvalidConfig("max_per_round must be > 0".into()));
        }
        if self.bloom_target_items == 0 {
            return Err(Error::InvalidConfig("bloom_target_items must be > 0".into()));
        }
        if !(self.bloom_target_fpr > 0.0 && self.bloom_target_fpr < 1.0) {
            return Err(Error::InvalidConfig(
                "bloom_target_fpr must be in (0, 1)".into(),
            ));
        }
        if self.sync_interval_ms == 0 {
            return Err(Error::InvalidConfig("sync_interval_ms must be > 0".into()));
        }
        Ok(())
    }
}
