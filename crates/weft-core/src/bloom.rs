//! Bloom filter digests of the local event log
//!
//! A device advertises what it already has as a fixed-parameter Bloom filter
//! small enough to ride in a single datagram. Membership is tested by double
//! hashing over the 16-byte event id; there are no false negatives, so a
//! `DefinitelyAbsent` answer is always safe to act on.

use crate::error::{Error, Result};
use crate::types::EventId;

/// Wire format version for serialized filters.
pub const BLOOM_WIRE_VERSION: u8 = 1;

/// Serialized header: version(1) + bit_size(4 LE) + hash_count(1).
pub const BLOOM_HEADER_LEN: usize = 6;

/// Largest bit array that still fits a serialized filter (plus the datagram
/// framing around it) inside one 1200-byte datagram.
pub const MAX_BLOOM_BITS: u32 = 9376;

/// Outcome of a membership test.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    /// All probed bits set; the id is likely (not certainly) a member.
    MaybePresent,
    /// At least one probed bit clear; the id was never added.
    DefinitelyAbsent,
}

/// Fixed-parameter Bloom filter over event ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomFilter {
    bit_size: u32,
    hash_count: u8,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Create an empty filter with explicit parameters.
    pub fn with_params(bit_size: u32, hash_count: u8) -> Self {
        let bit_size = bit_size.clamp(64, MAX_BLOOM_BITS);
        let hash_count = hash_count.clamp(1, 16);
        Self {
            bit_size,
            hash_count,
            bits: vec![0u8; bit_size.div_ceil(8) as usize],
        }
    }

    /// Create an empty filter sized for `target_items` members at
    /// `target_fpr` false-positive rate.
    ///
    /// Optimal sizing: `m = -n ln p / ln^2 2`, `k = (m/n) ln 2`. The bit size
    /// is capped at [`MAX_BLOOM_BITS`] so the digest always fits a datagram;
    /// past the cap the false-positive rate degrades instead of the wire.
    pub fn optimal(target_items: usize, target_fpr: f64) -> Self {
        let n = target_items.max(1) as f64;
        let p = target_fpr.clamp(0.00001, 0.99999);
        let m = (-n * p.ln() / (2.0_f64.ln().powi(2))).ceil() as u32;
        let k = ((m as f64 / n) * 2.0_f64.ln()).round() as u8;
        Self::with_params(m, k)
    }

    pub fn bit_size(&self) -> u32 {
        self.bit_size
    }

    pub fn hash_count(&self) -> u8 {
        self.hash_count
    }

    pub fn same_params(&self, other: &BloomFilter) -> bool {
        self.bit_size == other.bit_size && self.hash_count == other.hash_count
    }

    /// Bit indexes probed for an id: `h1 + i*h2 mod m`, both halves of the
    /// 16-byte id read little-endian, h2 forced odd.
    fn indexes(&self, id: &EventId) -> impl Iterator<Item = usize> + '_ {
        let h1 = u64::from_le_bytes(id.0[..8].try_into().expect("8 bytes"));
        let h2 = u64::from_le_bytes(id.0[8..].try_into().expect("8 bytes")) | 1;
        let m = self.bit_size as u64;
        (0..self.hash_count as u64).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    pub fn add(&mut self, id: &EventId) {
        let idxs: Vec<usize> = self.indexes(id).collect();
        for idx in idxs {
            self.bits[idx / 8] |= 1 << (idx % 8);
        }
    }

    pub fn test(&self, id: &EventId) -> Membership {
        for idx in self.indexes(id) {
            if self.bits[idx / 8] & (1 << (idx % 8)) == 0 {
                return Membership::DefinitelyAbsent;
            }
        }
        Membership::MaybePresent
    }

    /// Bitwise OR of another filter into this one. Parameters must match.
    pub fn merge(&mut self, other: &BloomFilter) -> Result<()> {
        if !self.same_params(other) {
            return Err(Error::BloomParamsMismatch {
                ours: format!("{}b/{}h", self.bit_size, self.hash_count),
                theirs: format!("{}b/{}h", other.bit_size, other.hash_count),
            });
        }
        for (a, b) in self.bits.iter_mut().zip(other.bits.iter()) {
            *a |= b;
        }
        Ok(())
    }

    /// Fraction of set bits, a rough saturation signal.
    pub fn fill_ratio(&self) -> f64 {
        let ones: u32 = self.bits.iter().map(|b| b.count_ones()).sum();
        ones as f64 / self.bit_size as f64
    }

    /// Expected false-positive rate if `items` members have been added:
    /// `(1 - e^(-kn/m))^k`.
    pub fn false_positive_estimate(&self, items: usize) -> f64 {
        let k = self.hash_count as f64;
        let n = items as f64;
        let m = self.bit_size as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// Wire format: `[version:1][bit_size:4 LE][hash_count:1][bits]`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOOM_HEADER_LEN + self.bits.len());
        out.push(BLOOM_WIRE_VERSION);
        out.extend_from_slice(&self.bit_size.to_le_bytes());
        out.push(self.hash_count);
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOOM_HEADER_LEN {
            return Err(Error::BloomMalformed(format!(
                "digest too short: {} bytes",
                bytes.len()
            )));
        }
        if bytes[0] != BLOOM_WIRE_VERSION {
            return Err(Error::BloomMalformed(format!("unknown version {}", bytes[0])));
        }
        let bit_size = u32::from_le_bytes(bytes[1..5].try_into().expect("4 bytes"));
        let hash_count = bytes[5];
        if bit_size == 0 || bit_size > MAX_BLOOM_BITS {
            return Err(Error::BloomMalformed(format!("bit_size {bit_size}")));
        }
        if hash_count == 0 || hash_count > 16 {
            return Err(Error::BloomMalformed(format!("hash_count {hash_count}")));
        }
        let expected = bit_size.div_ceil(8) as usize;
        let bits = &bytes[BLOOM_HEADER_LEN..];
        if bits.len() != expected {
            return Err(Error::BloomMalformed(format!(
                "bit array length {} != {expected}",
                bits.len()
            )));
        }
        Ok(Self {
            bit_size,
            hash_count,
            bits: bits.to_vec(),
        })
    }
}

/// The authoritative digest of the local log: a Bloom filter plus a count of
/// adds. The count rides alongside the digest on the wire so peers can
/// estimate sync progress.
#[derive(Clone, Debug)]
pub struct CumulativeBloomFilter {
    filter: BloomFilter,
    added: u64,
    target_items: usize,
    target_fpr: f64,
}

impl CumulativeBloomFilter {
    pub fn new(target_items: usize, target_fpr: f64) -> Self {
        Self {
            filter: BloomFilter::optimal(target_items, target_fpr),
            added: 0,
            target_items,
            target_fpr,
        }
    }

    pub fn add(&mut self, id: &EventId) {
        self.filter.add(id);
        self.added += 1;
    }

    pub fn test(&self, id: &EventId) -> Membership {
        self.filter.test(id)
    }

    pub fn count(&self) -> u64 {
        self.added
    }

    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.filter.serialize()
    }

    /// True once false-positive pressure exceeds the configured bound and the
    /// filter should be rebuilt at larger capacity. A filter already at the
    /// datagram-size cap cannot grow; its false-positive rate degrades
    /// gracefully instead.
    pub fn is_saturated(&self) -> bool {
        if self.filter.bit_size() >= MAX_BLOOM_BITS {
            return false;
        }
        self.added as usize > self.target_items * 2
            || self.filter.false_positive_estimate(self.added as usize) > self.target_fpr * 2.0
    }

    /// Rebuild at doubled capacity from the full set of known ids.
    pub fn rebuild<I: IntoIterator<Item = EventId>>(&mut self, ids: I) {
        self.target_items *= 2;
        self.filter = BloomFilter::optimal(self.target_items, self.target_fpr);
        self.added = 0;
        for id in ids {
            self.add(&id);
        }
    }
}
