//! File chunking and XOR-parity reassembly
//!
//! A file rides the log as ordinary events: fixed-size data chunks plus one
//! XOR parity chunk per group of consecutive data chunks. Chunks are bound to
//! their file by a keyed PRF tag rather than a plaintext file id; the
//! attachment reference inside the parent message carries the key receivers
//! use to recompute the expected tags.

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};
use weft_core::config::SyncConfig;
use weft_core::types::{EventPayload, FileAttachmentRef, FileChunkBody, FileId};

use crate::engine::SyncEngine;

/// Domain prefix for chunk PRF tags
const DOMAIN_CHUNK_TAG: &[u8] = b"weft-chunk";

/// File layer errors
#[derive(Debug, Error)]
pub enum FileError {
    /// Reassembled bytes do not hash to the declared file id. The bad bytes
    /// are withheld; the chunks stay in the log.
    #[error("file reassembly hash mismatch for {0}")]
    Corrupt(FileId),
    #[error("invalid chunking configuration: {0}")]
    InvalidConfig(String),
}

/// Deterministic pseudo-random label binding a chunk to its file.
///
/// `prf_tag = BLAKE3_KEYED(file_key, "weft-chunk" || is_parity || index)[0..8]`
pub fn prf_tag(file_key: &[u8; 32], is_parity: bool, index: u32) -> [u8; 8] {
    let mut hasher = blake3::Hasher::new_keyed(file_key);
    hasher.update(DOMAIN_CHUNK_TAG);
    hasher.update(&[is_parity as u8]);
    hasher.update(&index.to_le_bytes());
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
    tag
}

/// Content address of a file's plaintext.
pub fn file_id_for(bytes: &[u8]) -> FileId {
    let hash = blake3::hash(bytes);
    let mut id = [0u8; 16];
    id.copy_from_slice(&hash.as_bytes()[..16]);
    FileId(id)
}

/// A file split into submittable chunk payloads plus the attachment reference
/// for the parent message.
#[derive(Clone, Debug)]
pub struct ChunkedFile {
    pub attachment: FileAttachmentRef,
    pub chunks: Vec<FileChunkBody>,
}

fn xor_into(acc: &mut [u8], part: &[u8]) {
    for (a, b) in acc.iter_mut().zip(part.iter()) {
        *a ^= b;
    }
}

/// Split a file into data chunks plus one XOR parity chunk per full group of
/// `parity_group_size` data chunks. A trailing partial group carries no
/// parity.
pub fn chunk_file(
    bytes: &[u8],
    mime_type: &str,
    file_name: Option<String>,
    config: &SyncConfig,
    timestamp: i64,
) -> Result<ChunkedFile, FileError> {
    let chunk_size = config.chunk_size_bytes;
    let group = config.parity_group_size;
    if chunk_size == 0 || group == 0 {
        return Err(FileError::InvalidConfig(
            "chunk size and parity group must be positive".into(),
        ));
    }

    let mut file_key = [0u8; 32];
    OsRng.fill_bytes(&mut file_key);

    let data: Vec<&[u8]> = bytes.chunks(chunk_size).collect();
    let chunk_count = data.len() as u32;
    let full_groups = data.len() / group;

    let mut chunks = Vec::with_capacity(data.len() + full_groups);
    for (index, chunk) in data.iter().enumerate() {
        chunks.push(FileChunkBody {
            prf_tag: prf_tag(&file_key, false, index as u32),
            chunk_index: index as u32,
            is_parity: false,
            covers: vec![],
            chunk_bytes: chunk.to_vec(),
            timestamp,
        });
    }
    for parity_index in 0..full_groups {
        // Short final members XOR as if zero-padded to the chunk size.
        let mut parity = vec![0u8; chunk_size];
        let covers: Vec<u32> =
            (parity_index * group..(parity_index + 1) * group).map(|i| i as u32).collect();
        for &i in &covers {
            xor_into(&mut parity, data[i as usize]);
        }
        chunks.push(FileChunkBody {
            prf_tag: prf_tag(&file_key, true, parity_index as u32),
            chunk_index: parity_index as u32,
            is_parity: true,
            covers,
            chunk_bytes: parity,
            timestamp,
        });
    }

    Ok(ChunkedFile {
        attachment: FileAttachmentRef {
            file_id: file_id_for(bytes),
            file_key,
            file_size: bytes.len() as u64,
            chunk_count,
            mime_type: mime_type.to_string(),
            file_name,
            total_parity_chunks: full_groups as u32,
        },
        chunks,
    })
}

/// Reassembly progress against expected data chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileProgress {
    pub received: u32,
    pub total: u32,
    pub percent: u8,
}

/// Terminal-or-not state of one tracked file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileStatus {
    /// Not yet recoverable; a status, not an error.
    Incomplete { received: u32, total: u32 },
    Complete,
    Corrupt,
}

#[derive(Clone, Copy, Debug)]
struct ChunkSlot {
    file_id: FileId,
    index: u32,
    is_parity: bool,
}

struct PendingFile {
    attachment: FileAttachmentRef,
    data: HashMap<u32, Vec<u8>>,
    parity: HashMap<u32, Vec<u8>>,
    complete: bool,
    corrupt: bool,
}

/// Observes inserted events, tracks in-progress files, and reconstructs each
/// one once its data chunks are present directly or recoverable by parity.
pub struct FileAssembler {
    chunk_size: usize,
    parity_group_size: usize,
    files: HashMap<FileId, PendingFile>,
    tags: HashMap<[u8; 8], ChunkSlot>,
    /// Chunks whose attachment reference has not arrived yet, keyed by tag.
    orphans: HashMap<[u8; 8], Vec<u8>>,
    completed: Vec<(FileId, Vec<u8>)>,
}

impl FileAssembler {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            chunk_size: config.chunk_size_bytes,
            parity_group_size: config.parity_group_size,
            files: HashMap::new(),
            tags: HashMap::new(),
            orphans: HashMap::new(),
            completed: Vec::new(),
        }
    }

    /// Wire an assembler into an engine's inserted-event stream.
    pub fn attach(this: &Arc<Mutex<Self>>, engine: &SyncEngine) {
        let assembler = this.clone();
        engine.subscribe(move |_, payload| assembler.lock().on_event(payload));
    }

    /// Feed one inserted event. Messages register their attachments; chunk
    /// events accumulate toward reassembly.
    pub fn on_event(&mut self, payload: &EventPayload) {
        match payload {
            EventPayload::Message(m) => {
                for attachment in &m.attachments {
                    self.register(attachment);
                }
            }
            EventPayload::FileChunk(chunk) => self.on_chunk(chunk),
            EventPayload::Reaction(_) | EventPayload::Unknown { .. } => {}
        }
    }

    /// Start tracking a file and claim any chunks that arrived before its
    /// reference.
    pub fn register(&mut self, attachment: &FileAttachmentRef) {
        let file_id = attachment.file_id;
        if self.files.contains_key(&file_id) {
            return;
        }
        debug!(%file_id, chunks = attachment.chunk_count, "tracking file");

        for index in 0..attachment.chunk_count {
            self.tags.insert(
                prf_tag(&attachment.file_key, false, index),
                ChunkSlot {
                    file_id,
                    index,
                    is_parity: false,
                },
            );
        }
        for index in 0..attachment.total_parity_chunks {
            self.tags.insert(
                prf_tag(&attachment.file_key, true, index),
                ChunkSlot {
                    file_id,
                    index,
                    is_parity: true,
                },
            );
        }

        self.files.insert(
            file_id,
            PendingFile {
                attachment: attachment.clone(),
                data: HashMap::new(),
                parity: HashMap::new(),
                complete: false,
                corrupt: false,
            },
        );

        let claimable: Vec<([u8; 8], ChunkSlot)> = self
            .tags
            .iter()
            .filter(|(tag, slot)| slot.file_id == file_id && self.orphans.contains_key(*tag))
            .map(|(tag, slot)| (*tag, *slot))
            .collect();
        for (tag, slot) in claimable {
            let bytes = self.orphans.remove(&tag).expect("checked above");
            self.place(slot, bytes);
        }
        self.try_assemble(file_id);
    }

    fn on_chunk(&mut self, chunk: &FileChunkBody) {
        match self.tags.get(&chunk.prf_tag).copied() {
            Some(slot) => {
                self.place(slot, chunk.chunk_bytes.clone());
                self.try_assemble(slot.file_id);
            }
            None => {
                trace!(tag = %hex::encode(chunk.prf_tag), "orphan chunk retained");
                self.orphans.insert(chunk.prf_tag, chunk.chunk_bytes.clone());
            }
        }
    }

    fn place(&mut self, slot: ChunkSlot, bytes: Vec<u8>) {
        if let Some(file) = self.files.get_mut(&slot.file_id) {
            if slot.is_parity {
                file.parity.entry(slot.index).or_insert(bytes);
            } else {
                file.data.entry(slot.index).or_insert(bytes);
            }
        }
    }

    fn try_assemble(&mut self, file_id: FileId) {
        let Some(file) = self.files.get_mut(&file_id) else {
            return;
        };
        if file.complete || file.corrupt {
            return;
        }
        let group = self.parity_group_size;
        let chunk_size = self.chunk_size;
        let attachment = &file.attachment;

        let mut assembled: Vec<u8> = Vec::with_capacity(attachment.file_size as usize);
        for index in 0..attachment.chunk_count {
            if let Some(bytes) = file.data.get(&index) {
                assembled.extend_from_slice(bytes);
                continue;
            }
            // Missing: recoverable only if its parity group has the parity
            // chunk and every other member present.
            let group_index = index / group as u32;
            if group_index >= attachment.total_parity_chunks {
                return;
            }
            let Some(parity) = file.parity.get(&group_index) else {
                return;
            };
            let mut recovered = vec![0u8; chunk_size];
            xor_into(&mut recovered, parity);
            for other in group_index * group as u32..(group_index + 1) * group as u32 {
                if other == index {
                    continue;
                }
                match file.data.get(&other) {
                    Some(bytes) => xor_into(&mut recovered, bytes),
                    None => return,
                }
            }
            assembled.extend_from_slice(&recovered);
        }

        assembled.truncate(attachment.file_size as usize);
        if file_id_for(&assembled) != file_id {
            debug!(%file_id, "reassembled bytes fail hash check");
            file.corrupt = true;
            return;
        }
        file.complete = true;
        self.completed.push((file_id, assembled));
    }

    pub fn progress(&self, file_id: &FileId) -> Option<FileProgress> {
        self.files.get(file_id).map(|file| {
            let total = file.attachment.chunk_count;
            let received = file.data.len() as u32;
            FileProgress {
                received,
                total,
                percent: (100.0 * received as f64 / total.max(1) as f64).round() as u8,
            }
        })
    }

    pub fn status(&self, file_id: &FileId) -> Option<FileStatus> {
        self.files.get(file_id).map(|file| {
            if file.complete {
                FileStatus::Complete
            } else if file.corrupt {
                FileStatus::Corrupt
            } else {
                FileStatus::Incomplete {
                    received: file.data.len() as u32,
                    total: file.attachment.chunk_count,
                }
            }
        })
    }

    /// Drain files that finished reassembly since the last call.
    pub fn take_completed(&mut self) -> Vec<(FileId, Vec<u8>)> {
        std::mem::take(&mut self.completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SyncConfig {
        SyncConfig::default()
    }

    fn sample_bytes(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn chunk_payload(chunk: &FileChunkBody) -> EventPayload {
        EventPayload::FileChunk(chunk.clone())
    }

    #[test]
    fn test_chunk_counts() {
        let cfg = config();
        let file = chunk_file(&sample_bytes(1500), "application/octet-stream", None, &cfg, 0)
            .unwrap();
        // 3 data chunks; one parity over [0, 1]; chunk 2 has no partner.
        assert_eq!(file.attachment.chunk_count, 3);
        assert_eq!(file.attachment.total_parity_chunks, 1);
        assert_eq!(file.chunks.len(), 4);
        let parity = file.chunks.iter().find(|c| c.is_parity).unwrap();
        assert_eq!(parity.covers, vec![0, 1]);
        assert_eq!(parity.chunk_bytes.len(), 500);
    }

    #[test]
    fn test_roundtrip_shuffled_delivery() {
        let cfg = config();
        let bytes = sample_bytes(10_240);
        let file = chunk_file(&bytes, "image/png", Some("cat.png".into()), &cfg, 0).unwrap();

        let mut assembler = FileAssembler::new(&cfg);
        assembler.register(&file.attachment);

        // Deliver in reverse order; order never matters.
        for chunk in file.chunks.iter().rev() {
            assembler.on_event(&chunk_payload(chunk));
        }
        let completed = assembler.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1, bytes);
        assert_eq!(
            assembler.status(&file.attachment.file_id),
            Some(FileStatus::Complete)
        );
    }

    #[test]
    fn test_single_loss_per_group_recovered() {
        let cfg = config();
        let bytes = sample_bytes(4_321);
        let file = chunk_file(&bytes, "application/pdf", None, &cfg, 0).unwrap();

        let mut assembler = FileAssembler::new(&cfg);
        assembler.register(&file.attachment);
        // Drop one data chunk from every parity group (the even member).
        for chunk in &file.chunks {
            if !chunk.is_parity
                && chunk.chunk_index % 2 == 0
                && (chunk.chunk_index / 2) < file.attachment.total_parity_chunks
            {
                continue;
            }
            assembler.on_event(&chunk_payload(chunk));
        }
        let completed = assembler.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1, bytes);
    }

    #[test]
    fn test_double_loss_in_group_incomplete() {
        let cfg = config();
        let bytes = sample_bytes(2_000);
        let file = chunk_file(&bytes, "text/plain", None, &cfg, 0).unwrap();

        let mut assembler = FileAssembler::new(&cfg);
        assembler.register(&file.attachment);
        // Drop both members of group 0.
        for chunk in &file.chunks {
            if !chunk.is_parity && chunk.chunk_index <= 1 {
                continue;
            }
            assembler.on_event(&chunk_payload(chunk));
        }
        assert!(assembler.take_completed().is_empty());
        assert_eq!(
            assembler.status(&file.attachment.file_id),
            Some(FileStatus::Incomplete {
                received: 2,
                total: 4
            })
        );
    }

    #[test]
    fn test_spoofed_bytes_marked_corrupt() {
        let cfg = config();
        let bytes = sample_bytes(700);
        let file = chunk_file(&bytes, "text/plain", None, &cfg, 0).unwrap();

        let mut assembler = FileAssembler::new(&cfg);
        assembler.register(&file.attachment);
        for chunk in &file.chunks {
            let mut chunk = chunk.clone();
            if !chunk.is_parity && chunk.chunk_index == 0 {
                chunk.chunk_bytes = vec![0xEE; chunk.chunk_bytes.len()];
            }
            assembler.on_event(&chunk_payload(&chunk));
        }
        assert!(assembler.take_completed().is_empty());
        assert_eq!(
            assembler.status(&file.attachment.file_id),
            Some(FileStatus::Corrupt)
        );
    }

    #[test]
    fn test_orphan_chunks_claimed_on_register() {
        let cfg = config();
        let bytes = sample_bytes(1_100);
        let file = chunk_file(&bytes, "text/plain", None, &cfg, 0).unwrap();

        let mut assembler = FileAssembler::new(&cfg);
        // Chunks land before the message carrying the reference.
        for chunk in &file.chunks {
            assembler.on_event(&chunk_payload(chunk));
        }
        assert!(assembler.take_completed().is_empty());

        assembler.register(&file.attachment);
        let completed = assembler.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1, bytes);
    }

    #[test]
    fn test_progress_counts_data_chunks() {
        let cfg = config();
        let bytes = sample_bytes(2_500);
        let file = chunk_file(&bytes, "text/plain", None, &cfg, 0).unwrap();
        assert_eq!(file.attachment.chunk_count, 5);

        let mut assembler = FileAssembler::new(&cfg);
        assembler.register(&file.attachment);
        for chunk in file.chunks.iter().filter(|c| !c.is_parity).take(2) {
            assembler.on_event(&chunk_payload(chunk));
        }
        assert_eq!(
            assembler.progress(&file.attachment.file_id),
            Some(FileProgress {
                received: 2,
                total: 5,
                percent: 40
            })
        );
    }

    #[test]
    fn test_empty_file_completes_immediately() {
        let cfg = config();
        let file = chunk_file(&[], "text/plain", None, &cfg, 0).unwrap();
        assert_eq!(file.attachment.chunk_count, 0);
        assert!(file.chunks.is_empty());

        let mut assembler = FileAssembler::new(&cfg);
        assembler.register(&file.attachment);
        let completed = assembler.take_completed();
        assert_eq!(completed.len(), 1);
        assert!(completed[0].1.is_empty());
    }

    #[test]
    fn test_parity_group_size_one_duplicates() {
        let mut cfg = config();
        cfg.parity_group_size = 1;
        let bytes = sample_bytes(900);
        let file = chunk_file(&bytes, "text/plain", None, &cfg, 0).unwrap();
        assert_eq!(file.attachment.total_parity_chunks, 2);

        // Every data chunk lost; parity alone recovers each singleton group.
        let mut assembler = FileAssembler::new(&cfg);
        assembler.register(&file.attachment);
        for chunk in file.chunks.iter().filter(|c| c.is_parity) {
            assembler.on_event(&chunk_payload(chunk));
        }
        let completed = assembler.take_completed();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1, bytes);
    }
}
