//! Core protocol types for Weft
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for the encrypted payload encoding.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// 16-byte fixed-size array used for truncated hashes and identifiers.
pub type Bytes16 = [u8; 16];

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Device identifier: BLAKE3("weft-device" || verifying_key)[0..16]
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub Bytes16);

impl DeviceId {
    pub fn as_bytes(&self) -> &Bytes16 {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Event identifier: BLAKE3(ciphertext)[0..16]. Content-addressed: equal
/// ciphertext implies equal id.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub Bytes16);

impl EventId {
    pub fn as_bytes(&self) -> &Bytes16 {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// File identifier: BLAKE3(file plaintext)[0..16]
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub Bytes16);

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// =============================================================================
// EVENT RECORD (the only persisted unit)
// =============================================================================

/// An immutable, encrypted, content-addressed log record.
///
/// `ciphertext` is `nonce || aead_ciphertext || tag` under the community key.
/// `signature`, when present, is the author envelope
/// `author_device_id(16) || ed25519_signature(64)` over the ciphertext bytes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub event_id: EventId,
    pub author: DeviceId,
    /// Author's clock at creation time (from the decrypted payload).
    pub created_at: i64,
    /// This device's clock when the record was first inserted.
    pub received_at: i64,
    pub ciphertext: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

// =============================================================================
// EVENT PAYLOAD (plaintext inside the ciphertext)
// =============================================================================

/// A chat message, optionally carrying file attachment references.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MessageBody {
    pub content: String,
    pub author: DeviceId,
    pub timestamp: i64,
    pub attachments: Vec<FileAttachmentRef>,
}

/// An emoji reaction on a previous event, joined at read time.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReactionBody {
    pub target: EventId,
    pub emoji: String,
    pub author: DeviceId,
    pub timestamp: i64,
    pub remove: bool,
}

/// One fragment of a file, data or XOR parity.
///
/// The PRF tag binds the chunk to its file without exposing the file id in
/// plaintext; receivers recompute expected tags from the attachment's key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FileChunkBody {
    pub prf_tag: [u8; 8],
    pub chunk_index: u32,
    pub is_parity: bool,
    /// Data chunk indexes a parity chunk covers; empty for data chunks.
    pub covers: Vec<u32>,
    pub chunk_bytes: Vec<u8>,
    pub timestamp: i64,
}

/// Reference to a chunked file, carried inside the parent Message. The actual
/// bytes live in separately stored FileChunk events.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FileAttachmentRef {
    pub file_id: FileId,
    pub file_key: [u8; 32],
    /// Declared plaintext length; reassembly truncates parity padding to this.
    pub file_size: u64,
    pub chunk_count: u32,
    pub mime_type: String,
    pub file_name: Option<String>,
    pub total_parity_chunks: u32,
}

/// Union of all event payloads.
///
/// The plaintext encoding is one discriminator byte followed by the postcard
/// body. Unknown discriminators are preserved as [`EventPayload::Unknown`] so
/// newer peers' events survive in older stores.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum EventPayload {
    Message(MessageBody),
    Reaction(ReactionBody),
    FileChunk(FileChunkBody),
    Unknown { tag: u8, body: Vec<u8> },
}

impl EventPayload {
    pub const TAG_MESSAGE: u8 = 0x01;
    pub const TAG_REACTION: u8 = 0x02;
    pub const TAG_FILE_CHUNK: u8 = 0x03;

    /// Serialize to the plaintext form that gets encrypted.
    pub fn to_plain_bytes(&self) -> Result<Vec<u8>> {
        let (tag, body) = match self {
            EventPayload::Message(m) => (Self::TAG_MESSAGE, postcard::to_allocvec(m)?),
            EventPayload::Reaction(r) => (Self::TAG_REACTION, postcard::to_allocvec(r)?),
            EventPayload::FileChunk(c) => (Self::TAG_FILE_CHUNK, postcard::to_allocvec(c)?),
            EventPayload::Unknown { tag, body } => (*tag, body.clone()),
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(tag);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse the plaintext form. Unknown tags are preserved verbatim; a known
    /// tag with a malformed body is an error.
    pub fn from_plain_bytes(bytes: &[u8]) -> Result<Self> {
        let (&tag, body) = bytes
            .split_first()
            .ok_or_else(|| Error::Serialization(postcard::Error::DeserializeUnexpectedEnd))?;
        match tag {
            Self::TAG_MESSAGE => Ok(EventPayload::Message(postcard::from_bytes(body)?)),
            Self::TAG_REACTION => Ok(EventPayload::Reaction(postcard::from_bytes(body)?)),
            Self::TAG_FILE_CHUNK => Ok(EventPayload::FileChunk(postcard::from_bytes(body)?)),
            _ => Ok(EventPayload::Unknown {
                tag,
                body: body.to_vec(),
            }),
        }
    }

    /// Author as declared inside the payload, where the variant carries one.
    pub fn author(&self) -> Option<DeviceId> {
        match self {
            EventPayload::Message(m) => Some(m.author),
            EventPayload::Reaction(r) => Some(r.author),
            EventPayload::FileChunk(_) | EventPayload::Unknown { .. } => None,
        }
    }

    /// Creation timestamp, where the variant carries one.
    pub fn timestamp(&self) -> Option<i64> {
        match self {
            EventPayload::Message(m) => Some(m.timestamp),
            EventPayload::Reaction(r) => Some(r.timestamp),
            EventPayload::FileChunk(c) => Some(c.timestamp),
            EventPayload::Unknown { .. } => None,
        }
    }
}
