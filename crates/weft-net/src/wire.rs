//! Datagram wire format
//!
//! Every packet shares the framing header
//! `[version:1][type:1][src_device_id:16][payload]` and must fit inside a
//! single UDP datagram. No acknowledgement, no retry; the sync loop closes
//! any gap a lost datagram leaves.

use bytes::BufMut;
use thiserror::Error;
use weft_core::types::DeviceId;

/// Wire protocol version.
pub const WIRE_VERSION: u8 = 1;

/// Safe single-datagram payload cap.
pub const MAX_DATAGRAM_BYTES: usize = 1200;

/// Framing header: version(1) + type(1) + src_device_id(16).
pub const HEADER_LEN: usize = 18;

/// Framing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("datagram too large: {0} bytes (max {MAX_DATAGRAM_BYTES})")]
    TooLarge(usize),
    #[error("datagram truncated")]
    Truncated,
    #[error("unknown wire version: {0}")]
    UnknownVersion(u8),
    #[error("unknown datagram type: {0}")]
    UnknownType(u8),
}

/// Datagram type discriminants
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DatagramType {
    /// Bloom digest advertisement
    Bloom = 0x01,
    /// One encrypted event record
    Event = 0x02,
    /// Optional file-chunk availability hint
    ChunkAnnounce = 0x03,
}

impl TryFrom<u8> for DatagramType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Bloom),
            0x02 => Ok(Self::Event),
            0x03 => Ok(Self::ChunkAnnounce),
            _ => Err(WireError::UnknownType(value)),
        }
    }
}

/// A parsed datagram body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Datagram {
    /// `[event_count:4 LE][bloom_serialized]`
    Bloom { event_count: u32, filter: Vec<u8> },
    /// `[ciphertext_len:2 LE][ciphertext][signature_len:2 LE][signature]`
    Event {
        ciphertext: Vec<u8>,
        signature: Option<Vec<u8>>,
    },
    /// `[prf_tag:8][chunk_index:4 LE][is_parity:1]`
    ChunkAnnounce {
        prf_tag: [u8; 8],
        chunk_index: u32,
        is_parity: bool,
    },
}

impl Datagram {
    pub fn datagram_type(&self) -> DatagramType {
        match self {
            Datagram::Bloom { .. } => DatagramType::Bloom,
            Datagram::Event { .. } => DatagramType::Event,
            Datagram::ChunkAnnounce { .. } => DatagramType::ChunkAnnounce,
        }
    }
}

/// Encode a datagram with its framing header.
pub fn encode(src: DeviceId, datagram: &Datagram) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(HEADER_LEN + 64);
    out.put_u8(WIRE_VERSION);
    out.put_u8(datagram.datagram_type() as u8);
    out.put_slice(&src.0);

    match datagram {
        Datagram::Bloom {
            event_count,
            filter,
        } => {
            out.put_u32_le(*event_count);
            out.put_slice(filter);
        }
        Datagram::Event {
            ciphertext,
            signature,
        } => {
            if ciphertext.len() > u16::MAX as usize {
                return Err(WireError::TooLarge(ciphertext.len()));
            }
            out.put_u16_le(ciphertext.len() as u16);
            out.put_slice(ciphertext);
            let sig = signature.as_deref().unwrap_or(&[]);
            out.put_u16_le(sig.len() as u16);
            out.put_slice(sig);
        }
        Datagram::ChunkAnnounce {
            prf_tag,
            chunk_index,
            is_parity,
        } => {
            out.put_slice(prf_tag);
            out.put_u32_le(*chunk_index);
            out.put_u8(*is_parity as u8);
        }
    }

    if out.len() > MAX_DATAGRAM_BYTES {
        return Err(WireError::TooLarge(out.len()));
    }
    Ok(out)
}

/// Peek the source device id without parsing the body. Used by transports to
/// attribute inbound packets.
pub fn source_of(bytes: &[u8]) -> Option<DeviceId> {
    if bytes.len() < HEADER_LEN || bytes[0] != WIRE_VERSION {
        return None;
    }
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[2..HEADER_LEN]);
    Some(DeviceId(id))
}

/// Decode a full datagram. Unknown version or type is an error the caller
/// drops silently.
pub fn decode(bytes: &[u8]) -> Result<(DeviceId, Datagram), WireError> {
    if bytes.len() > MAX_DATAGRAM_BYTES {
        return Err(WireError::TooLarge(bytes.len()));
    }
    if bytes.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    if bytes[0] != WIRE_VERSION {
        return Err(WireError::UnknownVersion(bytes[0]));
    }
    let datagram_type = DatagramType::try_from(bytes[1])?;
    let mut src = [0u8; 16];
    src.copy_from_slice(&bytes[2..HEADER_LEN]);
    let src = DeviceId(src);
    let body = &bytes[HEADER_LEN..];

    let datagram = match datagram_type {
        DatagramType::Bloom => {
            if body.len() < 4 {
                return Err(WireError::Truncated);
            }
            let event_count = u32::from_le_bytes(body[..4].try_into().expect("4 bytes"));
            Datagram::Bloom {
                event_count,
                filter: body[4..].to_vec(),
            }
        }
        DatagramType::Event => {
            if body.len() < 2 {
                return Err(WireError::Truncated);
            }
            let ct_len = u16::from_le_bytes(body[..2].try_into().expect("2 bytes")) as usize;
            let rest = &body[2..];
            if rest.len() < ct_len + 2 {
                return Err(WireError::Truncated);
            }
            let ciphertext = rest[..ct_len].to_vec();
            let sig_len =
                u16::from_le_bytes(rest[ct_len..ct_len + 2].try_into().expect("2 bytes")) as usize;
            let sig_bytes = &rest[ct_len + 2..];
            if sig_bytes.len() != sig_len {
                return Err(WireError::Truncated);
            }
            Datagram::Event {
                ciphertext,
                signature: (sig_len > 0).then(|| sig_bytes.to_vec()),
            }
        }
        DatagramType::ChunkAnnounce => {
            if body.len() != 13 {
                return Err(WireError::Truncated);
            }
            let mut prf_tag = [0u8; 8];
            prf_tag.copy_from_slice(&body[..8]);
            Datagram::ChunkAnnounce {
                prf_tag,
                chunk_index: u32::from_le_bytes(body[8..12].try_into().expect("4 bytes")),
                is_parity: body[12] != 0,
            }
        }
    };

    Ok((src, datagram))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> DeviceId {
        DeviceId([0xab; 16])
    }

    #[test]
    fn test_event_roundtrip() {
        let d = Datagram::Event {
            ciphertext: vec![1, 2, 3, 4],
            signature: Some(vec![9; 80]),
        };
        let bytes = encode(src(), &d).unwrap();
        let (from, back) = decode(&bytes).unwrap();
        assert_eq!(from, src());
        assert_eq!(back, d);
    }

    #[test]
    fn test_event_without_signature() {
        let d = Datagram::Event {
            ciphertext: vec![5; 40],
            signature: None,
        };
        let bytes = encode(src(), &d).unwrap();
        let (_, back) = decode(&bytes).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_bloom_roundtrip() {
        let d = Datagram::Bloom {
            event_count: 1234,
            filter: vec![0xff; 396],
        };
        let bytes = encode(src(), &d).unwrap();
        assert!(bytes.len() <= MAX_DATAGRAM_BYTES);
        let (_, back) = decode(&bytes).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_announce_roundtrip() {
        let d = Datagram::ChunkAnnounce {
            prf_tag: [7; 8],
            chunk_index: 3,
            is_parity: true,
        };
        let bytes = encode(src(), &d).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 13);
        let (_, back) = decode(&bytes).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn test_source_peek() {
        let bytes = encode(src(), &Datagram::Bloom { event_count: 0, filter: vec![] }).unwrap();
        assert_eq!(source_of(&bytes), Some(src()));
        assert_eq!(source_of(&bytes[..5]), None);
    }

    #[test]
    fn test_unknown_version_and_type() {
        let mut bytes = encode(src(), &Datagram::Bloom { event_count: 0, filter: vec![] }).unwrap();
        bytes[1] = 0x77;
        assert_eq!(decode(&bytes).unwrap_err(), WireError::UnknownType(0x77));
        bytes[0] = 0x02;
        assert_eq!(decode(&bytes).unwrap_err(), WireError::UnknownVersion(0x02));
    }

    #[test]
    fn test_oversize_refused() {
        let d = Datagram::Event {
            ciphertext: vec![0; MAX_DATAGRAM_BYTES],
            signature: None,
        };
        assert!(matches!(encode(src(), &d), Err(WireError::TooLarge(_))));
    }

    #[test]
    fn test_truncated_event_rejected() {
        let d = Datagram::Event {
            ciphertext: vec![1; 32],
            signature: Some(vec![2; 80]),
        };
        let bytes = encode(src(), &d).unwrap();
        assert_eq!(decode(&bytes[..bytes.len() - 1]).unwrap_err(), WireError::Truncated);
    }
}
