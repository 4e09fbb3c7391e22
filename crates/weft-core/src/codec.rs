//! Event encryption, signing, and content addressing
//!
//! Every payload is postcard-serialized behind a discriminator byte,
//! encrypted under the community's shared ChaCha20-Poly1305 key with a fresh
//! random nonce, and addressed by `BLAKE3(ciphertext)[0..16]`. When signed
//! transport is active the ciphertext additionally carries an Ed25519 author
//! envelope so relayed events still verify against the original author.

use crate::error::{Error, Result};
use crate::types::{DeviceId, EventId, EventPayload};
use blake3::Hasher;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use thiserror::Error as ThisError;

/// Truncated-hash id length in bytes.
pub const EVENT_ID_LEN: usize = 16;
/// AEAD nonce length prepended to every ciphertext.
pub const NONCE_LEN: usize = 12;
/// Author envelope: author_device_id(16) || ed25519_signature(64).
pub const SIGNATURE_ENVELOPE_LEN: usize = 16 + 64;

/// Domain prefix for DeviceId derivation
const DOMAIN_DEVICE: &[u8] = b"weft-device";

/// Why an inbound event was refused. Always handled as silent drop-and-count
/// at the sync layer.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    #[error("signature author is not a trusted peer")]
    SignatureUnknownAuthor,
    #[error("signature verification failed")]
    SignatureInvalid,
    #[error("AEAD tag verification failed")]
    AeadTagInvalid,
    #[error("payload parse error")]
    PayloadParseError,
}

/// Compute the content address of a ciphertext.
pub fn event_id_for(ciphertext: &[u8]) -> EventId {
    let hash = blake3::hash(ciphertext);
    let mut id = [0u8; EVENT_ID_LEN];
    id.copy_from_slice(&hash.as_bytes()[..EVENT_ID_LEN]);
    EventId(id)
}

/// Derive a device id from a verifying key.
///
/// `DeviceId = BLAKE3("weft-device" || verifying_key)[0..16]`
pub fn device_id_for(key: &VerifyingKey) -> DeviceId {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_DEVICE);
    hasher.update(key.as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    DeviceId(id)
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    /// Create from seed bytes (for deterministic testing)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn device_id(&self) -> DeviceId {
        device_id_for(&self.verifying_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// A freshly encoded event, ready to insert and transmit.
#[derive(Clone, Debug)]
pub struct EncodedEvent {
    pub event_id: EventId,
    pub ciphertext: Vec<u8>,
    pub signature: Option<Vec<u8>>,
}

/// A verified, decrypted inbound event.
#[derive(Clone, Debug)]
pub struct DecodedEvent {
    pub payload: EventPayload,
    /// Signature-envelope author in signed mode; payload/source attribution
    /// otherwise.
    pub author: DeviceId,
}

/// Encrypts, signs, verifies, and decrypts event payloads.
pub struct EventCodec {
    cipher: ChaCha20Poly1305,
    signing: Option<(DeviceId, SigningKey)>,
    trusted: HashMap<DeviceId, VerifyingKey>,
    require_signatures: bool,
}

impl EventCodec {
    /// Create a codec over the 32-byte community AEAD key. Unsigned mode
    /// until a signing identity is attached.
    pub fn new(community_key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(community_key)),
            signing: None,
            trusted: HashMap::new(),
            require_signatures: false,
        }
    }

    /// Attach the local signing identity; turns on signed transport and
    /// trusts our own key (we decode our own records at read time).
    pub fn with_signing(mut self, keypair: &KeyPair) -> Self {
        let id = keypair.device_id();
        self.trusted.insert(id, keypair.verifying_key());
        self.signing = Some((id, keypair.signing_key.clone()));
        self.require_signatures = true;
        self
    }

    /// Add a peer verification key to the trusted set.
    pub fn with_trusted_peer(mut self, key: VerifyingKey) -> Self {
        self.trusted.insert(device_id_for(&key), key);
        self
    }

    /// Override whether inbound events must carry a valid signature.
    pub fn require_signatures(mut self, required: bool) -> Self {
        self.require_signatures = required;
        self
    }

    pub fn local_device_id(&self) -> Option<DeviceId> {
        self.signing.as_ref().map(|(id, _)| *id)
    }

    pub fn trusted_peers(&self) -> impl Iterator<Item = &DeviceId> {
        self.trusted.keys()
    }

    /// Serialize, encrypt, and (in signed mode) sign a payload.
    ///
    /// Nonces are fresh random bytes per call, so two encodings of the same
    /// payload yield distinct ciphertexts and therefore distinct event ids.
    pub fn encode(&self, payload: &EventPayload) -> Result<EncodedEvent> {
        let plain = payload.to_plain_bytes()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plain.as_slice())
            .map_err(|_| Error::Encryption)?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(&nonce_bytes);
        ciphertext.extend_from_slice(&sealed);

        let signature = self.signing.as_ref().map(|(id, key)| {
            let mut envelope = Vec::with_capacity(SIGNATURE_ENVELOPE_LEN);
            envelope.extend_from_slice(&id.0);
            envelope.extend_from_slice(&key.sign(&ciphertext).to_bytes());
            envelope
        });

        Ok(EncodedEvent {
            event_id: event_id_for(&ciphertext),
            ciphertext,
            signature,
        })
    }

    /// Verify and decrypt an inbound ciphertext.
    ///
    /// `source` is the datagram's source device, used for author attribution
    /// only when the event is unsigned and the payload names no author.
    pub fn decode(
        &self,
        source: DeviceId,
        ciphertext: &[u8],
        signature: Option<&[u8]>,
    ) -> std::result::Result<DecodedEvent, Rejected> {
        let envelope_author = match signature {
            Some(envelope) => {
                if envelope.len() != SIGNATURE_ENVELOPE_LEN {
                    return Err(Rejected::SignatureInvalid);
                }
                let mut author = [0u8; 16];
                author.copy_from_slice(&envelope[..16]);
                let author = DeviceId(author);
                let key = self
                    .trusted
                    .get(&author)
                    .ok_or(Rejected::SignatureUnknownAuthor)?;
                let sig_bytes: [u8; 64] =
                    envelope[16..].try_into().map_err(|_| Rejected::SignatureInvalid)?;
                key.verify(ciphertext, &Signature::from_bytes(&sig_bytes))
                    .map_err(|_| Rejected::SignatureInvalid)?;
                Some(author)
            }
            None if self.require_signatures => {
                // A missing signature in signed mode counts as invalid.
                return Err(Rejected::SignatureInvalid);
            }
            None => None,
        };

        if ciphertext.len() < NONCE_LEN {
            return Err(Rejected::AeadTagInvalid);
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| Rejected::AeadTagInvalid)?;

        let payload =
            EventPayload::from_plain_bytes(&plain).map_err(|_| Rejected::PayloadParseError)?;

        let author = envelope_author
            .or_else(|| payload.author())
            .unwrap_or(source);

        Ok(DecodedEvent { payload, author })
    }
}
