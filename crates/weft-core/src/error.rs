//! Error types for weft-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// weft-core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// AEAD encryption failed
    #[error("AEAD encryption failed")]
    Encryption,

    /// Invalid key material
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Bloom filters with different parameters cannot be merged
    #[error("bloom parameter mismatch: {ours} vs {theirs}")]
    BloomParamsMismatch { ours: String, theirs: String },

    /// Malformed bloom digest bytes
    #[error("malformed bloom digest: {0}")]
    BloomMalformed(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
