//! Error types for cryptographic operations

use thiserror::Error;

/// Errors from key handling, chain ratchets and AEAD.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Invalid key material length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected key length
        expected: usize,
        /// Actual key length
        actual: usize,
    },

    /// Bytes do not encode a valid public key
    #[error("invalid public key: {reason}")]
    InvalidPublicKey {
        /// Why the key was rejected
        reason: String,
    },

    /// Signature did not verify against the given public key
    #[error("signature verification failed")]
    InvalidSignature,

    /// Requested chain position has already been consumed
    #[error("message too old: chain at generation {current}, message at {requested}")]
    MessageTooOld {
        /// Current chain generation
        current: u32,
        /// Generation carried by the message
        requested: u32,
    },

    /// Requested chain position is beyond the skip window
    #[error("too many skipped messages: chain at generation {current}, message at {requested}")]
    TooManySkipped {
        /// Current chain generation
        current: u32,
        /// Generation carried by the message
        requested: u32,
    },

    /// Chain generation would overflow
    #[error("chain generation overflow at {current}")]
    GenerationOverflow {
        /// Current generation when overflow was detected
        current: u32,
    },

    /// Decryption failed (authentication tag mismatch)
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for decryption failure
        reason: String,
    },
}

impl CryptoError {
    /// Returns true if the error stems from message ordering rather than
    /// tampering or malformed input.
    ///
    /// Ordering errors mean the message was valid once but the chain moved
    /// past it (or it arrived too early). Everything else points at a broken
    /// or malicious peer.
    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::MessageTooOld { .. } | Self::TooManySkipped { .. })
    }
}
