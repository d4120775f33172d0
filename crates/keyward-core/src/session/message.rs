//! Pairwise ratchet messages.
//!
//! The byte encoding (CBOR) is an implementation detail shared by both ends
//! of a session; it is not a stable wire format.

use keyward_crypto::{KEY_LEN, NONCE_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Kind of a [`RatchetMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Message on an established session
    Regular,
    /// Handshake-initiating message carrying the sender's prekey data
    Prekey,
}

/// Header authenticated alongside every ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Sender's current ratchet public key
    pub ratchet_key: [u8; KEY_LEN],
    /// Position in the sender's current chain
    pub generation: u32,
}

impl MessageHeader {
    /// Header bytes bound into the AEAD associated data.
    ///
    /// Layout: ratchet key (32 bytes) || generation (4 bytes, BE).
    pub fn to_bytes(&self) -> [u8; KEY_LEN + 4] {
        let mut bytes = [0u8; KEY_LEN + 4];
        bytes[..KEY_LEN].copy_from_slice(&self.ratchet_key);
        bytes[KEY_LEN..].copy_from_slice(&self.generation.to_be_bytes());
        bytes
    }
}

/// Encrypted payload on a ratchet chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularMessage {
    /// Ratchet header
    pub header: MessageHeader,
    /// `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including the Poly1305 tag
    pub ciphertext: Vec<u8>,
}

/// First messages of a session, sent until the peer replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrekeyMessage {
    /// Sender's ephemeral agreement key
    pub ephemeral_key: [u8; KEY_LEN],
    /// Receiver's long-term public key the sender used
    pub long_term_key: [u8; KEY_LEN],
    /// Receiver's one-time public key, if the bundle had one
    pub one_time_key: Option<[u8; KEY_LEN]>,
    /// The encrypted payload
    pub message: RegularMessage,
}

/// Message exchanged on a [`SecureSession`](crate::SecureSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RatchetMessage {
    /// Established-session message
    Regular(RegularMessage),
    /// Handshake-initiating message
    Prekey(PrekeyMessage),
}

impl RatchetMessage {
    /// Message kind.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Regular(_) => MessageType::Regular,
            Self::Prekey(_) => MessageType::Prekey,
        }
    }

    /// Long-term public key named by a prekey message.
    pub fn long_term_public_key(&self) -> Option<&[u8; KEY_LEN]> {
        match self {
            Self::Prekey(prekey) => Some(&prekey.long_term_key),
            Self::Regular(_) => None,
        }
    }

    /// One-time public key named by a prekey message.
    pub fn one_time_public_key(&self) -> Option<&[u8; KEY_LEN]> {
        match self {
            Self::Prekey(prekey) => prekey.one_time_key.as_ref(),
            Self::Regular(_) => None,
        }
    }

    /// The encrypted payload, regardless of message kind.
    pub fn regular(&self) -> &RegularMessage {
        match self {
            Self::Regular(regular) => regular,
            Self::Prekey(prekey) => &prekey.message,
        }
    }

    /// Encode as CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SessionError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SessionError> {
        ciborium::from_reader(bytes).map_err(|e| SessionError::Serialization(e.to_string()))
    }
}
