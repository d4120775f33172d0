//! Identity cards.
//!
//! A card binds an identity string to a public key and carries the
//! directory-assigned card id. Card issuance and verification happen outside
//! this crate; sessions only read the fields.

use serde::{Deserialize, Serialize};

/// Length of a decoded card id.
pub const CARD_ID_LEN: usize = 32;

/// Algorithm of an identity public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Ed25519 signing key (the only algorithm sessions accept)
    Ed25519,
    /// Raw X25519 key
    Curve25519,
    /// NIST P-256 key
    Secp256r1,
}

/// Identity public key as published on a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityPublicKey {
    /// Key algorithm
    pub algorithm: KeyAlgorithm,
    /// Exported raw key bytes
    pub bytes: Vec<u8>,
}

impl IdentityPublicKey {
    /// Ed25519 key from raw bytes.
    pub fn ed25519(bytes: impl Into<Vec<u8>>) -> Self {
        Self { algorithm: KeyAlgorithm::Ed25519, bytes: bytes.into() }
    }

    /// Exported raw key bytes.
    pub fn export(&self) -> &[u8] {
        &self.bytes
    }
}

/// Identity card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// Card id, lowercase hex of [`CARD_ID_LEN`] bytes
    pub identifier: String,
    /// Identity the card was issued to
    pub identity: String,
    /// Identity public key
    pub public_key: IdentityPublicKey,
}

impl Card {
    /// Create a card.
    pub fn new(
        identifier: impl Into<String>,
        identity: impl Into<String>,
        public_key: IdentityPublicKey,
    ) -> Self {
        Self { identifier: identifier.into(), identity: identity.into(), public_key }
    }

    /// Decoded card id. `None` if the id is not hex of the expected length.
    pub fn decoded_id(&self) -> Option<[u8; CARD_ID_LEN]> {
        decode_card_id(&self.identifier)
    }
}

/// Decode a hex card id. `None` if it is not hex of [`CARD_ID_LEN`] bytes.
pub fn decode_card_id(identifier: &str) -> Option<[u8; CARD_ID_LEN]> {
    let bytes = hex::decode(identifier).ok()?;
    bytes.try_into().ok()
}
