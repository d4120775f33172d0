//! Group messages and membership tickets.

use keyward_crypto::NONCE_SIZE;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{card::CARD_ID_LEN, error::GroupSessionError};

/// Length of a group session id.
pub const SESSION_ID_LEN: usize = 32;

/// Kind of a [`GroupMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupMessageType {
    /// Membership ticket carrying epoch key material
    GroupInfo,
    /// Encrypted payload
    Regular,
}

/// Key material for one group epoch.
///
/// Tickets carry the epoch secret in the clear; they must only be delivered
/// inside pairwise sessions.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupTicket {
    /// Group session id
    pub session_id: [u8; SESSION_ID_LEN],
    /// Epoch the ticket establishes
    pub epoch: u64,
    /// Secret every participant chain of the epoch is derived from
    pub epoch_secret: [u8; 32],
}

impl Drop for GroupTicket {
    fn drop(&mut self) {
        self.epoch_secret.zeroize();
    }
}

impl std::fmt::Debug for GroupTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupTicket")
            .field("session_id", &hex::encode(self.session_id))
            .field("epoch", &self.epoch)
            .finish_non_exhaustive()
    }
}

/// Encrypted, signed group payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegularGroupMessage {
    /// Group session id
    pub session_id: [u8; SESSION_ID_LEN],
    /// Epoch the sender encrypted under
    pub epoch: u64,
    /// Sender's decoded card id
    pub sender_id: [u8; CARD_ID_LEN],
    /// Position in the sender's chain
    pub generation: u32,
    /// `XChaCha20` nonce
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext including the Poly1305 tag
    pub ciphertext: Vec<u8>,
    /// Ed25519 signature over [`signed_bytes`](Self::signed_bytes)
    pub signature: Vec<u8>,
}

impl RegularGroupMessage {
    /// Header bound into the AEAD associated data.
    ///
    /// Layout: `session_id || epoch (BE) || sender_id || generation (BE)`.
    pub fn header_bytes(&self) -> Vec<u8> {
        header_bytes(&self.session_id, self.epoch, &self.sender_id, self.generation)
    }

    /// Bytes covered by the sender's signature: header, nonce and
    /// ciphertext.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = self.header_bytes();
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }
}

pub(crate) fn header_bytes(
    session_id: &[u8; SESSION_ID_LEN],
    epoch: u64,
    sender_id: &[u8; CARD_ID_LEN],
    generation: u32,
) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(SESSION_ID_LEN + 8 + CARD_ID_LEN + 4);
    bytes.extend_from_slice(session_id);
    bytes.extend_from_slice(&epoch.to_be_bytes());
    bytes.extend_from_slice(sender_id);
    bytes.extend_from_slice(&generation.to_be_bytes());
    bytes
}

/// Message exchanged on a [`SecureGroupSession`](crate::SecureGroupSession).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupMessage {
    /// Membership ticket
    GroupInfo(GroupTicket),
    /// Encrypted payload
    Regular(RegularGroupMessage),
}

impl GroupMessage {
    /// Message kind.
    pub fn message_type(&self) -> GroupMessageType {
        match self {
            Self::GroupInfo(_) => GroupMessageType::GroupInfo,
            Self::Regular(_) => GroupMessageType::Regular,
        }
    }

    /// Group session id the message belongs to.
    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        match self {
            Self::GroupInfo(ticket) => &ticket.session_id,
            Self::Regular(message) => &message.session_id,
        }
    }

    /// Epoch the message belongs to.
    pub fn epoch(&self) -> u64 {
        match self {
            Self::GroupInfo(ticket) => ticket.epoch,
            Self::Regular(message) => message.epoch,
        }
    }

    /// Ticket payload, or `InvalidMessageType` for a regular message.
    pub fn ticket(&self) -> Result<&GroupTicket, GroupSessionError> {
        match self {
            Self::GroupInfo(ticket) => Ok(ticket),
            Self::Regular(_) => Err(GroupSessionError::InvalidMessageType {
                expected: GroupMessageType::GroupInfo,
                actual: GroupMessageType::Regular,
            }),
        }
    }

    /// Encode as CBOR.
    pub fn to_bytes(&self) -> Result<Vec<u8>, GroupSessionError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| GroupSessionError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Decode from CBOR.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GroupSessionError> {
        ciborium::from_reader(bytes).map_err(|e| GroupSessionError::Serialization(e.to_string()))
    }
}
