//! Error types for session state machines.
//!
//! Pairwise and group sessions fail with their own enums. Crypto engine
//! errors pass through unchanged so callers can tell tampering from
//! protocol misuse.

use keyward_crypto::CryptoError;
use thiserror::Error;

use crate::{group::GroupMessageType, session::MessageType};

/// Errors from [`SecureSession`](crate::SecureSession).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Crypto engine failure (bad key bytes, authentication failure, message
    /// order)
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Message has the wrong type for the operation
    #[error("invalid message type: expected {expected:?}, got {actual:?}")]
    InvalidMessageType {
        /// Type the operation requires
        expected: MessageType,
        /// Type that was supplied
        actual: MessageType,
    },

    /// Prekey message names a long-term key other than the one supplied
    #[error("prekey message was built for a different long-term key")]
    LongTermKeyMismatch,

    /// One-time key presence differs between message and receiver
    #[error(
        "one-time key mismatch: message uses one: {message_has_key}, \
         receiver has one: {receiver_has_key}"
    )]
    OneTimeKeyMismatch {
        /// Whether the prekey message references a one-time key
        message_has_key: bool,
        /// Whether the receiver supplied one-time key material
        receiver_has_key: bool,
    },

    /// Message arrived on a ratchet key before any receiving chain exists
    #[error("no receiving chain for ratchet key")]
    NoReceivingChain,

    /// Decrypted bytes are not valid UTF-8
    #[error("decrypted message is not valid UTF-8")]
    InvalidUtf8,

    /// Encoding or decoding of session state or messages failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Errors from [`SecureGroupSession`](crate::SecureGroupSession).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupSessionError {
    /// Crypto engine failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Message has the wrong type for the operation
    #[error("invalid message type: expected {expected:?}, got {actual:?}")]
    InvalidMessageType {
        /// Type the operation requires
        expected: GroupMessageType,
        /// Type that was supplied
        actual: GroupMessageType,
    },

    /// Ticket epoch is not exactly one past the current epoch
    #[error("ticket is not consecutive: current epoch {current}, ticket epoch {ticket}")]
    NotConsecutiveTicket {
        /// Current epoch of the session
        current: u64,
        /// Epoch carried by the ticket
        ticket: u64,
    },

    /// Ticket epoch is behind the current epoch
    #[error("stale ticket: current epoch {current}, ticket epoch {ticket}")]
    StaleTicket {
        /// Current epoch of the session
        current: u64,
        /// Epoch carried by the ticket
        ticket: u64,
    },

    /// Message or ticket belongs to another group session
    #[error("session id mismatch")]
    SessionIdMismatch,

    /// Card id is not hex of the expected length, or does not match the
    /// message sender
    #[error("invalid card id: {0}")]
    InvalidCardId(String),

    /// Card key is not an Ed25519 identity key
    #[error("participant public key is not an Ed25519 identity key")]
    InvalidKeyType,

    /// Sender is not a participant in the message epoch
    #[error("unknown participant: {0}")]
    UnknownParticipant(String),

    /// Message epoch is no longer (or not yet) held by this session
    #[error("epoch {epoch} not found")]
    EpochNotFound {
        /// Epoch carried by the message
        epoch: u64,
    },

    /// Message signature does not verify against the sender's identity key
    #[error("invalid message signature")]
    InvalidSignature,

    /// Decrypted bytes are not valid UTF-8
    #[error("decrypted message is not valid UTF-8")]
    InvalidUtf8,

    /// Encoding or decoding of session state or messages failed
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl GroupSessionError {
    /// Returns true if the error indicates the caller applied tickets out of
    /// order or missed one.
    ///
    /// These are recoverable by resynchronising membership; every other
    /// variant is a malformed message or misuse.
    pub fn is_epoch_ordering(&self) -> bool {
        matches!(
            self,
            Self::NotConsecutiveTicket { .. }
                | Self::StaleTicket { .. }
                | Self::EpochNotFound { .. }
        )
    }
}
