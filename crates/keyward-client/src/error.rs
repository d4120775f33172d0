//! Chat client error types.
//!
//! [`SecureChatError`] wraps every failure the orchestrator can surface.
//! [`ErrorKind`] sorts them into the classes callers act on:
//!
//! - `ProtocolState`: wrong message type, duplicate session, id mismatch
//! - `IdentityVerification`: peer keys that do not check out
//! - `Storage`: local persistence failures
//! - `Concurrency`: overlapping rotations, interaction scope misuse
//! - `Directory`: remote failures after retries, inconsistent results

use keyward_core::{GroupSessionError, SessionError};
use keyward_store::StorageError;
use thiserror::Error;

use crate::{directory::DirectoryError, rotator::RotationError};

/// Class of a [`SecureChatError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Operation does not fit the current session or message state
    ProtocolState,
    /// Peer identity or key material failed verification
    IdentityVerification,
    /// Local storage failed or was used incorrectly
    Storage,
    /// Operation conflicts with one already in progress
    Concurrency,
    /// Remote key directory failed or answered inconsistently
    Directory,
}

/// Errors from [`SecureChat`](crate::SecureChat).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecureChatError {
    /// A session with this participant and name is already stored
    #[error("session with {participant} named {name:?} already exists")]
    SessionAlreadyExists {
        /// Peer identity
        participant: String,
        /// Session name
        name: String,
    },

    /// Message is not of the type the operation starts from
    #[error("invalid message type: expected {expected}")]
    InvalidMessageType {
        /// Type the operation requires
        expected: &'static str,
    },

    /// Group session id has the wrong length
    #[error("invalid session id length: expected {expected}, got {actual}")]
    InvalidSessionIdLength {
        /// Required length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Ticket belongs to another group session
    #[error("ticket session id does not match")]
    SessionIdMismatch,

    /// Card key is not an Ed25519 identity key
    #[error("identity key of {identity} is not an Ed25519 key")]
    InvalidKeyType {
        /// Card identity
        identity: String,
    },

    /// Identity key published with the key set differs from the card's
    #[error("identity key of {identity} does not match its card")]
    IdentityKeyMismatch {
        /// Peer identity
        identity: String,
    },

    /// Long-term key signature does not verify against the identity key
    #[error("invalid long-term key signature for {identity}")]
    InvalidSignature {
        /// Peer identity
        identity: String,
    },

    /// Local card id is not hex of the expected length
    #[error("invalid card id: {0}")]
    InvalidCardId(String),

    /// Directory returned key sets that do not line up with the request
    #[error("key set mismatch: requested {requested}, received {received}")]
    KeySetMismatch {
        /// Identities requested
        requested: usize,
        /// Key sets received
        received: usize,
    },

    /// Pairwise session failure
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Group session failure
    #[error("group session error: {0}")]
    GroupSession(#[from] GroupSessionError),

    /// Local storage failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Remote directory failure
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Key rotation failure
    #[error("rotation error: {0}")]
    Rotation(#[from] RotationError),
}

impl SecureChatError {
    /// Class of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionAlreadyExists { .. }
            | Self::InvalidMessageType { .. }
            | Self::InvalidSessionIdLength { .. }
            | Self::SessionIdMismatch
            | Self::Session(_)
            | Self::GroupSession(_) => ErrorKind::ProtocolState,
            Self::InvalidKeyType { .. }
            | Self::IdentityKeyMismatch { .. }
            | Self::InvalidSignature { .. }
            | Self::InvalidCardId(_) => ErrorKind::IdentityVerification,
            Self::Storage(e) => storage_kind(e),
            Self::Directory(_) | Self::KeySetMismatch { .. } => ErrorKind::Directory,
            Self::Rotation(RotationError::ConcurrentRotation) => ErrorKind::Concurrency,
            Self::Rotation(RotationError::Storage(e)) => storage_kind(e),
            Self::Rotation(RotationError::Directory(_)) => ErrorKind::Directory,
        }
    }
}

fn storage_kind(error: &StorageError) -> ErrorKind {
    match error {
        StorageError::ScopeMisuse(_) => ErrorKind::Concurrency,
        _ => ErrorKind::Storage,
    }
}

#[cfg(test)]
mod tests {
    use keyward_crypto::KeyId;

    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let key_id = KeyId::from_bytes([3; 8]);
        let cases = [
            (SecureChatError::SessionIdMismatch, ErrorKind::ProtocolState),
            (
                SecureChatError::InvalidKeyType { identity: "bob".into() },
                ErrorKind::IdentityVerification,
            ),
            (StorageError::KeyNotFound { key_id }.into(), ErrorKind::Storage),
            (StorageError::ScopeMisuse("closed".into()).into(), ErrorKind::Concurrency),
            (RotationError::ConcurrentRotation.into(), ErrorKind::Concurrency),
            (DirectoryError::Network("reset".into()).into(), ErrorKind::Directory),
            (SecureChatError::KeySetMismatch { requested: 2, received: 1 }, ErrorKind::Directory),
            (
                RotationError::Directory(DirectoryError::Network("reset".into())).into(),
                ErrorKind::Directory,
            ),
        ];
        for (error, kind) in cases {
            assert_eq!(error.kind(), kind, "{error}");
        }
    }
}
