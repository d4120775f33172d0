//! Storage error types.
//!
//! - `KeyNotFound` / `KeyAlreadyExists` / `AlreadyMarked`: key store contract
//!   violations
//! - `SessionNotFound`: deleting a session that is not stored
//! - `ScopeMisuse`: one-time key interaction scope used out of order
//! - `Serialization`: failed to encode/decode a record
//! - `Io`: underlying storage system errors

use keyward_crypto::KeyId;
use thiserror::Error;

/// Failure of a key or session store call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No key with this id is stored
    #[error("key not found: {key_id}")]
    KeyNotFound {
        /// Id that was looked up
        key_id: KeyId,
    },

    /// A key with this id is already stored
    #[error("key already exists: {key_id}")]
    KeyAlreadyExists {
        /// Id of the existing key
        key_id: KeyId,
    },

    /// Key already carries an outdated/orphaned marker
    #[error("key already marked: {key_id}")]
    AlreadyMarked {
        /// Id of the marked key
        key_id: KeyId,
    },

    /// Pairwise or group session is not stored
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// One-time key scope used while closed, or reset while open
    #[error("interaction scope misuse: {0}")]
    ScopeMisuse(String),

    /// Stored record could not be encoded or decoded
    #[error("record encoding failed: {0}")]
    Serialization(String),

    /// Backend failure (redb, file system, injected fault)
    #[error("storage backend failed: {0}")]
    Io(String),
}

impl StorageError {
    /// The backend failed rather than the request; a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
