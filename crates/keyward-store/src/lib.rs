//! Keyward Storage
//!
//! Durable state for the key lifecycle and for serialized sessions. Traits
//! are synchronous (no async); implementations share internal state via
//! `Arc`, so clones access the same underlying storage.
//!
//! # Components
//!
//! - [`LongTermKeyStorage`]: one record per long-term key
//! - [`OneTimeKeyStorage`]: the one-time key collection, loaded and saved as
//!   a whole by [`OneTimeKeyStore`]
//! - [`SessionStorage`] / [`GroupSessionStorage`]: serialized sessions
//! - [`MemoryStorage`], [`RedbStorage`], [`ChaoticStorage`]: backends
//!
//! # One-time key scope
//!
//! One-time keys are consumed during handshakes and replenished during
//! rotation, often several at a time. [`OneTimeKeyStore::enter`] opens a
//! counted scope: the first entry loads the collection, every operation works
//! on the in-memory snapshot, and the outermost exit writes it back once.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod chaotic;
mod error;
mod keys;
mod memory;
mod one_time;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
use keyward_crypto::KeyId;
pub use keys::{GROUP_SESSION_ID_LEN, LongTermKey, OneTimeKey, StoredGroupSession, StoredSession};
pub use memory::MemoryStorage;
pub use one_time::{Interaction, OneTimeKeyStore};

pub use self::redb::RedbStorage;

/// Long-term key persistence.
///
/// # Panics
///
/// Implementations may panic if internal synchronization primitives are
/// poisoned (a thread panicked while holding a lock).
pub trait LongTermKeyStorage: Clone + Send + Sync + 'static {
    /// Store a new key.
    ///
    /// # Errors
    ///
    /// - `KeyAlreadyExists` if a key with the same id is stored
    fn store_long_term_key(&self, key: &LongTermKey) -> Result<(), StorageError>;

    /// Load a key by id.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if no key has this id
    fn retrieve_long_term_key(&self, key_id: &KeyId) -> Result<LongTermKey, StorageError>;

    /// Delete a key by id.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if no key has this id
    fn delete_long_term_key(&self, key_id: &KeyId) -> Result<(), StorageError>;

    /// All stored keys. Order is not guaranteed.
    fn retrieve_all_long_term_keys(&self) -> Result<Vec<LongTermKey>, StorageError>;

    /// Set the outdated marker.
    ///
    /// # Invariants
    ///
    /// - Pre: the key exists and is not marked
    /// - Post: `outdated_from == Some(from)`; the marker is never changed
    ///   again
    fn mark_long_term_key_outdated(&self, key_id: &KeyId, from: u64)
    -> Result<(), StorageError>;

    /// Delete every long-term key.
    fn reset_long_term_keys(&self) -> Result<(), StorageError>;
}

/// Durable backend of the one-time key collection.
///
/// Only [`OneTimeKeyStore`] calls these; everything else goes through its
/// interaction scope.
pub trait OneTimeKeyStorage: Clone + Send + Sync + 'static {
    /// Load the whole collection. Empty if nothing was saved yet.
    fn load_one_time_keys(&self) -> Result<Vec<OneTimeKey>, StorageError>;

    /// Replace the whole collection.
    ///
    /// # Invariants
    ///
    /// - Post: a subsequent load returns exactly `keys`, or the previous
    ///   collection if this call failed
    fn save_one_time_keys(&self, keys: &[OneTimeKey]) -> Result<(), StorageError>;
}

/// Pairwise session persistence.
pub trait SessionStorage: Clone + Send + Sync + 'static {
    /// Store a session, overwriting any record for the same participant and
    /// name.
    fn store_session(&self, session: &StoredSession) -> Result<(), StorageError>;

    /// Load a session. `None` if nothing is stored for the pair.
    fn retrieve_session(
        &self,
        participant_identity: &str,
        name: &str,
    ) -> Result<Option<StoredSession>, StorageError>;

    /// Delete one session.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound` if nothing is stored for the pair
    fn delete_session(&self, participant_identity: &str, name: &str) -> Result<(), StorageError>;

    /// Delete every session with a participant, whatever its name.
    fn delete_sessions(&self, participant_identity: &str) -> Result<(), StorageError>;

    /// Delete every pairwise session.
    fn reset_sessions(&self) -> Result<(), StorageError>;
}

/// Group session persistence.
pub trait GroupSessionStorage: Clone + Send + Sync + 'static {
    /// Store a group session, overwriting any record with the same id.
    fn store_group_session(&self, session: &StoredGroupSession) -> Result<(), StorageError>;

    /// Load a group session. `None` if the id is not stored.
    fn retrieve_group_session(
        &self,
        session_id: &[u8; GROUP_SESSION_ID_LEN],
    ) -> Result<Option<StoredGroupSession>, StorageError>;

    /// Delete a group session.
    ///
    /// # Errors
    ///
    /// - `SessionNotFound` if the id is not stored
    fn delete_group_session(
        &self,
        session_id: &[u8; GROUP_SESSION_ID_LEN],
    ) -> Result<(), StorageError>;

    /// Delete every group session.
    fn reset_group_sessions(&self) -> Result<(), StorageError>;
}

/// Everything a chat client persists.
pub trait Storage:
    LongTermKeyStorage + OneTimeKeyStorage + SessionStorage + GroupSessionStorage
{
}

impl<T> Storage for T where
    T: LongTermKeyStorage + OneTimeKeyStorage + SessionStorage + GroupSessionStorage
{
}
