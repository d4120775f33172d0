#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use keyward_crypto::KeyId;

use crate::{
    GROUP_SESSION_ID_LEN, GroupSessionStorage, LongTermKey, LongTermKeyStorage, OneTimeKey,
    OneTimeKeyStorage, SessionStorage, StorageError, StoredGroupSession, StoredSession,
};

/// Storage backend kept entirely in memory.
///
/// Clones share one set of tables, so a test can hand a clone to the chat
/// and inspect what it wrote through the original.
#[derive(Clone)]
pub struct MemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

#[derive(Default)]
struct Tables {
    long_term: BTreeMap<KeyId, LongTermKey>,

    /// Whole one-time key collection, as last saved
    one_time: Vec<OneTimeKey>,

    /// Number of `save_one_time_keys` calls
    one_time_saves: usize,

    /// Keyed by `(participant_identity, name)`
    sessions: BTreeMap<(String, String), StoredSession>,

    groups: BTreeMap<[u8; GROUP_SESSION_ID_LEN], StoredGroupSession>,
}

impl MemoryStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self { tables: Arc::new(Mutex::new(Tables::default())) }
    }

    #[allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().expect("Mutex poisoned")
    }

    /// Number of times the one-time key collection was saved.
    ///
    /// Useful for checking that nested interactions flush once.
    pub fn one_time_key_saves(&self) -> usize {
        self.tables().one_time_saves
    }

    /// Number of stored pairwise sessions.
    pub fn session_count(&self) -> usize {
        self.tables().sessions.len()
    }

    /// Number of stored group sessions.
    pub fn group_session_count(&self) -> usize {
        self.tables().groups.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LongTermKeyStorage for MemoryStorage {
    fn store_long_term_key(&self, key: &LongTermKey) -> Result<(), StorageError> {
        let mut tables = self.tables();
        if tables.long_term.contains_key(&key.identifier) {
            return Err(StorageError::KeyAlreadyExists { key_id: key.identifier });
        }
        tables.long_term.insert(key.identifier, key.clone());
        Ok(())
    }

    fn retrieve_long_term_key(&self, key_id: &KeyId) -> Result<LongTermKey, StorageError> {
        let tables = self.tables();
        tables.long_term.get(key_id).cloned().ok_or(StorageError::KeyNotFound { key_id: *key_id })
    }

    fn delete_long_term_key(&self, key_id: &KeyId) -> Result<(), StorageError> {
        let mut tables = self.tables();
        tables
            .long_term
            .remove(key_id)
            .map(|_| ())
            .ok_or(StorageError::KeyNotFound { key_id: *key_id })
    }

    fn retrieve_all_long_term_keys(&self) -> Result<Vec<LongTermKey>, StorageError> {
        let tables = self.tables();
        Ok(tables.long_term.values().cloned().collect())
    }

    fn mark_long_term_key_outdated(&self, key_id: &KeyId, from: u64) -> Result<(), StorageError> {
        let mut tables = self.tables();
        let key =
            tables.long_term.get_mut(key_id).ok_or(StorageError::KeyNotFound { key_id: *key_id })?;
        if key.outdated_from.is_some() {
            return Err(StorageError::AlreadyMarked { key_id: *key_id });
        }
        key.outdated_from = Some(from);
        Ok(())
    }

    fn reset_long_term_keys(&self) -> Result<(), StorageError> {
        self.tables().long_term.clear();
        Ok(())
    }
}

impl OneTimeKeyStorage for MemoryStorage {
    fn load_one_time_keys(&self) -> Result<Vec<OneTimeKey>, StorageError> {
        Ok(self.tables().one_time.clone())
    }

    fn save_one_time_keys(&self, keys: &[OneTimeKey]) -> Result<(), StorageError> {
        let mut tables = self.tables();
        tables.one_time = keys.to_vec();
        tables.one_time_saves += 1;
        Ok(())
    }
}

impl SessionStorage for MemoryStorage {
    fn store_session(&self, session: &StoredSession) -> Result<(), StorageError> {
        let key = (session.participant_identity.clone(), session.name.clone());
        self.tables().sessions.insert(key, session.clone());
        Ok(())
    }

    fn retrieve_session(
        &self,
        participant_identity: &str,
        name: &str,
    ) -> Result<Option<StoredSession>, StorageError> {
        let tables = self.tables();
        Ok(tables.sessions.get(&(participant_identity.to_string(), name.to_string())).cloned())
    }

    fn delete_session(&self, participant_identity: &str, name: &str) -> Result<(), StorageError> {
        let mut tables = self.tables();
        tables
            .sessions
            .remove(&(participant_identity.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| StorageError::SessionNotFound(format!("{participant_identity}/{name}")))
    }

    fn delete_sessions(&self, participant_identity: &str) -> Result<(), StorageError> {
        let mut tables = self.tables();
        tables.sessions.retain(|(participant, _), _| participant != participant_identity);
        Ok(())
    }

    fn reset_sessions(&self) -> Result<(), StorageError> {
        self.tables().sessions.clear();
        Ok(())
    }
}

impl GroupSessionStorage for MemoryStorage {
    fn store_group_session(&self, session: &StoredGroupSession) -> Result<(), StorageError> {
        let mut tables = self.tables();
        tables.groups.insert(session.session_id, session.clone());
        Ok(())
    }

    fn retrieve_group_session(
        &self,
        session_id: &[u8; GROUP_SESSION_ID_LEN],
    ) -> Result<Option<StoredGroupSession>, StorageError> {
        Ok(self.tables().groups.get(session_id).cloned())
    }

    fn delete_group_session(
        &self,
        session_id: &[u8; GROUP_SESSION_ID_LEN],
    ) -> Result<(), StorageError> {
        let mut tables = self.tables();
        tables
            .groups
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| StorageError::SessionNotFound(hex::encode(session_id)))
    }

    fn reset_group_sessions(&self) -> Result<(), StorageError> {
        self.tables().groups.clear();
        Ok(())
    }
}
