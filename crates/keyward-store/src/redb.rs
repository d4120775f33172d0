//! Key and session storage in a single redb file.
//!
//! Each trait call runs in its own redb transaction, so a call that fails
//! leaves the file as it was. Values are CBOR.

use std::{path::Path, sync::Arc};

use keyward_crypto::KeyId;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    GROUP_SESSION_ID_LEN, GroupSessionStorage, LongTermKey, LongTermKeyStorage, OneTimeKey,
    OneTimeKeyStorage, SessionStorage, StorageError, StoredGroupSession, StoredSession,
};

/// Table: long_term_keys
/// Key: key id [8 bytes]
/// Value: CBOR-encoded LongTermKey
const LONG_TERM_KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("long_term_keys");

/// Table: one_time_keys
/// Key: `ONE_TIME_RECORD`
/// Value: CBOR-encoded Vec<OneTimeKey>
const ONE_TIME_KEYS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("one_time_keys");

/// Table: sessions
/// Key: u32 BE identity length || participant identity || session name
/// Value: CBOR-encoded StoredSession
const SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sessions");

/// Table: group_sessions
/// Key: session id [32 bytes]
/// Value: CBOR-encoded StoredGroupSession
const GROUP_SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("group_sessions");

/// The one-time key collection is saved as a single record.
const ONE_TIME_RECORD: &[u8] = b"keys";

/// Persistent storage for one client.
///
/// Clones share the open database; redb serialises writers itself.
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open the database at `path`, creating the file and its four tables
    /// on first use.
    ///
    /// # Errors
    ///
    /// `StorageError::Io` when redb cannot open, lock or initialise the file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io_error)?;

        let txn = db.begin_write().map_err(io_error)?;
        {
            let _ = txn.open_table(LONG_TERM_KEYS).map_err(io_error)?;
            let _ = txn.open_table(ONE_TIME_KEYS).map_err(io_error)?;
            let _ = txn.open_table(SESSIONS).map_err(io_error)?;
            let _ = txn.open_table(GROUP_SESSIONS).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        tracing::debug!(path = %path.as_ref().display(), "opened key store");
        Ok(Self { db: Arc::new(db) })
    }

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
        value: &T,
    ) -> Result<(), StorageError> {
        let bytes = encode(value)?;
        let txn = self.db.begin_write().map_err(io_error)?;
        {
            let mut table = txn.open_table(table).map_err(io_error)?;
            table.insert(key, bytes.as_slice()).map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(table).map_err(io_error)?;

        match table.get(key).map_err(io_error)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Remove one record. Returns whether it existed.
    fn remove(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        key: &[u8],
    ) -> Result<bool, StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;
        let removed = {
            let mut table = txn.open_table(table).map_err(io_error)?;
            table.remove(key).map_err(io_error)?.is_some()
        };
        txn.commit().map_err(io_error)?;

        Ok(removed)
    }

    /// Remove every record whose key starts with `prefix`. An empty prefix
    /// clears the table.
    fn remove_prefixed(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        prefix: &[u8],
    ) -> Result<usize, StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;
        let removed = {
            let mut table = txn.open_table(table).map_err(io_error)?;

            let mut keys = Vec::new();
            for result in table.range(prefix..).map_err(io_error)? {
                let (key, _) = result.map_err(io_error)?;
                if !key.value().starts_with(prefix) {
                    break;
                }
                keys.push(key.value().to_vec());
            }

            for key in &keys {
                table.remove(key.as_slice()).map_err(io_error)?;
            }
            keys.len()
        };
        txn.commit().map_err(io_error)?;

        Ok(removed)
    }
}

impl LongTermKeyStorage for RedbStorage {
    fn store_long_term_key(&self, key: &LongTermKey) -> Result<(), StorageError> {
        let bytes = encode(key)?;
        let txn = self.db.begin_write().map_err(io_error)?;
        {
            let mut table =
                txn.open_table(LONG_TERM_KEYS).map_err(io_error)?;

            let id = key.identifier.as_bytes();
            if table.get(id.as_slice()).map_err(io_error)?.is_some() {
                return Err(StorageError::KeyAlreadyExists { key_id: key.identifier });
            }
            table
                .insert(id.as_slice(), bytes.as_slice())
                .map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        Ok(())
    }

    fn retrieve_long_term_key(&self, key_id: &KeyId) -> Result<LongTermKey, StorageError> {
        self.get(LONG_TERM_KEYS, key_id.as_bytes())?
            .ok_or(StorageError::KeyNotFound { key_id: *key_id })
    }

    fn delete_long_term_key(&self, key_id: &KeyId) -> Result<(), StorageError> {
        if self.remove(LONG_TERM_KEYS, key_id.as_bytes())? {
            Ok(())
        } else {
            Err(StorageError::KeyNotFound { key_id: *key_id })
        }
    }

    fn retrieve_all_long_term_keys(&self) -> Result<Vec<LongTermKey>, StorageError> {
        let txn = self.db.begin_read().map_err(io_error)?;
        let table = txn.open_table(LONG_TERM_KEYS).map_err(io_error)?;

        let mut keys = Vec::new();
        for result in table.iter().map_err(io_error)? {
            let (_, value) = result.map_err(io_error)?;
            keys.push(decode(value.value())?);
        }

        Ok(keys)
    }

    fn mark_long_term_key_outdated(&self, key_id: &KeyId, from: u64) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io_error)?;
        {
            let mut table =
                txn.open_table(LONG_TERM_KEYS).map_err(io_error)?;

            let id = key_id.as_bytes();
            let existing: Option<LongTermKey> = table
                .get(id.as_slice())
                .map_err(io_error)?
                .map(|value| decode(value.value()))
                .transpose()?;

            let mut key = existing.ok_or(StorageError::KeyNotFound { key_id: *key_id })?;
            if key.outdated_from.is_some() {
                return Err(StorageError::AlreadyMarked { key_id: *key_id });
            }
            key.outdated_from = Some(from);

            let bytes = encode(&key)?;
            table
                .insert(id.as_slice(), bytes.as_slice())
                .map_err(io_error)?;
        }
        txn.commit().map_err(io_error)?;

        Ok(())
    }

    fn reset_long_term_keys(&self) -> Result<(), StorageError> {
        let removed = self.remove_prefixed(LONG_TERM_KEYS, &[])?;
        tracing::debug!(removed, "long-term keys reset");
        Ok(())
    }
}

impl OneTimeKeyStorage for RedbStorage {
    fn load_one_time_keys(&self) -> Result<Vec<OneTimeKey>, StorageError> {
        Ok(self.get(ONE_TIME_KEYS, ONE_TIME_RECORD)?.unwrap_or_default())
    }

    fn save_one_time_keys(&self, keys: &[OneTimeKey]) -> Result<(), StorageError> {
        self.put(ONE_TIME_KEYS, ONE_TIME_RECORD, &keys)
    }
}

impl SessionStorage for RedbStorage {
    fn store_session(&self, session: &StoredSession) -> Result<(), StorageError> {
        self.put(SESSIONS, &session_key(&session.participant_identity, &session.name), session)
    }

    fn retrieve_session(
        &self,
        participant_identity: &str,
        name: &str,
    ) -> Result<Option<StoredSession>, StorageError> {
        self.get(SESSIONS, &session_key(participant_identity, name))
    }

    fn delete_session(&self, participant_identity: &str, name: &str) -> Result<(), StorageError> {
        if self.remove(SESSIONS, &session_key(participant_identity, name))? {
            Ok(())
        } else {
            Err(StorageError::SessionNotFound(format!("{participant_identity}/{name}")))
        }
    }

    fn delete_sessions(&self, participant_identity: &str) -> Result<(), StorageError> {
        self.remove_prefixed(SESSIONS, &participant_prefix(participant_identity))?;
        Ok(())
    }

    fn reset_sessions(&self) -> Result<(), StorageError> {
        let removed = self.remove_prefixed(SESSIONS, &[])?;
        tracing::debug!(removed, "sessions reset");
        Ok(())
    }
}

impl GroupSessionStorage for RedbStorage {
    fn store_group_session(&self, session: &StoredGroupSession) -> Result<(), StorageError> {
        self.put(GROUP_SESSIONS, &session.session_id, session)
    }

    fn retrieve_group_session(
        &self,
        session_id: &[u8; GROUP_SESSION_ID_LEN],
    ) -> Result<Option<StoredGroupSession>, StorageError> {
        self.get(GROUP_SESSIONS, session_id)
    }

    fn delete_group_session(
        &self,
        session_id: &[u8; GROUP_SESSION_ID_LEN],
    ) -> Result<(), StorageError> {
        if self.remove(GROUP_SESSIONS, session_id)? {
            Ok(())
        } else {
            Err(StorageError::SessionNotFound(hex::encode(session_id)))
        }
    }

    fn reset_group_sessions(&self) -> Result<(), StorageError> {
        self.remove_prefixed(GROUP_SESSIONS, &[])?;
        Ok(())
    }
}

/// Prefix shared by every session with `participant_identity`:
/// u32 BE length || participant.
///
/// The length keeps identities that contain or extend one another apart.
fn participant_prefix(participant_identity: &str) -> Vec<u8> {
    let identity = participant_identity.as_bytes();
    let len = u32::try_from(identity.len()).unwrap_or(u32::MAX);
    let mut prefix = Vec::with_capacity(4 + identity.len());
    prefix.extend_from_slice(&len.to_be_bytes());
    prefix.extend_from_slice(identity);
    prefix
}

/// Session key: [`participant_prefix`] || name
fn session_key(participant_identity: &str, name: &str) -> Vec<u8> {
    let mut key = participant_prefix(participant_identity);
    key.extend_from_slice(name.as_bytes());
    key
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(value, &mut buffer)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(buffer)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Every redb failure (open, transaction, table, commit) surfaces as `Io`.
fn io_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use zeroize::Zeroizing;

    use super::*;

    fn open() -> (tempfile::TempDir, RedbStorage) {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        (dir, storage)
    }

    fn one_time(byte: u8) -> OneTimeKey {
        OneTimeKey::new(KeyId::from_bytes([byte; 8]), Zeroizing::new(vec![byte; 32]))
    }

    #[test]
    fn test_session_key_encoding() {
        assert_eq!(session_key("ab", "c"), b"\0\0\0\x02abc".to_vec());
        assert_eq!(session_key("ab", ""), participant_prefix("ab"));
        assert_ne!(session_key("a\0b", "c"), session_key("a", "b\0c"));
        assert!(!session_key("a\0x", "y").starts_with(&participant_prefix("a")));
    }

    #[test]
    fn test_long_term_key_roundtrip() {
        let (_dir, storage) = open();
        let key =
            LongTermKey::new(KeyId::from_bytes([1; 8]), Zeroizing::new(vec![0xAA; 32]), 1_000);

        storage.store_long_term_key(&key).unwrap();
        assert_eq!(
            storage.store_long_term_key(&key).unwrap_err(),
            StorageError::KeyAlreadyExists { key_id: key.identifier }
        );

        let loaded = storage.retrieve_long_term_key(&key.identifier).unwrap();
        assert_eq!(loaded.creation_time, 1_000);
        assert_eq!(*loaded.material, vec![0xAA; 32]);
    }

    #[test]
    fn test_mark_outdated_persists() {
        let (_dir, storage) = open();
        let key = LongTermKey::new(KeyId::from_bytes([2; 8]), Zeroizing::new(vec![2; 32]), 5);
        let id = key.identifier;
        storage.store_long_term_key(&key).unwrap();

        storage.mark_long_term_key_outdated(&id, 50).unwrap();
        assert_eq!(
            storage.mark_long_term_key_outdated(&id, 60).unwrap_err(),
            StorageError::AlreadyMarked { key_id: id }
        );
        assert_eq!(storage.retrieve_long_term_key(&id).unwrap().outdated_from, Some(50));

        let missing = KeyId::from_bytes([3; 8]);
        assert_eq!(
            storage.mark_long_term_key_outdated(&missing, 1).unwrap_err(),
            StorageError::KeyNotFound { key_id: missing }
        );
    }

    #[test]
    fn test_reset_long_term_keys() {
        let (_dir, storage) = open();
        for byte in 1..=3 {
            let key = LongTermKey::new(KeyId::from_bytes([byte; 8]), Zeroizing::new(vec![]), 0);
            storage.store_long_term_key(&key).unwrap();
        }
        assert_eq!(storage.retrieve_all_long_term_keys().unwrap().len(), 3);

        storage.reset_long_term_keys().unwrap();
        assert!(storage.retrieve_all_long_term_keys().unwrap().is_empty());
    }

    #[test]
    fn test_one_time_keys_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            assert!(storage.load_one_time_keys().unwrap().is_empty());
            storage.save_one_time_keys(&[one_time(1), one_time(2)]).unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        let keys = storage.load_one_time_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].identifier, KeyId::from_bytes([2; 8]));
    }

    #[test]
    fn test_delete_sessions_by_participant() {
        let (_dir, storage) = open();
        let records = [("alice", "DEFAULT"), ("alice", "work"), ("alice2", "DEFAULT")];
        for (participant, name) in records {
            storage
                .store_session(&StoredSession {
                    participant_identity: participant.to_string(),
                    name: name.to_string(),
                    state: vec![1],
                })
                .unwrap();
        }

        storage.delete_sessions("alice").unwrap();

        assert_eq!(storage.retrieve_session("alice", "DEFAULT").unwrap(), None);
        assert_eq!(storage.retrieve_session("alice", "work").unwrap(), None);
        assert!(storage.retrieve_session("alice2", "DEFAULT").unwrap().is_some());
    }

    #[test]
    fn test_group_session_overwrite() {
        let (_dir, storage) = open();
        let mut record = StoredGroupSession {
            session_id: [4; GROUP_SESSION_ID_LEN],
            epoch: 0,
            participants_count: 2,
            state: vec![0],
        };
        storage.store_group_session(&record).unwrap();

        record.epoch = 1;
        record.participants_count = 3;
        storage.store_group_session(&record).unwrap();

        let loaded = storage.retrieve_group_session(&record.session_id).unwrap();
        assert_eq!(loaded, Some(record.clone()));

        storage.reset_group_sessions().unwrap();
        assert_eq!(storage.retrieve_group_session(&record.session_id).unwrap(), None);
        assert!(matches!(
            storage.delete_group_session(&record.session_id),
            Err(StorageError::SessionNotFound(_))
        ));
    }
}
