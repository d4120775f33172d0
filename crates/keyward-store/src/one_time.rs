//! One-time key store with a counted interaction scope.
//!
//! ```text
//! enter()  depth 0 -> 1   load collection into snapshot
//! enter()  depth 1 -> 2   share snapshot
//! exit()   depth 2 -> 1   no I/O
//! exit()   depth 1 -> 0   save snapshot, drop it
//! ```
//!
//! Key operations live on [`Interaction`], so they cannot be issued while
//! the scope is closed.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::sync::{Arc, Mutex, MutexGuard};

use keyward_crypto::KeyId;

use crate::{OneTimeKey, OneTimeKeyStorage, StorageError};

struct Scope {
    depth: usize,
    /// Present exactly while `depth > 0`
    snapshot: Option<Vec<OneTimeKey>>,
}

/// One-time key store.
///
/// Clones share the scope and snapshot.
#[derive(Clone)]
pub struct OneTimeKeyStore<S: OneTimeKeyStorage> {
    storage: S,
    scope: Arc<Mutex<Scope>>,
}

impl<S: OneTimeKeyStorage> OneTimeKeyStore<S> {
    /// Store backed by `storage`.
    pub fn new(storage: S) -> Self {
        Self { storage, scope: Arc::new(Mutex::new(Scope { depth: 0, snapshot: None })) }
    }

    /// Underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Current nesting depth of the interaction scope.
    pub fn depth(&self) -> usize {
        self.lock().depth
    }

    /// Open (or re-enter) the interaction scope.
    ///
    /// The first entry loads the collection; if that fails the scope stays
    /// closed.
    pub fn enter(&self) -> Result<Interaction<S>, StorageError> {
        let mut scope = self.lock();
        if scope.depth == 0 {
            scope.snapshot = Some(self.storage.load_one_time_keys()?);
        }
        scope.depth += 1;

        tracing::trace!(depth = scope.depth, "one-time key scope entered");
        Ok(Interaction { store: self.clone(), released: false })
    }

    /// Delete every one-time key.
    ///
    /// # Errors
    ///
    /// - `ScopeMisuse` while an interaction is open
    pub fn reset(&self) -> Result<(), StorageError> {
        let scope = self.lock();
        if scope.depth > 0 {
            return Err(StorageError::ScopeMisuse(format!(
                "reset with {} open interaction(s)",
                scope.depth
            )));
        }
        self.storage.save_one_time_keys(&[])
    }

    fn release(&self) -> Result<(), StorageError> {
        let mut scope = self.lock();
        debug_assert!(scope.depth > 0, "interaction released with closed scope");
        scope.depth = scope.depth.saturating_sub(1);
        if scope.depth > 0 {
            return Ok(());
        }

        let snapshot = scope.snapshot.take().unwrap_or_default();
        tracing::trace!(keys = snapshot.len(), "one-time key scope closed, flushing");
        self.storage.save_one_time_keys(&snapshot)
    }

    fn lock(&self) -> MutexGuard<'_, Scope> {
        self.scope.lock().expect("Mutex poisoned")
    }

    fn with_snapshot<T>(
        &self,
        f: impl FnOnce(&mut Vec<OneTimeKey>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut scope = self.lock();
        let snapshot = scope
            .snapshot
            .as_mut()
            .ok_or_else(|| StorageError::ScopeMisuse("scope is closed".to_string()))?;
        f(snapshot)
    }
}

/// Open interaction with a [`OneTimeKeyStore`].
///
/// Released exactly once: by [`exit`](Self::exit), which reports the flush
/// result, or on drop, which logs it.
#[must_use = "dropping an interaction closes it immediately"]
pub struct Interaction<S: OneTimeKeyStorage> {
    store: OneTimeKeyStore<S>,
    released: bool,
}

impl<S: OneTimeKeyStorage> Interaction<S> {
    /// Store a new key.
    ///
    /// # Errors
    ///
    /// - `KeyAlreadyExists` if a key with the same id is stored
    pub fn store_key(&self, key: OneTimeKey) -> Result<(), StorageError> {
        self.store.with_snapshot(|keys| {
            if keys.iter().any(|k| k.identifier == key.identifier) {
                return Err(StorageError::KeyAlreadyExists { key_id: key.identifier });
            }
            keys.push(key);
            Ok(())
        })
    }

    /// Load a key by id.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if no key has this id
    pub fn retrieve_key(&self, key_id: &KeyId) -> Result<OneTimeKey, StorageError> {
        self.store.with_snapshot(|keys| {
            keys.iter()
                .find(|k| k.identifier == *key_id)
                .cloned()
                .ok_or(StorageError::KeyNotFound { key_id: *key_id })
        })
    }

    /// Delete a key by id.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if no key has this id
    pub fn delete_key(&self, key_id: &KeyId) -> Result<(), StorageError> {
        self.store.with_snapshot(|keys| {
            let index = keys
                .iter()
                .position(|k| k.identifier == *key_id)
                .ok_or(StorageError::KeyNotFound { key_id: *key_id })?;
            keys.remove(index);
            Ok(())
        })
    }

    /// All keys in the snapshot.
    pub fn retrieve_all_keys(&self) -> Result<Vec<OneTimeKey>, StorageError> {
        self.store.with_snapshot(|keys| Ok(keys.clone()))
    }

    /// Set the orphaned marker.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` if no key has this id
    /// - `AlreadyMarked` if the key is already orphaned
    pub fn mark_orphaned(&self, key_id: &KeyId, from: u64) -> Result<(), StorageError> {
        self.store.with_snapshot(|keys| {
            let key = keys
                .iter_mut()
                .find(|k| k.identifier == *key_id)
                .ok_or(StorageError::KeyNotFound { key_id: *key_id })?;
            if key.orphaned_from.is_some() {
                return Err(StorageError::AlreadyMarked { key_id: *key_id });
            }
            key.orphaned_from = Some(from);
            Ok(())
        })
    }

    /// Close this interaction. The outermost exit flushes the snapshot.
    pub fn exit(mut self) -> Result<(), StorageError> {
        self.released = true;
        self.store.release()
    }
}

impl<S: OneTimeKeyStorage> Drop for Interaction<S> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.store.release() {
            tracing::error!(error = %e, "one-time key flush failed on implicit exit");
        }
    }
}
