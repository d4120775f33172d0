//! In-process key directory for tests and simulation.
//!
//! Reproduces the directory's server-side rules: upload ordering, signature
//! checks on long-term keys, the one-time key cap, first-in-first-out
//! consumption on fetch, and used-key reporting on validation.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use keyward_crypto::{KEY_LEN, KeyId, verify_signature};

use crate::directory::{
    DirectoryError, KeyBundle, KeyUpload, RemoteKeyDirectory, SignedPublicKey, UsedKeys,
};

/// Most one-time keys the directory holds per identity.
pub const MAX_ONE_TIME_KEYS: usize = 150;

struct Entry {
    identity_public_key: Vec<u8>,
    card_id: Option<String>,
    long_term: Option<SignedPublicKey>,
    /// Oldest first
    one_time: VecDeque<[u8; KEY_LEN]>,
}

#[derive(Default)]
struct DirectoryState {
    entries: HashMap<String, Entry>,
    uploads: usize,
    fetched_bundles: usize,
    /// Calls left to fail with a network error
    injected_failures: usize,
}

/// Shared in-memory directory.
///
/// [`InMemoryKeyDirectory::new`] creates the server; [`connect`](Self::connect)
/// returns a handle authenticated as one identity. All handles share state.
#[derive(Clone, Default)]
pub struct InMemoryKeyDirectory {
    state: Arc<Mutex<DirectoryState>>,
    owner: Option<String>,
}

impl InMemoryKeyDirectory {
    /// Empty directory. The returned handle is not authenticated.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `identity` (if new) and return a handle acting as it.
    pub fn connect(&self, identity: &str, identity_public_key: &[u8]) -> Self {
        self.lock().entries.entry(identity.to_string()).or_insert_with(|| Entry {
            identity_public_key: identity_public_key.to_vec(),
            card_id: None,
            long_term: None,
            one_time: VecDeque::new(),
        });
        Self { state: Arc::clone(&self.state), owner: Some(identity.to_string()) }
    }

    /// One-time keys currently held for `identity`.
    pub fn one_time_key_count(&self, identity: &str) -> usize {
        self.lock().entries.get(identity).map_or(0, |entry| entry.one_time.len())
    }

    /// Published long-term key of `identity`.
    pub fn long_term_key(&self, identity: &str) -> Option<SignedPublicKey> {
        self.lock().entries.get(identity).and_then(|entry| entry.long_term.clone())
    }

    /// Number of accepted uploads, across all identities.
    pub fn upload_count(&self) -> usize {
        self.lock().uploads
    }

    /// Number of bundles handed out, across all identities.
    pub fn fetched_bundle_count(&self) -> usize {
        self.lock().fetched_bundles
    }

    /// Fail the next `count` calls with `DirectoryError::Network`.
    pub fn fail_next(&self, count: usize) {
        self.lock().injected_failures = count;
    }

    fn lock(&self) -> MutexGuard<'_, DirectoryState> {
        self.state.lock().expect("Mutex poisoned")
    }

    /// Lock for a call, consuming an injected failure if one is pending.
    fn begin(&self) -> Result<MutexGuard<'_, DirectoryState>, DirectoryError> {
        let mut state = self.lock();
        if state.injected_failures > 0 {
            state.injected_failures -= 1;
            return Err(DirectoryError::Network("injected failure".to_string()));
        }
        Ok(state)
    }

    fn owner(&self) -> Result<&str, DirectoryError> {
        self.owner.as_deref().ok_or_else(|| bad_request(401, "not authenticated"))
    }
}

fn bad_request(code: u16, body: &str) -> DirectoryError {
    DirectoryError::Status { code, body: body.to_string() }
}

fn bundle(identity: &str, entry: &mut Entry) -> Option<KeyBundle> {
    let long_term = entry.long_term.clone()?;
    Some(KeyBundle {
        identity: identity.to_string(),
        identity_public_key: entry.identity_public_key.clone(),
        long_term_public_key: long_term,
        one_time_public_key: entry.one_time.pop_front(),
    })
}

#[async_trait]
impl RemoteKeyDirectory for InMemoryKeyDirectory {
    async fn upload_keys(&self, upload: KeyUpload) -> Result<(), DirectoryError> {
        let owner = self.owner()?;
        let mut state = self.begin()?;
        let entry =
            state.entries.get_mut(owner).ok_or_else(|| bad_request(401, "unknown identity"))?;

        // Check everything before applying anything.
        let has_card = entry.card_id.is_some() || upload.identity_card_id.is_some();
        if let Some(long_term) = &upload.long_term_public_key {
            if !has_card {
                return Err(bad_request(400, "identity card id required"));
            }
            verify_signature(
                &entry.identity_public_key,
                &long_term.public_key,
                &long_term.signature,
            )
            .map_err(|_| bad_request(400, "invalid long-term key signature"))?;
        }
        if !upload.one_time_public_keys.is_empty() {
            if entry.long_term.is_none() && upload.long_term_public_key.is_none() {
                return Err(bad_request(400, "long-term key required"));
            }
            if entry.one_time.len() + upload.one_time_public_keys.len() > MAX_ONE_TIME_KEYS {
                return Err(bad_request(400, "too many one-time keys"));
            }
        }

        if let Some(card_id) = upload.identity_card_id {
            entry.card_id = Some(card_id);
        }
        if let Some(long_term) = upload.long_term_public_key {
            entry.long_term = Some(long_term);
        }
        entry.one_time.extend(upload.one_time_public_keys);
        state.uploads += 1;

        Ok(())
    }

    async fn validate_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
    ) -> Result<UsedKeys, DirectoryError> {
        let owner = self.owner()?;
        let state = self.begin()?;
        let entry = state.entries.get(owner).ok_or_else(|| bad_request(401, "unknown identity"))?;

        let published = entry.long_term.as_ref().map(|key| KeyId::of(&key.public_key));
        let used_long_term_key_id = long_term_key_id.filter(|id| published != Some(*id));

        let held: Vec<KeyId> = entry.one_time.iter().map(|key| KeyId::of(key)).collect();
        let used_one_time_key_ids =
            one_time_key_ids.iter().filter(|id| !held.contains(id)).copied().collect();

        Ok(UsedKeys { used_long_term_key_id, used_one_time_key_ids })
    }

    async fn fetch_key_set(&self, identity: &str) -> Result<KeyBundle, DirectoryError> {
        let mut state = self.begin()?;
        let bundle = state
            .entries
            .get_mut(identity)
            .and_then(|entry| bundle(identity, entry))
            .ok_or_else(|| DirectoryError::NotFound { identity: identity.to_string() })?;
        state.fetched_bundles += 1;
        Ok(bundle)
    }

    async fn fetch_key_sets(
        &self,
        identities: &[String],
    ) -> Result<Vec<KeyBundle>, DirectoryError> {
        let mut state = self.begin()?;
        let mut bundles = Vec::with_capacity(identities.len());
        for identity in identities {
            if let Some(bundle) =
                state.entries.get_mut(identity).and_then(|entry| bundle(identity, entry))
            {
                bundles.push(bundle);
            }
        }
        state.fetched_bundles += bundles.len();
        Ok(bundles)
    }

    async fn delete_keys(&self) -> Result<(), DirectoryError> {
        let owner = self.owner()?;
        let mut state = self.begin()?;
        if let Some(entry) = state.entries.get_mut(owner) {
            entry.card_id = None;
            entry.long_term = None;
            entry.one_time.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keyward_crypto::{IdentityKeyPair, KeyPair};

    use super::*;

    fn signed(identity: &IdentityKeyPair, seed: u8) -> SignedPublicKey {
        let public_key = KeyPair::from_random([seed; 32]).public_key();
        SignedPublicKey { public_key, signature: identity.sign(&public_key).to_vec() }
    }

    fn setup() -> (InMemoryKeyDirectory, InMemoryKeyDirectory, IdentityKeyPair) {
        let identity = IdentityKeyPair::from_seed([1; 32]);
        let server = InMemoryKeyDirectory::new();
        let alice = server.connect("alice", &identity.public_key());
        (server, alice, identity)
    }

    #[tokio::test]
    async fn upload_requires_card_then_long_term_key() {
        let (_server, alice, identity) = setup();

        let one_time_only =
            KeyUpload { one_time_public_keys: vec![[2; 32]], ..KeyUpload::default() };
        assert_eq!(
            alice.upload_keys(one_time_only).await,
            Err(bad_request(400, "long-term key required"))
        );

        let no_card =
            KeyUpload { long_term_public_key: Some(signed(&identity, 3)), ..KeyUpload::default() };
        assert_eq!(
            alice.upload_keys(no_card).await,
            Err(bad_request(400, "identity card id required"))
        );

        let full = KeyUpload {
            identity_card_id: Some("card".into()),
            long_term_public_key: Some(signed(&identity, 3)),
            one_time_public_keys: vec![[4; 32]],
        };
        alice.upload_keys(full).await.unwrap();
        assert_eq!(alice.one_time_key_count("alice"), 1);
    }

    #[tokio::test]
    async fn rejects_long_term_key_signed_by_someone_else() {
        let (_server, alice, _identity) = setup();
        let mallory = IdentityKeyPair::from_seed([9; 32]);
        let upload = KeyUpload {
            identity_card_id: Some("card".into()),
            long_term_public_key: Some(signed(&mallory, 3)),
            one_time_public_keys: vec![],
        };
        assert_eq!(
            alice.upload_keys(upload).await,
            Err(bad_request(400, "invalid long-term key signature"))
        );
        assert_eq!(alice.long_term_key("alice"), None);
    }

    #[tokio::test]
    async fn caps_one_time_keys() {
        let (_server, alice, identity) = setup();
        let upload = KeyUpload {
            identity_card_id: Some("card".into()),
            long_term_public_key: Some(signed(&identity, 3)),
            one_time_public_keys: vec![[5; 32]; MAX_ONE_TIME_KEYS],
        };
        alice.upload_keys(upload).await.unwrap();

        let one_more = KeyUpload { one_time_public_keys: vec![[6; 32]], ..KeyUpload::default() };
        assert_eq!(
            alice.upload_keys(one_more).await,
            Err(bad_request(400, "too many one-time keys"))
        );
        assert_eq!(alice.one_time_key_count("alice"), MAX_ONE_TIME_KEYS);
    }

    #[tokio::test]
    async fn fetch_consumes_one_time_keys_in_order() {
        let (server, alice, identity) = setup();
        let upload = KeyUpload {
            identity_card_id: Some("card".into()),
            long_term_public_key: Some(signed(&identity, 3)),
            one_time_public_keys: vec![[7; 32], [8; 32]],
        };
        alice.upload_keys(upload).await.unwrap();

        let first = server.fetch_key_set("alice").await.unwrap();
        let second = server.fetch_key_set("alice").await.unwrap();
        let third = server.fetch_key_set("alice").await.unwrap();

        assert_eq!(first.one_time_public_key, Some([7; 32]));
        assert_eq!(second.one_time_public_key, Some([8; 32]));
        assert_eq!(third.one_time_public_key, None);
        assert_eq!(first.identity_public_key, identity.public_key().to_vec());
        assert_eq!(server.fetched_bundle_count(), 3);

        assert_eq!(
            server.fetch_key_set("bob").await,
            Err(DirectoryError::NotFound { identity: "bob".into() })
        );
    }

    #[tokio::test]
    async fn validate_reports_consumed_keys() {
        let (server, alice, identity) = setup();
        let long_term = signed(&identity, 3);
        let upload = KeyUpload {
            identity_card_id: Some("card".into()),
            long_term_public_key: Some(long_term.clone()),
            one_time_public_keys: vec![[7; 32], [8; 32]],
        };
        alice.upload_keys(upload).await.unwrap();
        server.fetch_key_set("alice").await.unwrap();

        let ids = [KeyId::of(&[7; 32]), KeyId::of(&[8; 32])];
        let current = KeyId::of(&long_term.public_key);
        let used = alice.validate_keys(Some(current), &ids).await.unwrap();
        assert_eq!(used, UsedKeys {
            used_long_term_key_id: None,
            used_one_time_key_ids: vec![ids[0]],
        });

        let stale = KeyId::from_bytes([0; 8]);
        let used = alice.validate_keys(Some(stale), &[]).await.unwrap();
        assert_eq!(used.used_long_term_key_id, Some(stale));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let (server, _alice, _identity) = setup();
        server.fail_next(2);
        assert!(matches!(server.fetch_key_sets(&[]).await, Err(DirectoryError::Network(_))));
        assert!(matches!(server.fetch_key_sets(&[]).await, Err(DirectoryError::Network(_))));
        assert_eq!(server.fetch_key_sets(&[]).await, Ok(vec![]));
    }

    #[tokio::test]
    async fn unauthenticated_handle_cannot_upload() {
        let server = InMemoryKeyDirectory::new();
        assert_eq!(
            server.upload_keys(KeyUpload::default()).await,
            Err(bad_request(401, "not authenticated"))
        );
    }
}
