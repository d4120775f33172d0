//! Key rotation.
//!
//! Reconciles the local key inventory with the remote directory: retires
//! keys past their grace periods, marks keys the directory has handed out,
//! rotates the long-term key, and tops the one-time pool back up.
//!
//! # Failure semantics
//!
//! Rotation is not atomic. Keys generated before a failing upload stay in
//! storage; the next run validates them against the directory, orphans the
//! ones it never received and tops the pool up again.

use std::{fmt, time::Duration};

use keyward_core::Environment;
use keyward_crypto::{IdentityKeyPair, KeyId, KeyPair};
use keyward_store::{Interaction, LongTermKey, OneTimeKey, OneTimeKeyStore, Storage, StorageError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::directory::{DirectoryError, KeyUpload, RemoteKeyDirectory, SignedPublicKey};

/// Rotation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotatorConfig {
    /// How long an orphaned one-time key is kept before deletion
    pub orphaned_one_time_key_ttl: Duration,
    /// How long a long-term key is used before rotation
    pub long_term_key_ttl: Duration,
    /// How long an outdated long-term key is kept before deletion
    pub outdated_long_term_key_ttl: Duration,
    /// Target size of the one-time key pool
    pub desired_one_time_keys: usize,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            orphaned_one_time_key_ttl: Duration::from_secs(24 * 60 * 60),
            long_term_key_ttl: Duration::from_secs(5 * 24 * 60 * 60),
            outdated_long_term_key_ttl: Duration::from_secs(24 * 60 * 60),
            desired_one_time_keys: 100,
        }
    }
}

/// Counters from one rotation run. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RotationLog {
    /// Usable one-time keys after the run
    pub one_time_keys_relevant: usize,
    /// One-time keys generated and uploaded
    pub one_time_keys_added: usize,
    /// Orphaned one-time keys deleted after their grace period
    pub one_time_keys_deleted: usize,
    /// One-time keys newly reported used by the directory
    pub one_time_keys_marked_orphaned: usize,
    /// One-time keys waiting out their orphan grace period
    pub one_time_keys_orphaned: usize,
    /// Usable long-term keys after the run
    pub long_term_keys_relevant: usize,
    /// Long-term keys generated and uploaded (0 or 1)
    pub long_term_keys_added: usize,
    /// Outdated long-term keys deleted after their grace period
    pub long_term_keys_deleted: usize,
    /// Long-term keys newly marked outdated
    pub long_term_keys_marked_outdated: usize,
    /// Long-term keys waiting out their outdated grace period
    pub long_term_keys_outdated: usize,
}

impl fmt::Display for RotationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// Errors from a rotation run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    /// Another rotation is running
    #[error("key rotation already in progress")]
    ConcurrentRotation,

    /// Local key storage failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Remote directory failed (after retries, if wrapped)
    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),
}

/// Keeps the local and published key sets in step.
///
/// Runs are single-flight: a call made while another is in progress fails
/// with [`RotationError::ConcurrentRotation`] instead of waiting.
pub struct KeysRotator<E: Environment, D: RemoteKeyDirectory, S: Storage> {
    env: E,
    identity: IdentityKeyPair,
    card_id: String,
    directory: D,
    one_time: OneTimeKeyStore<S>,
    config: RotatorConfig,
    lock: tokio::sync::Mutex<()>,
}

/// Outcome of sorting the stored long-term keys.
struct LongTermInventory {
    current: Option<LongTermKey>,
    active: usize,
}

impl<E: Environment, D: RemoteKeyDirectory, S: Storage> KeysRotator<E, D, S> {
    /// Create a rotator.
    ///
    /// `one_time` must be the store the rest of the client consumes one-time
    /// keys through, so rotation and handshakes share one interaction scope.
    pub fn new(
        env: E,
        identity: IdentityKeyPair,
        card_id: impl Into<String>,
        directory: D,
        one_time: OneTimeKeyStore<S>,
        config: RotatorConfig,
    ) -> Self {
        Self {
            env,
            identity,
            card_id: card_id.into(),
            directory,
            one_time,
            config,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Rotation thresholds.
    pub fn config(&self) -> &RotatorConfig {
        &self.config
    }

    /// Run one rotation.
    ///
    /// # Errors
    ///
    /// - `ConcurrentRotation` if a run is already in progress
    /// - `Storage` / `Directory` from the failing step; earlier steps are not
    ///   rolled back
    pub async fn rotate(&self) -> Result<RotationLog, RotationError> {
        let Ok(_guard) = self.lock.try_lock() else {
            tracing::debug!("interrupted concurrent key rotation");
            return Err(RotationError::ConcurrentRotation);
        };

        tracing::debug!("key rotation started");
        let interaction = self.one_time.enter()?;
        match self.run(&interaction).await {
            Ok(log) => {
                interaction.exit()?;
                tracing::info!(
                    one_time_relevant = log.one_time_keys_relevant,
                    one_time_added = log.one_time_keys_added,
                    one_time_deleted = log.one_time_keys_deleted,
                    one_time_orphaned = log.one_time_keys_orphaned,
                    long_term_relevant = log.long_term_keys_relevant,
                    long_term_added = log.long_term_keys_added,
                    long_term_deleted = log.long_term_keys_deleted,
                    long_term_outdated = log.long_term_keys_outdated,
                    "key rotation completed"
                );
                Ok(log)
            },
            Err(e) => {
                if let Err(flush) = interaction.exit() {
                    tracing::error!(
                        error = %flush,
                        "one-time key flush failed after rotation error"
                    );
                }
                tracing::warn!(error = %e, "key rotation failed");
                Err(e)
            },
        }
    }

    async fn run(&self, interaction: &Interaction<S>) -> Result<RotationLog, RotationError> {
        let now = self.env.wall_clock_secs();
        let mut log = RotationLog::default();

        let active_one_time = self.sweep_one_time_keys(interaction, now, &mut log)?;
        let long_term = self.sweep_long_term_keys(now, &mut log)?;

        tracing::debug!(
            one_time_active = active_one_time.len(),
            long_term_active = long_term.active,
            "validating local keys"
        );
        let current_id = long_term.current.as_ref().map(|key| key.identifier);
        let used = self.directory.validate_keys(current_id, &active_one_time).await?;

        for key_id in &used.used_one_time_key_ids {
            match interaction.mark_orphaned(key_id, now) {
                Ok(()) => {
                    tracing::debug!(key_id = %key_id, "marked one-time key orphaned");
                    log.one_time_keys_marked_orphaned += 1;
                    log.one_time_keys_orphaned += 1;
                },
                // A handshake consumed it while validation was in flight
                Err(StorageError::KeyNotFound { .. }) => {
                    tracing::debug!(key_id = %key_id, "used one-time key already consumed");
                },
                Err(e) => return Err(e.into()),
            }
        }

        let rotated = if used.used_long_term_key_id.is_some() || long_term.current.is_none() {
            Some(self.generate_long_term_key(now)?)
        } else {
            None
        };

        let relevant_one_time =
            active_one_time.len().saturating_sub(used.used_one_time_key_ids.len());
        let deficit = self.config.desired_one_time_keys.saturating_sub(relevant_one_time);
        tracing::debug!(count = deficit, "generating one-time keys");
        let one_time_public_keys = (0..deficit)
            .map(|_| self.generate_one_time_key(interaction))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            long_term = rotated.is_some(),
            one_time = one_time_public_keys.len(),
            "uploading keys"
        );
        let long_term_added = usize::from(rotated.is_some());
        self.directory
            .upload_keys(KeyUpload {
                identity_card_id: Some(self.card_id.clone()),
                long_term_public_key: rotated,
                one_time_public_keys: one_time_public_keys.clone(),
            })
            .await?;

        log.one_time_keys_added = one_time_public_keys.len();
        log.one_time_keys_relevant = relevant_one_time + one_time_public_keys.len();
        log.long_term_keys_added = long_term_added;
        log.long_term_keys_relevant = long_term.active + long_term_added;
        Ok(log)
    }

    /// Delete expired orphans; return the ids of active one-time keys.
    fn sweep_one_time_keys(
        &self,
        interaction: &Interaction<S>,
        now: u64,
        log: &mut RotationLog,
    ) -> Result<Vec<KeyId>, StorageError> {
        let mut active = Vec::new();
        for key in interaction.retrieve_all_keys()? {
            match key.orphaned_from {
                Some(from) if expired(from, self.config.orphaned_one_time_key_ttl, now) => {
                    tracing::debug!(key_id = %key.identifier, "deleting orphaned one-time key");
                    interaction.delete_key(&key.identifier)?;
                    log.one_time_keys_deleted += 1;
                },
                Some(_) => log.one_time_keys_orphaned += 1,
                None => active.push(key.identifier),
            }
        }
        Ok(active)
    }

    /// Delete expired outdated keys, mark expired active keys outdated, and
    /// find the newest remaining active key.
    fn sweep_long_term_keys(
        &self,
        now: u64,
        log: &mut RotationLog,
    ) -> Result<LongTermInventory, StorageError> {
        let storage = self.one_time.storage();
        let mut inventory = LongTermInventory { current: None, active: 0 };

        for key in storage.retrieve_all_long_term_keys()? {
            match key.outdated_from {
                Some(from) if expired(from, self.config.outdated_long_term_key_ttl, now) => {
                    tracing::debug!(key_id = %key.identifier, "deleting outdated long-term key");
                    storage.delete_long_term_key(&key.identifier)?;
                    log.long_term_keys_deleted += 1;
                },
                Some(_) => log.long_term_keys_outdated += 1,
                None if expired(key.creation_time, self.config.long_term_key_ttl, now) => {
                    tracing::debug!(key_id = %key.identifier, "marking long-term key outdated");
                    storage.mark_long_term_key_outdated(&key.identifier, now)?;
                    log.long_term_keys_marked_outdated += 1;
                    log.long_term_keys_outdated += 1;
                },
                None => {
                    inventory.active += 1;
                    let newer = inventory
                        .current
                        .as_ref()
                        .is_none_or(|current| current.creation_time < key.creation_time);
                    if newer {
                        inventory.current = Some(key);
                    }
                },
            }
        }
        Ok(inventory)
    }

    fn generate_long_term_key(&self, now: u64) -> Result<SignedPublicKey, StorageError> {
        let key_pair = KeyPair::from_random(self.env.random_key());
        tracing::debug!(key_id = %key_pair.key_id(), "rotating long-term key");
        self.one_time.storage().store_long_term_key(&LongTermKey::new(
            key_pair.key_id(),
            key_pair.private_key(),
            now,
        ))?;

        let public_key = key_pair.public_key();
        Ok(SignedPublicKey { public_key, signature: self.identity.sign(&public_key).to_vec() })
    }

    fn generate_one_time_key(
        &self,
        interaction: &Interaction<S>,
    ) -> Result<[u8; keyward_crypto::KEY_LEN], StorageError> {
        let key_pair = KeyPair::from_random(self.env.random_key());
        interaction.store_key(OneTimeKey::new(key_pair.key_id(), key_pair.private_key()))?;
        Ok(key_pair.public_key())
    }
}

/// True once `ttl` has fully elapsed since `from`.
fn expired(from: u64, ttl: Duration, now: u64) -> bool {
    from.saturating_add(ttl.as_secs()) < now
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use keyward_core::env::SimEnv;
    use keyward_crypto::verify_signature;
    use keyward_store::{LongTermKeyStorage, MemoryStorage, OneTimeKeyStorage};

    use super::*;
    use crate::{
        InMemoryKeyDirectory,
        directory::{KeyBundle, UsedKeys},
    };

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct Fixture {
        env: SimEnv,
        server: InMemoryKeyDirectory,
        storage: MemoryStorage,
        identity: IdentityKeyPair,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                env: SimEnv::new(11),
                server: InMemoryKeyDirectory::new(),
                storage: MemoryStorage::new(),
                identity: IdentityKeyPair::from_seed([7; 32]),
            }
        }

        fn directory(&self) -> InMemoryKeyDirectory {
            self.server.connect("alice", &self.identity.public_key())
        }

        fn rotator_with<D: RemoteKeyDirectory>(
            &self,
            directory: D,
            desired: usize,
        ) -> KeysRotator<SimEnv, D, MemoryStorage> {
            let config =
                RotatorConfig { desired_one_time_keys: desired, ..RotatorConfig::default() };
            KeysRotator::new(
                self.env.clone(),
                self.identity.clone(),
                "ab".repeat(32),
                directory,
                OneTimeKeyStore::new(self.storage.clone()),
                config,
            )
        }

        fn rotator(
            &self,
            desired: usize,
        ) -> KeysRotator<SimEnv, InMemoryKeyDirectory, MemoryStorage> {
            self.rotator_with(self.directory(), desired)
        }
    }

    /// Accepts validation but refuses every upload.
    struct RejectUploads(InMemoryKeyDirectory);

    #[async_trait]
    impl RemoteKeyDirectory for RejectUploads {
        async fn upload_keys(&self, _upload: KeyUpload) -> Result<(), DirectoryError> {
            Err(DirectoryError::Status { code: 503, body: "maintenance".into() })
        }

        async fn validate_keys(
            &self,
            long_term_key_id: Option<KeyId>,
            one_time_key_ids: &[KeyId],
        ) -> Result<UsedKeys, DirectoryError> {
            self.0.validate_keys(long_term_key_id, one_time_key_ids).await
        }

        async fn fetch_key_set(&self, identity: &str) -> Result<KeyBundle, DirectoryError> {
            self.0.fetch_key_set(identity).await
        }

        async fn fetch_key_sets(
            &self,
            identities: &[String],
        ) -> Result<Vec<KeyBundle>, DirectoryError> {
            self.0.fetch_key_sets(identities).await
        }

        async fn delete_keys(&self) -> Result<(), DirectoryError> {
            self.0.delete_keys().await
        }
    }

    #[tokio::test]
    async fn first_rotation_fills_pool_and_publishes_long_term_key() {
        let fixture = Fixture::new();
        let log = fixture.rotator(5).rotate().await.unwrap();

        assert_eq!(log.one_time_keys_added, 5);
        assert_eq!(log.one_time_keys_relevant, 5);
        assert_eq!(log.long_term_keys_added, 1);
        assert_eq!(log.long_term_keys_relevant, 1);

        assert_eq!(fixture.storage.load_one_time_keys().unwrap().len(), 5);
        assert_eq!(fixture.storage.retrieve_all_long_term_keys().unwrap().len(), 1);
        assert_eq!(fixture.server.one_time_key_count("alice"), 5);

        let published = fixture.server.long_term_key("alice").unwrap();
        let identity_public_key = fixture.identity.public_key();
        verify_signature(&identity_public_key, &published.public_key, &published.signature)
            .unwrap();
    }

    #[test]
    fn rotation_log_renders_as_pretty_json() {
        let log = RotationLog {
            one_time_keys_relevant: 3,
            one_time_keys_added: 3,
            long_term_keys_relevant: 1,
            long_term_keys_added: 1,
            ..RotationLog::default()
        };
        insta::assert_snapshot!(log.to_string(), @r#"
{
  "one_time_keys_relevant": 3,
  "one_time_keys_added": 3,
  "one_time_keys_deleted": 0,
  "one_time_keys_marked_orphaned": 0,
  "one_time_keys_orphaned": 0,
  "long_term_keys_relevant": 1,
  "long_term_keys_added": 1,
  "long_term_keys_deleted": 0,
  "long_term_keys_marked_outdated": 0,
  "long_term_keys_outdated": 0
}
"#);
    }

    #[tokio::test]
    async fn steady_state_rotation_adds_nothing() {
        let fixture = Fixture::new();
        let rotator = fixture.rotator(4);
        rotator.rotate().await.unwrap();

        let log = rotator.rotate().await.unwrap();
        assert_eq!(log, RotationLog {
            one_time_keys_relevant: 4,
            long_term_keys_relevant: 1,
            ..RotationLog::default()
        });
        assert_eq!(fixture.server.one_time_key_count("alice"), 4);
    }

    #[tokio::test]
    async fn consumed_keys_are_orphaned_replaced_then_deleted() {
        let fixture = Fixture::new();
        let rotator = fixture.rotator(4);
        rotator.rotate().await.unwrap();

        fixture.server.fetch_key_set("alice").await.unwrap();
        fixture.server.fetch_key_set("alice").await.unwrap();

        let log = rotator.rotate().await.unwrap();
        assert_eq!(log.one_time_keys_marked_orphaned, 2);
        assert_eq!(log.one_time_keys_orphaned, 2);
        assert_eq!(log.one_time_keys_added, 2);
        assert_eq!(log.one_time_keys_relevant, 4);
        assert_eq!(fixture.server.one_time_key_count("alice"), 4);

        fixture.env.advance(DAY);
        let log = rotator.rotate().await.unwrap();
        assert_eq!(log.one_time_keys_orphaned, 2, "grace period not yet over");

        fixture.env.advance(Duration::from_secs(1));
        let log = rotator.rotate().await.unwrap();
        assert_eq!(log.one_time_keys_deleted, 2);
        assert_eq!(log.one_time_keys_orphaned, 0);
        assert_eq!(fixture.storage.load_one_time_keys().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn expired_long_term_key_is_rotated_then_deleted() {
        let fixture = Fixture::new();
        let rotator = fixture.rotator(1);
        rotator.rotate().await.unwrap();
        let first = fixture.server.long_term_key("alice").unwrap();

        fixture.env.advance(5 * DAY + Duration::from_secs(1));
        let log = rotator.rotate().await.unwrap();
        assert_eq!(log.long_term_keys_marked_outdated, 1);
        assert_eq!(log.long_term_keys_outdated, 1);
        assert_eq!(log.long_term_keys_added, 1);
        assert_eq!(log.long_term_keys_relevant, 1);
        assert_ne!(fixture.server.long_term_key("alice").unwrap(), first);

        fixture.env.advance(DAY + Duration::from_secs(1));
        let log = rotator.rotate().await.unwrap();
        assert_eq!(log.long_term_keys_deleted, 1);
        assert_eq!(log.long_term_keys_added, 0);
        assert_eq!(fixture.storage.retrieve_all_long_term_keys().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn replaced_long_term_key_on_directory_triggers_rotation() {
        let fixture = Fixture::new();
        let rotator = fixture.rotator(1);
        rotator.rotate().await.unwrap();

        // Another device published a different long-term key.
        let other = KeyPair::from_random([9; 32]).public_key();
        fixture
            .directory()
            .upload_keys(KeyUpload {
                long_term_public_key: Some(SignedPublicKey {
                    public_key: other,
                    signature: fixture.identity.sign(&other).to_vec(),
                }),
                ..KeyUpload::default()
            })
            .await
            .unwrap();

        let log = rotator.rotate().await.unwrap();
        assert_eq!(log.long_term_keys_added, 1);
        assert_eq!(log.long_term_keys_relevant, 2);
        assert_eq!(fixture.storage.retrieve_all_long_term_keys().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_caller_fails_while_rotation_runs() {
        let fixture = Fixture::new();
        let rotator = fixture.rotator(2);

        let held = rotator.lock.try_lock().unwrap();
        assert_eq!(rotator.rotate().await, Err(RotationError::ConcurrentRotation));
        drop(held);

        assert!(rotator.rotate().await.is_ok());
    }

    #[tokio::test]
    async fn failed_upload_keeps_generated_keys() {
        let fixture = Fixture::new();
        let rotator = fixture.rotator_with(RejectUploads(fixture.directory()), 3);

        let result = rotator.rotate().await;
        assert!(matches!(
            result,
            Err(RotationError::Directory(DirectoryError::Status { code: 503, .. }))
        ));

        assert_eq!(fixture.storage.load_one_time_keys().unwrap().len(), 3);
        assert_eq!(fixture.storage.retrieve_all_long_term_keys().unwrap().len(), 1);
        assert_eq!(fixture.server.one_time_key_count("alice"), 0);

        // The next run against a working directory orphans the unpublished
        // keys and publishes a full pool.
        let log = fixture.rotator(3).rotate().await.unwrap();
        assert_eq!(log.one_time_keys_marked_orphaned, 3);
        assert_eq!(log.one_time_keys_added, 3);
        assert_eq!(log.long_term_keys_added, 1);
        assert_eq!(fixture.server.one_time_key_count("alice"), 3);
    }

    #[test]
    fn expiry_is_strict() {
        assert!(!expired(100, Duration::from_secs(10), 110));
        assert!(expired(100, Duration::from_secs(10), 111));
        assert!(!expired(u64::MAX, Duration::from_secs(10), u64::MAX));
    }

    #[test]
    fn config_defaults() {
        let config = RotatorConfig::default();
        assert_eq!(config.orphaned_one_time_key_ttl, DAY);
        assert_eq!(config.long_term_key_ttl, 5 * DAY);
        assert_eq!(config.outdated_long_term_key_ttl, DAY);
        assert_eq!(config.desired_one_time_keys, 100);
    }
}
