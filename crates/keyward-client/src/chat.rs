//! Chat orchestrator.
//!
//! [`SecureChat`] ties one local identity to its key storage, the remote
//! directory and the session state machines. It starts pairwise and group
//! sessions, consumes one-time keys on inbound handshakes, and runs key
//! rotation and reset.
//!
//! Sessions are never stored implicitly: callers persist them with
//! [`SecureChat::store_session`] / [`SecureChat::store_group_session`] after
//! every state change they want to keep.

use std::{sync::Arc, time::Duration};

use keyward_core::{
    Card, Environment, GroupMessage, GroupMessageType, KeyAlgorithm, MessageType, PeerKeys,
    RatchetMessage, ReceiverKeys, SESSION_ID_LEN, SecureGroupSession, SecureSession,
};
use keyward_crypto::{IdentityKeyPair, KeyId, KeyPair, verify_signature};
use keyward_store::{
    OneTimeKey, OneTimeKeyStore, Storage, StorageError, StoredGroupSession, StoredSession,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    directory::{KeyBundle, KeyUpload, RemoteKeyDirectory},
    error::SecureChatError,
    rotator::{KeysRotator, RotationLog, RotatorConfig},
};

/// Session name used when the caller does not pick one.
pub const DEFAULT_SESSION_NAME: &str = "DEFAULT";

/// Client tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureChatConfig {
    /// Key rotation thresholds
    pub rotation: RotatorConfig,
    /// Delay before a consumed one-time key is replaced
    pub replacement_delay: Duration,
}

impl Default for SecureChatConfig {
    fn default() -> Self {
        Self { rotation: RotatorConfig::default(), replacement_delay: Duration::from_secs(1) }
    }
}

/// Everything a [`SecureChat`] is built from.
pub struct SecureChatContext<E, D, S> {
    /// Local identity key pair
    pub identity: IdentityKeyPair,
    /// Local identity card; its id is uploaded with keys and used as the
    /// group member id
    pub card: Card,
    /// Time and randomness
    pub env: E,
    /// Remote key directory, authenticated as the local identity
    pub directory: D,
    /// Local key and session storage
    pub storage: S,
    /// Tuning
    pub config: SecureChatConfig,
}

/// Session answered from a prekey message.
#[derive(Debug)]
pub struct ReceivedSession<E: Environment> {
    /// The new session. The prekey message has not been decrypted yet.
    pub session: SecureSession<E>,
    /// Background replacement of the consumed one-time key, if one was
    /// consumed and a runtime was available
    pub replacement: Option<JoinHandle<()>>,
}

/// End-to-end encrypted chat client for one identity.
pub struct SecureChat<E: Environment, D: RemoteKeyDirectory, S: Storage> {
    env: E,
    identity: IdentityKeyPair,
    card: Card,
    directory: Arc<D>,
    storage: S,
    one_time: OneTimeKeyStore<S>,
    rotator: KeysRotator<E, Arc<D>, S>,
    config: SecureChatConfig,
}

impl<E: Environment, D: RemoteKeyDirectory, S: Storage> SecureChat<E, D, S> {
    /// Build a client.
    pub fn new(context: SecureChatContext<E, D, S>) -> Self {
        let SecureChatContext { identity, card, env, directory, storage, config } = context;
        let directory = Arc::new(directory);
        let one_time = OneTimeKeyStore::new(storage.clone());
        let rotator = KeysRotator::new(
            env.clone(),
            identity.clone(),
            card.identifier.clone(),
            Arc::clone(&directory),
            one_time.clone(),
            config.rotation,
        );
        Self { env, identity, card, directory, storage, one_time, rotator, config }
    }

    /// Local identity card.
    pub fn identity_card(&self) -> &Card {
        &self.card
    }

    /// Client tuning.
    pub fn config(&self) -> &SecureChatConfig {
        &self.config
    }

    /// Rotate keys; see [`KeysRotator::rotate`].
    pub async fn rotate_keys(&self) -> Result<RotationLog, SecureChatError> {
        tracing::debug!("key rotation requested");
        Ok(self.rotator.rotate().await?)
    }

    /// Start a session with `peer` from its published key set.
    ///
    /// The session is not stored.
    ///
    /// # Errors
    ///
    /// - `SessionAlreadyExists` if a session with `peer` and `name` is stored
    /// - `InvalidKeyType` if the card key is not Ed25519
    /// - `IdentityKeyMismatch` / `InvalidSignature` if the key set does not
    ///   belong to the card
    /// - `Directory` if the key set cannot be fetched
    pub async fn start_session_as_sender(
        &self,
        peer: &Card,
        name: Option<&str>,
    ) -> Result<SecureSession<E>, SecureChatError> {
        let name = name.unwrap_or(DEFAULT_SESSION_NAME);
        tracing::debug!(participant = %peer.identity, name, "starting session");

        self.ensure_no_session(&peer.identity, name)?;
        ensure_ed25519(peer)?;

        let bundle = self.directory.fetch_key_set(&peer.identity).await?;
        self.session_from_bundle(peer, name, &bundle)
    }

    /// Start sessions with several peers using one batched fetch.
    ///
    /// Every card is checked before anything is fetched.
    ///
    /// # Errors
    ///
    /// - Same per-peer errors as [`start_session_as_sender`](Self::start_session_as_sender)
    /// - `KeySetMismatch` if the directory returns a set per peer
    pub async fn start_multiple_sessions_as_sender(
        &self,
        peers: &[Card],
        name: Option<&str>,
    ) -> Result<Vec<SecureSession<E>>, SecureChatError> {
        let name = name.unwrap_or(DEFAULT_SESSION_NAME);
        tracing::debug!(participants = peers.len(), name, "starting sessions");

        for peer in peers {
            self.ensure_no_session(&peer.identity, name)?;
            ensure_ed25519(peer)?;
        }

        let identities: Vec<String> = peers.iter().map(|peer| peer.identity.clone()).collect();
        let bundles = self.directory.fetch_key_sets(&identities).await?;
        let mismatch =
            || SecureChatError::KeySetMismatch { requested: peers.len(), received: bundles.len() };
        if bundles.len() != peers.len() {
            return Err(mismatch());
        }

        peers
            .iter()
            .map(|peer| {
                let bundle = bundles
                    .iter()
                    .find(|bundle| bundle.identity == peer.identity)
                    .ok_or_else(mismatch)?;
                self.session_from_bundle(peer, name, bundle)
            })
            .collect()
    }

    /// Answer a prekey message from `sender`.
    ///
    /// A referenced one-time key is removed from storage before this
    /// returns, and a replacement is generated and uploaded in the
    /// background after [`SecureChatConfig::replacement_delay`]. Replacement
    /// failures are logged; the next rotation tops the pool up regardless.
    ///
    /// The session is not stored.
    ///
    /// # Errors
    ///
    /// - `SessionAlreadyExists` if a session with `sender` and `name` is
    ///   stored
    /// - `InvalidKeyType` if the card key is not Ed25519
    /// - `InvalidMessageType` unless `message` is a prekey message
    /// - `Storage(KeyNotFound)` if the referenced local keys are gone
    pub fn start_session_as_receiver(
        &self,
        sender: &Card,
        message: &RatchetMessage,
        name: Option<&str>,
    ) -> Result<ReceivedSession<E>, SecureChatError> {
        let name = name.unwrap_or(DEFAULT_SESSION_NAME);
        tracing::debug!(participant = %sender.identity, name, "responding to session");

        self.ensure_no_session(&sender.identity, name)?;
        ensure_ed25519(sender)?;

        let long_term_public_key = match (message.message_type(), message.long_term_public_key()) {
            (MessageType::Prekey, Some(key)) => key,
            _ => return Err(SecureChatError::InvalidMessageType { expected: "prekey" }),
        };
        let long_term = self.storage.retrieve_long_term_key(&KeyId::of(long_term_public_key))?;
        let long_term = restore_key_pair(&long_term.material)?;

        let Some(one_time_public_key) = message.one_time_public_key() else {
            tracing::error!(participant = %sender.identity, "responding with weak session");
            let session = self.respond(sender, name, &long_term, None, message)?;
            return Ok(ReceivedSession { session, replacement: None });
        };

        let one_time_id = KeyId::of(one_time_public_key);
        let interaction = self.one_time.enter()?;
        let one_time = restore_key_pair(&interaction.retrieve_key(&one_time_id)?.material)?;
        let session = self.respond(sender, name, &long_term, Some(&one_time), message)?;
        interaction.delete_key(&one_time_id)?;
        interaction.exit()?;
        tracing::debug!(key_id = %one_time_id, "consumed one-time key");

        Ok(ReceivedSession { session, replacement: self.schedule_replacement() })
    }

    /// Ticket for a new group.
    ///
    /// `session_id` must be unique and is typically tied to the transport
    /// channel. The ticket must only travel inside pairwise sessions.
    ///
    /// # Errors
    ///
    /// - `InvalidSessionIdLength` unless `session_id` is 32 bytes
    pub fn start_new_group_session(
        &self,
        session_id: &[u8],
    ) -> Result<GroupMessage, SecureChatError> {
        let session_id: [u8; SESSION_ID_LEN] =
            session_id.try_into().map_err(|_| SecureChatError::InvalidSessionIdLength {
                expected: SESSION_ID_LEN,
                actual: session_id.len(),
            })?;
        Ok(SecureGroupSession::<E>::create_ticket(&self.env, session_id))
    }

    /// Join a group from a ticket.
    ///
    /// `peers` are the other participants. The session is not stored.
    ///
    /// # Errors
    ///
    /// - `InvalidMessageType` unless `ticket` is a group-info message
    /// - `SessionIdMismatch` if the ticket belongs to another group
    /// - `InvalidCardId` if the local card id is malformed
    pub fn start_group_session(
        &self,
        peers: &[Card],
        session_id: &[u8],
        ticket: &GroupMessage,
    ) -> Result<SecureGroupSession<E>, SecureChatError> {
        if ticket.message_type() != GroupMessageType::GroupInfo {
            return Err(SecureChatError::InvalidMessageType { expected: "group info" });
        }
        if ticket.session_id().as_slice() != session_id {
            return Err(SecureChatError::SessionIdMismatch);
        }
        let my_id = self
            .card
            .decoded_id()
            .ok_or_else(|| SecureChatError::InvalidCardId(self.card.identifier.clone()))?;

        Ok(SecureGroupSession::new(self.env.clone(), self.identity.clone(), my_id, ticket, peers)?)
    }

    /// Persist a session, replacing any stored state for its participant
    /// and name.
    pub fn store_session(&self, session: &SecureSession<E>) -> Result<(), SecureChatError> {
        tracing::debug!(
            participant = session.participant_identity(),
            name = session.name(),
            "storing session"
        );
        self.storage.store_session(&StoredSession {
            participant_identity: session.participant_identity().to_string(),
            name: session.name().to_string(),
            state: session.serialize()?,
        })?;
        Ok(())
    }

    /// Stored session with `participant`, if any.
    ///
    /// A record that no longer deserializes is logged and reported as
    /// absent.
    pub fn existing_session(
        &self,
        participant: &str,
        name: Option<&str>,
    ) -> Result<Option<SecureSession<E>>, SecureChatError> {
        let name = name.unwrap_or(DEFAULT_SESSION_NAME);
        let Some(stored) = self.storage.retrieve_session(participant, name)? else {
            return Ok(None);
        };
        match SecureSession::deserialize(&stored.state, self.env.clone()) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::error!(participant, name, error = %e, "stored session is unreadable");
                Ok(None)
            },
        }
    }

    /// Delete one stored session.
    pub fn delete_session(
        &self,
        participant: &str,
        name: Option<&str>,
    ) -> Result<(), SecureChatError> {
        let name = name.unwrap_or(DEFAULT_SESSION_NAME);
        tracing::debug!(participant, name, "deleting session");
        Ok(self.storage.delete_session(participant, name)?)
    }

    /// Delete every stored session with `participant`.
    pub fn delete_all_sessions(&self, participant: &str) -> Result<(), SecureChatError> {
        tracing::debug!(participant, "deleting all sessions");
        Ok(self.storage.delete_sessions(participant)?)
    }

    /// Persist a group session.
    pub fn store_group_session(
        &self,
        session: &SecureGroupSession<E>,
    ) -> Result<(), SecureChatError> {
        let session_id = session.identifier();
        tracing::debug!(session_id = %hex::encode(session_id), "storing group session");
        self.storage.store_group_session(&StoredGroupSession {
            session_id,
            epoch: session.current_epoch(),
            participants_count: session.participants_count() as u64,
            state: session.serialize()?,
        })?;
        Ok(())
    }

    /// Stored group session, if any. Unreadable records count as absent.
    pub fn existing_group_session(
        &self,
        session_id: &[u8; SESSION_ID_LEN],
    ) -> Result<Option<SecureGroupSession<E>>, SecureChatError> {
        let Some(stored) = self.storage.retrieve_group_session(session_id)? else {
            return Ok(None);
        };
        let restored =
            SecureGroupSession::deserialize(&stored.state, self.identity.clone(), self.env.clone());
        match restored {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::error!(
                    session_id = %hex::encode(session_id),
                    error = %e,
                    "stored group session is unreadable"
                );
                Ok(None)
            },
        }
    }

    /// Delete a stored group session.
    pub fn delete_group_session(
        &self,
        session_id: &[u8; SESSION_ID_LEN],
    ) -> Result<(), SecureChatError> {
        tracing::debug!(session_id = %hex::encode(session_id), "deleting group session");
        Ok(self.storage.delete_group_session(session_id)?)
    }

    /// Delete the published keys, then local one-time keys, long-term keys
    /// and pairwise sessions, stopping at the first failure.
    ///
    /// Group sessions are left in place.
    pub async fn reset(&self) -> Result<(), SecureChatError> {
        tracing::debug!("resetting directory keys");
        self.directory.delete_keys().await?;
        tracing::debug!("resetting one-time keys");
        self.one_time.reset()?;
        tracing::debug!("resetting long-term keys");
        self.storage.reset_long_term_keys()?;
        tracing::debug!("resetting sessions");
        self.storage.reset_sessions()?;
        tracing::info!("reset completed");
        Ok(())
    }

    fn ensure_no_session(&self, participant: &str, name: &str) -> Result<(), SecureChatError> {
        if self.storage.retrieve_session(participant, name)?.is_some() {
            return Err(SecureChatError::SessionAlreadyExists {
                participant: participant.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn session_from_bundle(
        &self,
        peer: &Card,
        name: &str,
        bundle: &KeyBundle,
    ) -> Result<SecureSession<E>, SecureChatError> {
        if bundle.identity_public_key != peer.public_key.export() {
            return Err(SecureChatError::IdentityKeyMismatch { identity: peer.identity.clone() });
        }
        let long_term = &bundle.long_term_public_key;
        verify_signature(peer.public_key.export(), &long_term.public_key, &long_term.signature)
            .map_err(|_| SecureChatError::InvalidSignature { identity: peer.identity.clone() })?;

        if bundle.one_time_public_key.is_none() {
            tracing::error!(participant = %peer.identity, "creating weak session");
        }

        Ok(SecureSession::new_as_sender(
            self.env.clone(),
            peer.identity.as_str(),
            name,
            &self.identity,
            PeerKeys {
                identity_public_key: &bundle.identity_public_key,
                long_term_public_key: &long_term.public_key,
                one_time_public_key: bundle.one_time_public_key.as_ref(),
            },
        )?)
    }

    fn respond(
        &self,
        sender: &Card,
        name: &str,
        long_term: &KeyPair,
        one_time: Option<&KeyPair>,
        message: &RatchetMessage,
    ) -> Result<SecureSession<E>, SecureChatError> {
        Ok(SecureSession::new_as_receiver(
            self.env.clone(),
            sender.identity.as_str(),
            name,
            &self.identity,
            sender.public_key.export(),
            ReceiverKeys { long_term, one_time },
            message,
        )?)
    }

    /// Spawn the delayed replacement of one consumed one-time key.
    fn schedule_replacement(&self) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("no async runtime, consumed one-time key is replaced at next rotation");
            return None;
        };

        let env = self.env.clone();
        let one_time = self.one_time.clone();
        let directory = Arc::clone(&self.directory);
        let delay = self.config.replacement_delay;
        tracing::debug!(delay_ms = delay.as_millis() as u64, "one-time key replacement queued");

        Some(runtime.spawn(async move {
            env.sleep(delay).await;
            match replace_one_time_key(&env, &one_time, directory.as_ref()).await {
                Ok(key_id) => tracing::debug!(key_id = %key_id, "one-time key replaced"),
                Err(e) => tracing::error!(error = %e, "one-time key replacement failed"),
            }
        }))
    }
}

async fn replace_one_time_key<E: Environment, D: RemoteKeyDirectory, S: Storage>(
    env: &E,
    one_time: &OneTimeKeyStore<S>,
    directory: &D,
) -> Result<KeyId, SecureChatError> {
    let key_pair = KeyPair::from_random(env.random_key());

    let interaction = one_time.enter()?;
    interaction.store_key(OneTimeKey::new(key_pair.key_id(), key_pair.private_key()))?;
    interaction.exit()?;

    let upload =
        KeyUpload { one_time_public_keys: vec![key_pair.public_key()], ..KeyUpload::default() };
    directory.upload_keys(upload).await?;
    Ok(key_pair.key_id())
}

fn ensure_ed25519(card: &Card) -> Result<(), SecureChatError> {
    if card.public_key.algorithm == KeyAlgorithm::Ed25519 {
        Ok(())
    } else {
        Err(SecureChatError::InvalidKeyType { identity: card.identity.clone() })
    }
}

fn restore_key_pair(material: &[u8]) -> Result<KeyPair, StorageError> {
    KeyPair::from_private_key(material)
        .map_err(|e| StorageError::Serialization(format!("stored key material: {e}")))
}
