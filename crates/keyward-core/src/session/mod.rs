//! Pairwise secure sessions.
//!
//! A [`SecureSession`] is built in one of two roles:
//!
//! - **Sender**: from a peer's published key bundle, without the peer being
//!   online. Its messages carry prekey data until the peer replies.
//! - **Receiver**: from the first prekey message, using the local long-term
//!   and (optionally) one-time private keys the message names.
//!
//! Both roles are established as soon as they are constructed. Every
//! `encrypt`/`decrypt` mutates ratchet state under the session's own lock,
//! so operations on one session never interleave while different sessions
//! run concurrently.
//!
//! Sessions never persist themselves; callers store the serialized state.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

mod message;
mod ratchet;

use std::sync::{Mutex, MutexGuard};

use keyward_crypto::{
    IdentityKeyPair, KEY_LEN, KeyPair, NONCE_SIZE, receiver_shared_secret, sender_shared_secret,
};
pub use message::{MessageHeader, MessageType, PrekeyMessage, RatchetMessage, RegularMessage};
use ratchet::RatchetState;
use serde::{Deserialize, Serialize};

use crate::{env::Environment, error::SessionError};

/// Role a session was constructed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    /// Initiated from the peer's key bundle
    Sender,
    /// Responded to the peer's prekey message
    Receiver,
}

/// Peer key material a sender builds a session from.
#[derive(Debug, Clone, Copy)]
pub struct PeerKeys<'a> {
    /// Peer's raw Ed25519 identity public key
    pub identity_public_key: &'a [u8],
    /// Peer's signed long-term public key (signature already verified)
    pub long_term_public_key: &'a [u8; KEY_LEN],
    /// Peer's one-time public key, if the bundle had one
    pub one_time_public_key: Option<&'a [u8; KEY_LEN]>,
}

/// Local private keys a receiver answers a prekey message with.
#[derive(Debug, Clone, Copy)]
pub struct ReceiverKeys<'a> {
    /// Long-term key the message was built for
    pub long_term: &'a KeyPair,
    /// One-time key the message was built for
    pub one_time: Option<&'a KeyPair>,
}

/// Prekey fields repeated on every sender message until the first reply.
#[derive(Clone, Serialize, Deserialize)]
struct PendingPrekey {
    ephemeral_key: [u8; KEY_LEN],
    long_term_key: [u8; KEY_LEN],
    one_time_key: Option<[u8; KEY_LEN]>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SessionState {
    role: SessionRole,
    ratchet: RatchetState,
    local_identity: [u8; KEY_LEN],
    remote_identity: Vec<u8>,
    pending_prekey: Option<PendingPrekey>,
}

impl SessionState {
    /// Associated data prefix for messages we send.
    fn outgoing_identities(&self) -> Vec<u8> {
        [self.local_identity.as_slice(), &self.remote_identity].concat()
    }

    /// Associated data prefix for messages the peer sent.
    fn incoming_identities(&self) -> Vec<u8> {
        [self.remote_identity.as_slice(), &self.local_identity].concat()
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    participant_identity: String,
    name: String,
    state: SessionState,
}

/// Pairwise double-ratchet session.
pub struct SecureSession<E: Environment> {
    env: E,
    participant_identity: String,
    name: String,
    state: Mutex<SessionState>,
}

impl<E: Environment> SecureSession<E> {
    /// Start a session from the peer's key bundle.
    ///
    /// # Errors
    ///
    /// - `Crypto` if the peer's identity key is not a valid Ed25519 key
    pub fn new_as_sender(
        env: E,
        participant_identity: impl Into<String>,
        name: impl Into<String>,
        identity: &IdentityKeyPair,
        peer: PeerKeys<'_>,
    ) -> Result<Self, SessionError> {
        let ephemeral = KeyPair::from_random(env.random_key());
        let secret = sender_shared_secret(
            identity,
            &ephemeral,
            peer.identity_public_key,
            peer.long_term_public_key,
            peer.one_time_public_key,
        )?;

        let state = SessionState {
            role: SessionRole::Sender,
            ratchet: RatchetState::initialize_sender(&secret, *peer.long_term_public_key),
            local_identity: identity.public_key(),
            remote_identity: peer.identity_public_key.to_vec(),
            pending_prekey: Some(PendingPrekey {
                ephemeral_key: ephemeral.public_key(),
                long_term_key: *peer.long_term_public_key,
                one_time_key: peer.one_time_public_key.copied(),
            }),
        };

        Ok(Self::from_parts(env, participant_identity.into(), name.into(), state))
    }

    /// Answer a prekey message.
    ///
    /// The returned session has not decrypted `message` yet; pass it to
    /// [`decrypt`](Self::decrypt) to read the payload.
    ///
    /// # Errors
    ///
    /// - `InvalidMessageType` unless `message` is a prekey message
    /// - `LongTermKeyMismatch` if the message names another long-term key
    /// - `OneTimeKeyMismatch` if one-time key usage differs between the
    ///   message and `keys`
    pub fn new_as_receiver(
        env: E,
        participant_identity: impl Into<String>,
        name: impl Into<String>,
        identity: &IdentityKeyPair,
        sender_identity_public_key: &[u8],
        keys: ReceiverKeys<'_>,
        message: &RatchetMessage,
    ) -> Result<Self, SessionError> {
        let RatchetMessage::Prekey(prekey) = message else {
            return Err(SessionError::InvalidMessageType {
                expected: MessageType::Prekey,
                actual: message.message_type(),
            });
        };

        if prekey.long_term_key != keys.long_term.public_key() {
            return Err(SessionError::LongTermKeyMismatch);
        }

        let one_time_matches = match (prekey.one_time_key, keys.one_time) {
            (Some(expected), Some(one_time)) => expected == one_time.public_key(),
            (None, None) => true,
            _ => false,
        };
        if !one_time_matches {
            return Err(SessionError::OneTimeKeyMismatch {
                message_has_key: prekey.one_time_key.is_some(),
                receiver_has_key: keys.one_time.is_some(),
            });
        }

        let secret = receiver_shared_secret(
            identity,
            keys.long_term,
            keys.one_time,
            sender_identity_public_key,
            &prekey.ephemeral_key,
        )?;

        let state = SessionState {
            role: SessionRole::Receiver,
            ratchet: RatchetState::initialize_receiver(
                &secret,
                keys.long_term,
                prekey.message.header.ratchet_key,
            ),
            local_identity: identity.public_key(),
            remote_identity: sender_identity_public_key.to_vec(),
            pending_prekey: None,
        };

        Ok(Self::from_parts(env, participant_identity.into(), name.into(), state))
    }

    fn from_parts(env: E, participant_identity: String, name: String, state: SessionState) -> Self {
        Self { env, participant_identity, name, state: Mutex::new(state) }
    }

    /// Identity of the peer.
    pub fn participant_identity(&self) -> &str {
        &self.participant_identity
    }

    /// Conversation discriminator.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role the session was constructed in.
    pub fn role(&self) -> SessionRole {
        self.lock().role
    }

    /// Encrypt a payload.
    ///
    /// Sender sessions emit prekey messages until they decrypt a reply.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<RatchetMessage, SessionError> {
        let ratchet_seed = self.env.random_key();
        let mut nonce = [0u8; NONCE_SIZE];
        self.env.random_bytes(&mut nonce);

        let mut state = self.lock();
        let mut next = state.clone();
        let identities = next.outgoing_identities();
        let regular = next.ratchet.encrypt(plaintext, &identities, ratchet_seed, &nonce)?;

        let message = match &next.pending_prekey {
            Some(pending) => RatchetMessage::Prekey(PrekeyMessage {
                ephemeral_key: pending.ephemeral_key,
                long_term_key: pending.long_term_key,
                one_time_key: pending.one_time_key,
                message: regular,
            }),
            None => RatchetMessage::Regular(regular),
        };

        *state = next;
        Ok(message)
    }

    /// Decrypt a message. A failed decrypt leaves the session unchanged.
    ///
    /// # Errors
    ///
    /// - `Crypto(MessageTooOld)` if the message is behind the receiving chain
    /// - `Crypto(DecryptionFailed)` if authentication fails, including
    ///   messages on a superseded ratchet key
    pub fn decrypt(&self, message: &RatchetMessage) -> Result<Vec<u8>, SessionError> {
        let mut state = self.lock();
        let mut next = state.clone();
        let identities = next.incoming_identities();
        let plaintext = next.ratchet.decrypt(message.regular(), &identities)?;

        if next.pending_prekey.take().is_some() {
            tracing::debug!(
                participant = %self.participant_identity,
                name = %self.name,
                "first reply decrypted, dropping prekey data"
            );
        }

        *state = next;
        Ok(plaintext)
    }

    /// Encrypt a UTF-8 string.
    pub fn encrypt_string(&self, plaintext: &str) -> Result<RatchetMessage, SessionError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt a message holding a UTF-8 string.
    pub fn decrypt_string(&self, message: &RatchetMessage) -> Result<String, SessionError> {
        String::from_utf8(self.decrypt(message)?).map_err(|_| SessionError::InvalidUtf8)
    }

    /// Serialize the full session state, private ratchet keys included.
    pub fn serialize(&self) -> Result<Vec<u8>, SessionError> {
        let persisted = PersistedSession {
            participant_identity: self.participant_identity.clone(),
            name: self.name.clone(),
            state: self.lock().clone(),
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&persisted, &mut bytes)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Restore a session produced by [`serialize`](Self::serialize).
    pub fn deserialize(bytes: &[u8], env: E) -> Result<Self, SessionError> {
        let persisted: PersistedSession = ciborium::from_reader(bytes)
            .map_err(|e| SessionError::Serialization(e.to_string()))?;
        Ok(Self::from_parts(env, persisted.participant_identity, persisted.name, persisted.state))
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().expect("Mutex poisoned")
    }
}

impl<E: Environment> std::fmt::Debug for SecureSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("participant_identity", &self.participant_identity)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::SimEnv;

    struct Fixture {
        env: SimEnv,
        alice: IdentityKeyPair,
        bob: IdentityKeyPair,
        long_term: KeyPair,
        one_time: KeyPair,
    }

    fn fixture() -> Fixture {
        let env = SimEnv::new(42);
        Fixture {
            alice: IdentityKeyPair::from_seed(env.random_key()),
            bob: IdentityKeyPair::from_seed(env.random_key()),
            long_term: KeyPair::from_random(env.random_key()),
            one_time: KeyPair::from_random(env.random_key()),
            env,
        }
    }

    fn sender(f: &Fixture, one_time: bool) -> SecureSession<SimEnv> {
        let long_term = f.long_term.public_key();
        let one_time_key = f.one_time.public_key();
        SecureSession::new_as_sender(
            f.env.clone(),
            "bob",
            "DEFAULT",
            &f.alice,
            PeerKeys {
                identity_public_key: &f.bob.public_key(),
                long_term_public_key: &long_term,
                one_time_public_key: one_time.then_some(&one_time_key),
            },
        )
        .unwrap()
    }

    fn receiver(f: &Fixture, message: &RatchetMessage, one_time: bool) -> SecureSession<SimEnv> {
        SecureSession::new_as_receiver(
            f.env.clone(),
            "alice",
            "DEFAULT",
            &f.bob,
            &f.alice.public_key(),
            ReceiverKeys { long_term: &f.long_term, one_time: one_time.then_some(&f.one_time) },
            message,
        )
        .unwrap()
    }

    #[test]
    fn handshake_and_reply() {
        let f = fixture();
        let alice = sender(&f, true);

        let first = alice.encrypt_string("hello bob").unwrap();
        assert_eq!(first.message_type(), MessageType::Prekey);

        let bob = receiver(&f, &first, true);
        assert_eq!(bob.decrypt_string(&first).unwrap(), "hello bob");

        let reply = bob.encrypt_string("hello alice").unwrap();
        assert_eq!(reply.message_type(), MessageType::Regular);
        assert_eq!(alice.decrypt_string(&reply).unwrap(), "hello alice");

        let after = alice.encrypt_string("ratcheted").unwrap();
        assert_eq!(after.message_type(), MessageType::Regular);
        assert_eq!(bob.decrypt_string(&after).unwrap(), "ratcheted");
    }

    #[test]
    fn weak_session_without_one_time_key() {
        let f = fixture();
        let alice = sender(&f, false);
        let first = alice.encrypt(b"weak").unwrap();
        assert_eq!(first.one_time_public_key(), None);

        let bob = receiver(&f, &first, false);
        assert_eq!(bob.decrypt(&first).unwrap(), b"weak");
    }

    #[test]
    fn sender_repeats_prekey_until_reply() {
        let f = fixture();
        let alice = sender(&f, true);

        let first = alice.encrypt(b"1").unwrap();
        let second = alice.encrypt(b"2").unwrap();
        assert_eq!(second.message_type(), MessageType::Prekey);
        assert_eq!(first.long_term_public_key(), second.long_term_public_key());

        let bob = receiver(&f, &first, true);
        assert_eq!(bob.decrypt(&first).unwrap(), b"1");
        assert_eq!(bob.decrypt(&second).unwrap(), b"2");
    }

    #[test]
    fn receiver_rejects_regular_message() {
        let f = fixture();
        let alice = sender(&f, true);
        let first = alice.encrypt(b"x").unwrap();
        let regular = RatchetMessage::Regular(first.regular().clone());

        let result = SecureSession::new_as_receiver(
            f.env.clone(),
            "alice",
            "DEFAULT",
            &f.bob,
            &f.alice.public_key(),
            ReceiverKeys { long_term: &f.long_term, one_time: Some(&f.one_time) },
            &regular,
        );

        assert!(matches!(
            result,
            Err(SessionError::InvalidMessageType {
                expected: MessageType::Prekey,
                actual: MessageType::Regular,
            })
        ));
    }

    #[test]
    fn receiver_rejects_wrong_long_term_key() {
        let f = fixture();
        let alice = sender(&f, true);
        let first = alice.encrypt(b"x").unwrap();
        let other = KeyPair::from_random([0x55; 32]);

        let result = SecureSession::new_as_receiver(
            f.env.clone(),
            "alice",
            "DEFAULT",
            &f.bob,
            &f.alice.public_key(),
            ReceiverKeys { long_term: &other, one_time: Some(&f.one_time) },
            &first,
        );

        assert!(matches!(result, Err(SessionError::LongTermKeyMismatch)));
    }

    #[test]
    fn receiver_rejects_missing_one_time_key() {
        let f = fixture();
        let alice = sender(&f, true);
        let first = alice.encrypt(b"x").unwrap();

        let result = SecureSession::new_as_receiver(
            f.env.clone(),
            "alice",
            "DEFAULT",
            &f.bob,
            &f.alice.public_key(),
            ReceiverKeys { long_term: &f.long_term, one_time: None },
            &first,
        );

        assert!(matches!(
            result,
            Err(SessionError::OneTimeKeyMismatch { message_has_key: true, receiver_has_key: false })
        ));
    }

    #[test]
    fn failed_decrypt_leaves_state_untouched() {
        let f = fixture();
        let alice = sender(&f, true);
        let first = alice.encrypt(b"first").unwrap();
        let bob = receiver(&f, &first, true);

        let mut tampered = first.clone();
        if let RatchetMessage::Prekey(prekey) = &mut tampered {
            prekey.message.ciphertext[0] ^= 0xFF;
        }
        assert!(bob.decrypt(&tampered).is_err());
        assert_eq!(bob.decrypt(&first).unwrap(), b"first");
    }

    #[test]
    fn replayed_message_is_too_old() {
        let f = fixture();
        let alice = sender(&f, true);
        let first = alice.encrypt(b"once").unwrap();
        let bob = receiver(&f, &first, true);

        bob.decrypt(&first).unwrap();
        assert!(matches!(
            bob.decrypt(&first),
            Err(SessionError::Crypto(keyward_crypto::CryptoError::MessageTooOld { .. }))
        ));
    }

    #[test]
    fn serialize_roundtrip_keeps_ratchet() {
        let f = fixture();
        let alice = sender(&f, true);
        let first = alice.encrypt(b"before").unwrap();
        let bob = receiver(&f, &first, true);
        bob.decrypt(&first).unwrap();

        let state = bob.serialize().unwrap();
        let restored = SecureSession::deserialize(&state, f.env.clone()).unwrap();
        assert_eq!(restored.participant_identity(), "alice");
        assert_eq!(restored.name(), "DEFAULT");
        assert_eq!(restored.role(), SessionRole::Receiver);

        let next = alice.encrypt(b"after").unwrap();
        assert_eq!(restored.decrypt(&next).unwrap(), b"after");
    }

    #[test]
    fn invalid_utf8_is_reported() {
        let f = fixture();
        let alice = sender(&f, true);
        let first = alice.encrypt(&[0xFF, 0xFE]).unwrap();
        let bob = receiver(&f, &first, true);

        assert_eq!(bob.decrypt_string(&first), Err(SessionError::InvalidUtf8));
    }
}
