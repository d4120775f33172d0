//! Property-based tests for pairwise sessions
//!
//! 1. **Round-trip**: decrypt(encrypt(m)) == m for any conversation shape
//! 2. **Continuity**: serialize/deserialize mid-conversation produces the same
//!    ciphertexts as never pausing
//! 3. **Atomicity**: a rejected message never disturbs later decryption

use keyward_core::{
    Environment, PeerKeys, RatchetMessage, ReceiverKeys, SecureSession, SessionError, env::SimEnv,
};
use keyward_crypto::{IdentityKeyPair, KeyPair};
use proptest::prelude::*;

struct Pair {
    env: SimEnv,
    alice: SecureSession<SimEnv>,
    bob: SecureSession<SimEnv>,
}

/// Handshake with `first` as the prekey payload; returns both ends.
fn handshake(seed: u64, first: &[u8], one_time: bool) -> (Pair, Vec<u8>) {
    let env = SimEnv::new(seed);
    let alice_identity = IdentityKeyPair::from_seed(env.random_key());
    let bob_identity = IdentityKeyPair::from_seed(env.random_key());
    let long_term = KeyPair::from_random(env.random_key());
    let one_time_key = KeyPair::from_random(env.random_key());
    let long_term_public = long_term.public_key();
    let one_time_public = one_time_key.public_key();

    let alice = SecureSession::new_as_sender(
        env.clone(),
        "bob",
        "DEFAULT",
        &alice_identity,
        PeerKeys {
            identity_public_key: &bob_identity.public_key(),
            long_term_public_key: &long_term_public,
            one_time_public_key: one_time.then_some(&one_time_public),
        },
    )
    .unwrap();

    let message = alice.encrypt(first).unwrap();
    let bob = SecureSession::new_as_receiver(
        env.clone(),
        "alice",
        "DEFAULT",
        &bob_identity,
        &alice_identity.public_key(),
        ReceiverKeys { long_term: &long_term, one_time: one_time.then_some(&one_time_key) },
        &message,
    )
    .unwrap();
    let decrypted = bob.decrypt(&message).unwrap();

    (Pair { env, alice, bob }, decrypted)
}

/// One step of a conversation: who sends, and what.
fn turns() -> impl Strategy<Value = Vec<(bool, Vec<u8>)>> {
    prop::collection::vec((any::<bool>(), prop::collection::vec(any::<u8>(), 0..256)), 1..20)
}

fn send(pair: &Pair, from_alice: bool, payload: &[u8]) -> RatchetMessage {
    let sender = if from_alice { &pair.alice } else { &pair.bob };
    sender.encrypt(payload).unwrap()
}

fn receive(pair: &Pair, from_alice: bool, message: &RatchetMessage) -> Vec<u8> {
    let receiver = if from_alice { &pair.bob } else { &pair.alice };
    receiver.decrypt(message).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_roundtrip_any_conversation(
        seed in any::<u64>(),
        first in prop::collection::vec(any::<u8>(), 0..256),
        one_time in any::<bool>(),
        turns in turns(),
    ) {
        let (pair, decrypted) = handshake(seed, &first, one_time);
        prop_assert_eq!(decrypted, first);

        for (from_alice, payload) in turns {
            let message = send(&pair, from_alice, &payload);
            prop_assert_eq!(receive(&pair, from_alice, &message), payload);
        }
    }

    #[test]
    fn prop_serialization_preserves_continuity(
        seed in any::<u64>(),
        before in turns(),
        after in turns(),
    ) {
        let (paused, _) = handshake(seed, b"hello", true);
        let (steady, _) = handshake(seed, b"hello", true);

        for (from_alice, payload) in &before {
            let a = send(&paused, *from_alice, payload);
            let b = send(&steady, *from_alice, payload);
            prop_assert_eq!(&a, &b);
            receive(&paused, *from_alice, &a);
            receive(&steady, *from_alice, &b);
        }

        let restore = |session: &SecureSession<SimEnv>| {
            SecureSession::deserialize(&session.serialize().unwrap(), paused.env.clone()).unwrap()
        };
        let paused = Pair {
            alice: restore(&paused.alice),
            bob: restore(&paused.bob),
            env: paused.env.clone(),
        };

        for (from_alice, payload) in &after {
            let a = send(&paused, *from_alice, payload);
            let b = send(&steady, *from_alice, payload);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(&receive(&paused, *from_alice, &a), payload);
            receive(&steady, *from_alice, &b);
        }
    }

    #[test]
    fn prop_rejected_message_does_not_disturb_state(
        seed in any::<u64>(),
        payload in prop::collection::vec(any::<u8>(), 1..128),
        flip in any::<prop::sample::Index>(),
    ) {
        let (pair, _) = handshake(seed, b"hello", false);

        let message = pair.alice.encrypt(&payload).unwrap();
        let mut tampered = message.clone();
        let ciphertext = match &mut tampered {
            RatchetMessage::Prekey(prekey) => &mut prekey.message.ciphertext,
            RatchetMessage::Regular(regular) => &mut regular.ciphertext,
        };
        let index = flip.index(ciphertext.len());
        ciphertext[index] ^= 0x01;

        prop_assert!(matches!(pair.bob.decrypt(&tampered), Err(SessionError::Crypto(_))));
        prop_assert_eq!(pair.bob.decrypt(&message).unwrap(), payload);
    }
}

#[test]
fn message_bytes_survive_transport() {
    let (pair, _) = handshake(7, b"hello", true);

    let message = pair.bob.encrypt_string("over the wire").unwrap();
    let decoded = RatchetMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
    assert_eq!(pair.alice.decrypt_string(&decoded).unwrap(), "over the wire");
}
