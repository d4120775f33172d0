//! Double ratchet state for one pairwise session.
//!
//! The root chain advances on every Diffie-Hellman step; each step seeds a
//! fresh symmetric chain. Sending chains are created lazily: receiving a new
//! peer ratchet key drops the sending chain, and the next `encrypt` performs
//! the sending half of the step with a fresh ratchet key.
//!
//! ```text
//! sender                                    receiver
//!   root = SK                                 root = SK
//!   encrypt: new R_a,                         init: DH(LTK, R_a) -> recv chain
//!     DH(R_a, LTK) -> send chain
//!                                             encrypt: new R_b,
//!                                               DH(R_b, R_a) -> send chain
//!   decrypt: DH(R_a, R_b) -> recv chain
//! ```
//!
//! Skipped message keys are not retained. A message older than the receiving
//! chain position is rejected, and a message on a superseded ratchet key
//! fails authentication.

use keyward_crypto::{
    ChainKey, KEY_LEN, KeyPair, NONCE_SIZE, derive_root_and_chain, open, seal,
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use super::message::{MessageHeader, RegularMessage};
use crate::error::SessionError;

/// Our current ratchet key pair, stored as raw bytes so the state can be
/// persisted.
#[derive(Clone, Serialize, Deserialize)]
struct OwnRatchetKey {
    private: [u8; KEY_LEN],
    public: [u8; KEY_LEN],
}

impl OwnRatchetKey {
    fn from_seed(seed: [u8; KEY_LEN]) -> Self {
        let public = KeyPair::from_random(seed).public_key();
        Self { private: seed, public }
    }

    fn from_key_pair(pair: &KeyPair) -> Self {
        let mut private = [0u8; KEY_LEN];
        private.copy_from_slice(&pair.private_key());
        Self { private, public: pair.public_key() }
    }

    fn key_pair(&self) -> KeyPair {
        KeyPair::from_random(self.private)
    }
}

impl Drop for OwnRatchetKey {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

/// Ratchet state shared by both session roles.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct RatchetState {
    root_key: [u8; 32],
    /// `None` only for a sender that has not encrypted yet
    own_ratchet: Option<OwnRatchetKey>,
    /// Latest ratchet key seen from the peer (the long-term key before the
    /// peer's first reply)
    peer_ratchet: [u8; KEY_LEN],
    sending: Option<ChainKey>,
    /// Chain bound to `peer_ratchet`
    receiving: Option<ChainKey>,
}

impl RatchetState {
    /// State of the session initiator.
    ///
    /// The receiver's long-term key plays the part of its first ratchet key.
    pub(crate) fn initialize_sender(
        shared_secret: &[u8; 32],
        receiver_long_term_key: [u8; KEY_LEN],
    ) -> Self {
        Self {
            root_key: *shared_secret,
            own_ratchet: None,
            peer_ratchet: receiver_long_term_key,
            sending: None,
            receiving: None,
        }
    }

    /// State of the responder, with the receiving half of the first ratchet
    /// step already applied to the sender's ratchet key.
    pub(crate) fn initialize_receiver(
        shared_secret: &[u8; 32],
        long_term: &KeyPair,
        sender_ratchet_key: [u8; KEY_LEN],
    ) -> Self {
        let mut state = Self {
            root_key: *shared_secret,
            own_ratchet: Some(OwnRatchetKey::from_key_pair(long_term)),
            peer_ratchet: sender_ratchet_key,
            sending: None,
            receiving: None,
        };
        state.receiving = Some(state.step_root(&long_term.diffie_hellman(&sender_ratchet_key)));
        state
    }

    /// Encrypt one message.
    ///
    /// `next_ratchet_seed` is only consumed when a new sending chain has to
    /// be created.
    pub(crate) fn encrypt(
        &mut self,
        plaintext: &[u8],
        identities: &[u8],
        next_ratchet_seed: [u8; KEY_LEN],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<RegularMessage, SessionError> {
        let (ratchet_key, mut sending) = match (self.own_ratchet.as_ref(), self.sending.take()) {
            (Some(own), Some(chain)) => (own.public, chain),
            _ => {
                let own = OwnRatchetKey::from_seed(next_ratchet_seed);
                let dh = own.key_pair().diffie_hellman(&self.peer_ratchet);
                let chain = self.step_root(&dh);
                let public = own.public;
                self.own_ratchet = Some(own);
                (public, chain)
            },
        };

        let advanced = sending.advance();
        self.sending = Some(sending);
        let message_key = advanced?;
        let header = MessageHeader { ratchet_key, generation: message_key.generation() };
        let associated = associated_data(identities, &header);
        let ciphertext = seal(&message_key, nonce, plaintext, &associated);

        Ok(RegularMessage { header, nonce: *nonce, ciphertext })
    }

    /// Decrypt one message.
    ///
    /// On error the state may be partially advanced; callers run this on a
    /// copy and keep it only on success.
    pub(crate) fn decrypt(
        &mut self,
        message: &RegularMessage,
        identities: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let header = &message.header;

        if header.ratchet_key != self.peer_ratchet {
            let own = self.own_ratchet.as_ref().ok_or(SessionError::NoReceivingChain)?;
            let dh = own.key_pair().diffie_hellman(&header.ratchet_key);
            self.peer_ratchet = header.ratchet_key;
            self.receiving = Some(self.step_root(&dh));
            self.sending = None;
        }

        let receiving = self.receiving.as_mut().ok_or(SessionError::NoReceivingChain)?;
        let message_key = receiving.advance_to(header.generation)?;

        Ok(open(
            &message_key,
            &message.nonce,
            &message.ciphertext,
            &associated_data(identities, header),
        )?)
    }

    /// Advance the root chain with a DH output and return the new chain.
    fn step_root(&mut self, dh_output: &[u8; 32]) -> ChainKey {
        let (next_root, mut chain_seed) = derive_root_and_chain(&self.root_key, dh_output);
        self.root_key.zeroize();
        self.root_key = next_root;

        let chain = ChainKey::new(&chain_seed);
        chain_seed.zeroize();
        chain
    }
}

impl Drop for RatchetState {
    fn drop(&mut self) {
        self.root_key.zeroize();
    }
}

fn associated_data(identities: &[u8], header: &MessageHeader) -> Vec<u8> {
    let header_bytes = header.to_bytes();
    let mut data = Vec::with_capacity(identities.len() + header_bytes.len());
    data.extend_from_slice(identities);
    data.extend_from_slice(&header_bytes);
    data
}

#[cfg(test)]
mod tests {
    use keyward_crypto::CryptoError;

    use super::*;

    const IDENTITIES: &[u8] = b"alice-identity||bob-identity";

    fn pair() -> (RatchetState, RatchetState, KeyPair) {
        let secret = [9u8; 32];
        let long_term = KeyPair::from_random([4u8; 32]);
        let mut alice = RatchetState::initialize_sender(&secret, long_term.public_key());

        let first = alice.encrypt(b"hello", IDENTITIES, [1u8; 32], &[0u8; NONCE_SIZE]).unwrap();
        let mut bob =
            RatchetState::initialize_receiver(&secret, &long_term, first.header.ratchet_key);
        assert_eq!(bob.decrypt(&first, IDENTITIES).unwrap(), b"hello");

        (alice, bob, long_term)
    }

    #[test]
    fn sender_creates_chain_lazily() {
        let alice = RatchetState::initialize_sender(&[1u8; 32], [2u8; KEY_LEN]);
        assert!(alice.sending.is_none());
        assert!(alice.own_ratchet.is_none());
    }

    #[test]
    fn existing_sending_chain_ignores_new_seed() {
        let (mut alice, mut bob, _) = pair();
        let ratchet_key = alice.own_ratchet.as_ref().unwrap().public;

        let second = alice.encrypt(b"two", IDENTITIES, [8u8; 32], &[6u8; NONCE_SIZE]).unwrap();
        let third = alice.encrypt(b"three", IDENTITIES, [9u8; 32], &[7u8; NONCE_SIZE]).unwrap();

        assert_eq!((second.header.ratchet_key, second.header.generation), (ratchet_key, 1));
        assert_eq!((third.header.ratchet_key, third.header.generation), (ratchet_key, 2));
        assert_eq!(alice.sending.as_ref().unwrap().generation(), 3);
        assert_eq!(bob.decrypt(&second, IDENTITIES).unwrap(), b"two");
        assert_eq!(bob.decrypt(&third, IDENTITIES).unwrap(), b"three");
    }

    #[test]
    fn reply_rotates_both_ratchets() {
        let (mut alice, mut bob, _) = pair();
        let alice_key = alice.own_ratchet.as_ref().unwrap().public;

        let reply = bob.encrypt(b"hi", IDENTITIES, [2u8; 32], &[1u8; NONCE_SIZE]).unwrap();
        assert_ne!(reply.header.ratchet_key, alice_key);
        assert_eq!(alice.decrypt(&reply, IDENTITIES).unwrap(), b"hi");

        // Alice's next message needs a new ratchet key.
        assert!(alice.sending.is_none());
        let next = alice.encrypt(b"again", IDENTITIES, [3u8; 32], &[2u8; NONCE_SIZE]).unwrap();
        assert_ne!(next.header.ratchet_key, alice_key);
        assert_eq!(bob.decrypt(&next, IDENTITIES).unwrap(), b"again");
    }

    #[test]
    fn skipped_messages_are_discarded() {
        let (mut alice, mut bob, _) = pair();

        let skipped = alice.encrypt(b"one", IDENTITIES, [0u8; 32], &[3u8; NONCE_SIZE]).unwrap();
        let delivered = alice.encrypt(b"two", IDENTITIES, [0u8; 32], &[4u8; NONCE_SIZE]).unwrap();

        assert_eq!(bob.decrypt(&delivered, IDENTITIES).unwrap(), b"two");
        assert!(matches!(
            bob.decrypt(&skipped, IDENTITIES),
            Err(SessionError::Crypto(CryptoError::MessageTooOld { .. }))
        ));
    }

    #[test]
    fn wrong_identities_fail_authentication() {
        let (mut alice, mut bob, _) = pair();
        let message = alice.encrypt(b"x", IDENTITIES, [0u8; 32], &[5u8; NONCE_SIZE]).unwrap();

        assert!(matches!(
            bob.decrypt(&message, b"mallory"),
            Err(SessionError::Crypto(CryptoError::DecryptionFailed { .. }))
        ));
    }

    #[test]
    fn sender_without_ratchet_has_no_receiving_chain() {
        let mut alice = RatchetState::initialize_sender(&[1u8; 32], [2u8; KEY_LEN]);
        let message = RegularMessage {
            header: MessageHeader { ratchet_key: [7u8; KEY_LEN], generation: 0 },
            nonce: [0u8; NONCE_SIZE],
            ciphertext: vec![0u8; 32],
        };

        assert_eq!(alice.decrypt(&message, IDENTITIES), Err(SessionError::NoReceivingChain));
    }
}
