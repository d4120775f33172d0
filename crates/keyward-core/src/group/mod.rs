//! Group secure sessions.
//!
//! Membership is versioned by epochs. Each epoch is established by a
//! [`GroupTicket`] that every member receives over a pairwise session, and
//! every member derives one sending chain per participant from it.
//!
//! ```text
//! ticket(E0) ──► session ──update(E1)──► ... ──update(En)──►
//!                  │                            │
//!                  └── keeps the last MAX_EPOCHS epochs for late messages
//! ```
//!
//! Epochs advance by exactly one per [`update_participants`] call. The
//! session detects out-of-order tickets; callers serialize ticket
//! application per session.
//!
//! [`update_participants`]: SecureGroupSession::update_participants

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

mod epoch;
mod message;

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use epoch::{EpochKeys, Member};
use keyward_crypto::{IdentityKeyPair, NONCE_SIZE, open, seal, verify_signature};
pub use message::{GroupMessage, GroupMessageType, GroupTicket, RegularGroupMessage, SESSION_ID_LEN};
use serde::{Deserialize, Serialize};

use crate::{
    card::{CARD_ID_LEN, Card, KeyAlgorithm, decode_card_id},
    env::Environment,
    error::GroupSessionError,
};

/// Number of epochs a session keeps keys for.
pub const MAX_EPOCHS: usize = 5;

#[derive(Clone, Serialize, Deserialize)]
struct GroupState {
    session_id: [u8; SESSION_ID_LEN],
    my_id: [u8; CARD_ID_LEN],
    current: EpochKeys,
    /// Earlier epochs kept for late messages, oldest first
    previous: VecDeque<EpochKeys>,
}

impl GroupState {
    fn new(session_id: [u8; SESSION_ID_LEN], my_id: [u8; CARD_ID_LEN], keys: EpochKeys) -> Self {
        Self { session_id, my_id, current: keys, previous: VecDeque::new() }
    }

    fn epoch_mut(&mut self, epoch: u64) -> Option<&mut EpochKeys> {
        if self.current.epoch() == epoch {
            return Some(&mut self.current);
        }
        self.previous.iter_mut().find(|keys| keys.epoch() == epoch)
    }

    /// Make `keys` current, keeping at most `MAX_EPOCHS` epochs in total.
    fn advance(&mut self, keys: EpochKeys) {
        let retired = std::mem::replace(&mut self.current, keys);
        self.previous.push_back(retired);
        while self.previous.len() >= MAX_EPOCHS {
            self.previous.pop_front();
        }
    }

    fn check_session(&self, ticket: &GroupTicket) -> Result<(), GroupSessionError> {
        if ticket.session_id == self.session_id {
            Ok(())
        } else {
            Err(GroupSessionError::SessionIdMismatch)
        }
    }
}

/// Multi-party session with epoch-based membership.
pub struct SecureGroupSession<E: Environment> {
    env: E,
    identity: IdentityKeyPair,
    state: Mutex<GroupState>,
}

impl<E: Environment> SecureGroupSession<E> {
    /// Join a group from a ticket.
    ///
    /// `cards` are the other participants; the local member is added
    /// implicitly under `my_id`.
    ///
    /// # Errors
    ///
    /// - `InvalidMessageType` unless `ticket` is a `GroupInfo` message
    /// - `InvalidCardId` / `InvalidKeyType` for malformed participant cards
    pub fn new(
        env: E,
        identity: IdentityKeyPair,
        my_id: [u8; CARD_ID_LEN],
        ticket: &GroupMessage,
        cards: &[Card],
    ) -> Result<Self, GroupSessionError> {
        let ticket = ticket.ticket()?;
        let members = with_self(members_from_cards(cards)?, my_id, &identity);
        let keys =
            EpochKeys::initialize(&ticket.epoch_secret, &ticket.session_id, ticket.epoch, members);

        tracing::debug!(
            session_id = %hex::encode(ticket.session_id),
            epoch = ticket.epoch,
            participants = keys.member_count(),
            "group session created"
        );

        let state = GroupState::new(ticket.session_id, my_id, keys);
        Ok(Self { env, identity, state: Mutex::new(state) })
    }

    /// Fresh ticket for a new group at epoch 0.
    pub fn create_ticket(env: &E, session_id: [u8; SESSION_ID_LEN]) -> GroupMessage {
        GroupMessage::GroupInfo(GroupTicket {
            session_id,
            epoch: 0,
            epoch_secret: env.random_key(),
        })
    }

    /// Group session id.
    pub fn identifier(&self) -> [u8; SESSION_ID_LEN] {
        self.lock().session_id
    }

    /// Local member id, lowercase hex.
    pub fn my_identifier(&self) -> String {
        hex::encode(self.lock().my_id)
    }

    /// Participants in the current epoch, the local member included.
    pub fn participants_count(&self) -> usize {
        self.lock().current.member_count()
    }

    /// Current epoch.
    pub fn current_epoch(&self) -> u64 {
        self.lock().current.epoch()
    }

    /// Encrypt and sign a payload under the current epoch.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<GroupMessage, GroupSessionError> {
        let mut nonce = [0u8; NONCE_SIZE];
        self.env.random_bytes(&mut nonce);

        let mut state = self.lock();
        let session_id = state.session_id;
        let my_id = state.my_id;
        let current = &mut state.current;
        let epoch = current.epoch();
        let message_key = current.advance(&my_id)?;

        let header = message::header_bytes(&session_id, epoch, &my_id, message_key.generation());
        let mut message = RegularGroupMessage {
            session_id,
            epoch,
            sender_id: my_id,
            generation: message_key.generation(),
            nonce,
            ciphertext: seal(&message_key, &nonce, plaintext, &header),
            signature: Vec::new(),
        };
        message.signature = self.identity.sign(&message.signed_bytes()).to_vec();

        Ok(GroupMessage::Regular(message))
    }

    /// Decrypt a message from the participant holding `sender_card_id`.
    ///
    /// A failed decrypt leaves the sender's chain unchanged.
    ///
    /// # Errors
    ///
    /// - `InvalidMessageType` for tickets
    /// - `InvalidCardId` if the id is malformed or is not the message sender
    /// - `EpochNotFound` if the epoch is no longer (or not yet) held
    /// - `UnknownParticipant` if the sender was not a member in that epoch
    /// - `InvalidSignature` if the signature does not verify
    pub fn decrypt(
        &self,
        message: &GroupMessage,
        sender_card_id: &str,
    ) -> Result<Vec<u8>, GroupSessionError> {
        let GroupMessage::Regular(message) = message else {
            return Err(GroupSessionError::InvalidMessageType {
                expected: GroupMessageType::Regular,
                actual: GroupMessageType::GroupInfo,
            });
        };

        let sender_id = decode_card_id(sender_card_id)
            .ok_or_else(|| GroupSessionError::InvalidCardId(sender_card_id.to_string()))?;
        if sender_id != message.sender_id {
            return Err(GroupSessionError::InvalidCardId(sender_card_id.to_string()));
        }

        let mut state = self.lock();
        if message.session_id != state.session_id {
            return Err(GroupSessionError::SessionIdMismatch);
        }

        let keys = state
            .epoch_mut(message.epoch)
            .ok_or(GroupSessionError::EpochNotFound { epoch: message.epoch })?;

        let public_key = keys
            .identity_public_key(&sender_id)
            .ok_or_else(|| GroupSessionError::UnknownParticipant(sender_card_id.to_string()))?;
        verify_signature(public_key, &message.signed_bytes(), &message.signature)
            .map_err(|_| GroupSessionError::InvalidSignature)?;

        keys.advance_to_with(&sender_id, message.generation, |message_key| {
            Ok(open(message_key, &message.nonce, &message.ciphertext, &message.header_bytes())?)
        })
    }

    /// Encrypt a UTF-8 string.
    pub fn encrypt_string(&self, plaintext: &str) -> Result<GroupMessage, GroupSessionError> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Decrypt a message holding a UTF-8 string.
    pub fn decrypt_string(
        &self,
        message: &GroupMessage,
        sender_card_id: &str,
    ) -> Result<String, GroupSessionError> {
        String::from_utf8(self.decrypt(message, sender_card_id)?)
            .map_err(|_| GroupSessionError::InvalidUtf8)
    }

    /// Ticket for the next epoch with a fresh secret.
    ///
    /// The session itself is unchanged until the ticket is applied with
    /// [`update_participants`](Self::update_participants) or
    /// [`set_participants`](Self::set_participants).
    pub fn create_change_participants_ticket(&self) -> GroupMessage {
        let state = self.lock();
        GroupMessage::GroupInfo(GroupTicket {
            session_id: state.session_id,
            epoch: state.current.epoch() + 1,
            epoch_secret: self.env.random_key(),
        })
    }

    /// Replace the membership with `cards` (plus the local member).
    ///
    /// Accepts a ticket at the current or any later epoch and discards every
    /// older epoch.
    ///
    /// # Errors
    ///
    /// - `StaleTicket` if the ticket is behind the current epoch
    pub fn set_participants(
        &self,
        ticket: &GroupMessage,
        cards: &[Card],
    ) -> Result<(), GroupSessionError> {
        let ticket = ticket.ticket()?;
        let members = members_from_cards(cards)?;

        let mut state = self.lock();
        state.check_session(ticket)?;

        let current = state.current.epoch();
        if ticket.epoch < current {
            return Err(GroupSessionError::StaleTicket { current, ticket: ticket.epoch });
        }

        let members = with_self(members, state.my_id, &self.identity);
        let keys =
            EpochKeys::initialize(&ticket.epoch_secret, &state.session_id, ticket.epoch, members);

        tracing::debug!(
            session_id = %hex::encode(state.session_id),
            epoch = ticket.epoch,
            participants = keys.member_count(),
            "group membership replaced"
        );

        state.current = keys;
        state.previous.clear();
        Ok(())
    }

    /// Apply the next epoch's ticket, adding and removing participants.
    ///
    /// # Errors
    ///
    /// - `NotConsecutiveTicket` unless the ticket epoch is exactly one past
    ///   the current epoch
    pub fn update_participants(
        &self,
        ticket: &GroupMessage,
        add: &[Card],
        remove_card_ids: &[String],
    ) -> Result<(), GroupSessionError> {
        let ticket = ticket.ticket()?;
        let added = members_from_cards(add)?;
        let removed = remove_card_ids
            .iter()
            .map(|id| {
                decode_card_id(id).ok_or_else(|| GroupSessionError::InvalidCardId(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.lock();
        state.check_session(ticket)?;

        let current = state.current.epoch();
        if current.checked_add(1) != Some(ticket.epoch) {
            return Err(GroupSessionError::NotConsecutiveTicket { current, ticket: ticket.epoch });
        }

        let mut members = state.current.members();
        members.retain(|member| !removed.contains(&member.id));
        members.extend(added);

        let keys =
            EpochKeys::initialize(&ticket.epoch_secret, &state.session_id, ticket.epoch, members);

        tracing::debug!(
            session_id = %hex::encode(state.session_id),
            epoch = ticket.epoch,
            participants = keys.member_count(),
            "group epoch advanced"
        );

        state.advance(keys);
        Ok(())
    }

    /// Serialize the session. The identity private key is not included.
    pub fn serialize(&self) -> Result<Vec<u8>, GroupSessionError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(&*self.lock(), &mut bytes)
            .map_err(|e| GroupSessionError::Serialization(e.to_string()))?;
        Ok(bytes)
    }

    /// Restore a session produced by [`serialize`](Self::serialize).
    pub fn deserialize(
        bytes: &[u8],
        identity: IdentityKeyPair,
        env: E,
    ) -> Result<Self, GroupSessionError> {
        let state: GroupState = ciborium::from_reader(bytes)
            .map_err(|e| GroupSessionError::Serialization(e.to_string()))?;
        Ok(Self { env, identity, state: Mutex::new(state) })
    }

    fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock().expect("Mutex poisoned")
    }
}

impl<E: Environment> std::fmt::Debug for SecureGroupSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureGroupSession")
            .field("identifier", &hex::encode(self.identifier()))
            .field("current_epoch", &self.current_epoch())
            .finish_non_exhaustive()
    }
}

fn members_from_cards(cards: &[Card]) -> Result<Vec<Member>, GroupSessionError> {
    cards
        .iter()
        .map(|card| {
            let id = card
                .decoded_id()
                .ok_or_else(|| GroupSessionError::InvalidCardId(card.identifier.clone()))?;
            if card.public_key.algorithm != KeyAlgorithm::Ed25519 {
                return Err(GroupSessionError::InvalidKeyType);
            }
            Ok(Member { id, identity_public_key: card.public_key.export().to_vec() })
        })
        .collect()
}

fn with_self(
    mut members: Vec<Member>,
    my_id: [u8; CARD_ID_LEN],
    identity: &IdentityKeyPair,
) -> Vec<Member> {
    members.retain(|member| member.id != my_id);
    members.push(Member { id: my_id, identity_public_key: identity.public_key().to_vec() });
    members
}
