//! Per-epoch participant chains.
//!
//! Every participant has its own symmetric chain per epoch, derived from the
//! epoch secret. A new epoch re-derives all chains.

use keyward_crypto::{ChainKey, MessageKey, derive_group_sender_seed};
use serde::{Deserialize, Serialize};

use super::message::SESSION_ID_LEN;
use crate::{card::CARD_ID_LEN, error::GroupSessionError};

/// Participant identity as it enters an epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Member {
    pub(crate) id: [u8; CARD_ID_LEN],
    pub(crate) identity_public_key: Vec<u8>,
}

#[derive(Clone, Serialize, Deserialize)]
struct Participant {
    id: [u8; CARD_ID_LEN],
    identity_public_key: Vec<u8>,
    chain: ChainKey,
}

/// Chains of all participants for one epoch.
///
/// # Invariants
///
/// - Participants are sorted by id and unique
/// - Chain generations only increase
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct EpochKeys {
    epoch: u64,
    participants: Vec<Participant>,
}

impl EpochKeys {
    /// Derive chains for `members` from the epoch secret.
    pub(crate) fn initialize(
        epoch_secret: &[u8; 32],
        session_id: &[u8; SESSION_ID_LEN],
        epoch: u64,
        members: Vec<Member>,
    ) -> Self {
        let mut participants: Vec<Participant> = members
            .into_iter()
            .map(|member| {
                let seed = derive_group_sender_seed(epoch_secret, session_id, epoch, &member.id);
                Participant {
                    id: member.id,
                    identity_public_key: member.identity_public_key,
                    chain: ChainKey::new(&seed),
                }
            })
            .collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants.dedup_by(|a, b| a.id == b.id);

        Self { epoch, participants }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn member_count(&self) -> usize {
        self.participants.len()
    }

    /// Members without their chains, for carrying into the next epoch.
    pub(crate) fn members(&self) -> Vec<Member> {
        self.participants
            .iter()
            .map(|p| Member { id: p.id, identity_public_key: p.identity_public_key.clone() })
            .collect()
    }

    pub(crate) fn identity_public_key(&self, id: &[u8; CARD_ID_LEN]) -> Option<&[u8]> {
        self.find(id).ok().map(|index| self.participants[index].identity_public_key.as_slice())
    }

    /// Next message key of a participant's chain.
    pub(crate) fn advance(
        &mut self,
        id: &[u8; CARD_ID_LEN],
    ) -> Result<MessageKey, GroupSessionError> {
        let index = self.find(id).map_err(|_| unknown(id))?;
        Ok(self.participants[index].chain.advance()?)
    }

    /// Message key at `generation`, committed to the chain only if
    /// `accept` succeeds with it.
    pub(crate) fn advance_to_with<T>(
        &mut self,
        id: &[u8; CARD_ID_LEN],
        generation: u32,
        accept: impl FnOnce(&MessageKey) -> Result<T, GroupSessionError>,
    ) -> Result<T, GroupSessionError> {
        let index = self.find(id).map_err(|_| unknown(id))?;

        let mut chain = self.participants[index].chain.clone();
        let message_key = chain.advance_to(generation)?;
        let value = accept(&message_key)?;

        self.participants[index].chain = chain;
        Ok(value)
    }

    fn find(&self, id: &[u8; CARD_ID_LEN]) -> Result<usize, usize> {
        self.participants.binary_search_by(|p| p.id.cmp(id))
    }
}

fn unknown(id: &[u8; CARD_ID_LEN]) -> GroupSessionError {
    GroupSessionError::UnknownParticipant(hex::encode(id))
}
