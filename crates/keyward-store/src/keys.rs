//! Stored records.

use std::fmt;

use keyward_crypto::KeyId;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Length of a group session id.
pub const GROUP_SESSION_ID_LEN: usize = 32;

/// Medium-lived key pair answering prekey handshakes.
///
/// Exactly one key is current (`outdated_from == None`) at steady state;
/// outdated keys linger for a grace period so in-flight handshakes still
/// complete.
#[derive(Clone, Serialize, Deserialize)]
pub struct LongTermKey {
    /// Id of the public half
    pub identifier: KeyId,
    /// Exported private key
    pub material: Zeroizing<Vec<u8>>,
    /// Creation time (Unix seconds)
    pub creation_time: u64,
    /// Time the key was marked outdated (Unix seconds)
    pub outdated_from: Option<u64>,
}

impl LongTermKey {
    /// New, current key.
    pub fn new(identifier: KeyId, material: Zeroizing<Vec<u8>>, creation_time: u64) -> Self {
        Self { identifier, material, creation_time, outdated_from: None }
    }
}

impl fmt::Debug for LongTermKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongTermKey")
            .field("identifier", &self.identifier)
            .field("creation_time", &self.creation_time)
            .field("outdated_from", &self.outdated_from)
            .finish_non_exhaustive()
    }
}

/// Single-use key pair.
///
/// Orphaned keys were reported used by the directory and are deleted after
/// a grace period.
#[derive(Clone, Serialize, Deserialize)]
pub struct OneTimeKey {
    /// Id of the public half
    pub identifier: KeyId,
    /// Exported private key
    pub material: Zeroizing<Vec<u8>>,
    /// Time the key was marked orphaned (Unix seconds)
    pub orphaned_from: Option<u64>,
}

impl OneTimeKey {
    /// New, active key.
    pub fn new(identifier: KeyId, material: Zeroizing<Vec<u8>>) -> Self {
        Self { identifier, material, orphaned_from: None }
    }
}

impl fmt::Debug for OneTimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneTimeKey")
            .field("identifier", &self.identifier)
            .field("orphaned_from", &self.orphaned_from)
            .finish_non_exhaustive()
    }
}

/// Serialized pairwise session.
///
/// At most one record exists per `(participant_identity, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    /// Peer identity
    pub participant_identity: String,
    /// Conversation discriminator
    pub name: String,
    /// Serialized session state
    pub state: Vec<u8>,
}

/// Serialized group session.
///
/// `epoch` and `participants_count` mirror the state so records can be
/// inspected without deserializing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGroupSession {
    /// Group session id
    pub session_id: [u8; GROUP_SESSION_ID_LEN],
    /// Current epoch
    pub epoch: u64,
    /// Participants in the current epoch, the owner included
    pub participants_count: u64,
    /// Serialized session state
    pub state: Vec<u8>,
}
