//! Keyward Core
//!
//! Session state machines for end-to-end encrypted conversations. Nothing in
//! this crate performs I/O: randomness and time come from an
//! [`Environment`], and sessions are persisted by the caller through their
//! `serialize`/`deserialize` pairs.
//!
//! # Components
//!
//! - [`SecureSession`]: pairwise double-ratchet session, built as sender
//!   (from a key bundle) or receiver (from a prekey message)
//! - [`SecureGroupSession`]: group session with per-participant chains and
//!   epoch-versioned membership tickets
//! - [`Card`]: identity card fields sessions need (id, identity, public key)
//! - [`env::SimEnv`]: deterministic environment for tests and simulation
//!
//! # Concurrency
//!
//! Each session guards its state with its own lock, held only for CPU work.
//! Operations on one session are serialized; distinct sessions run
//! independently.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod card;
pub mod env;
mod error;
mod group;
mod session;

pub use card::{CARD_ID_LEN, Card, IdentityPublicKey, KeyAlgorithm, decode_card_id};
pub use env::Environment;
pub use error::{GroupSessionError, SessionError};
pub use group::{
    GroupMessage, GroupMessageType, GroupTicket, MAX_EPOCHS, RegularGroupMessage, SESSION_ID_LEN,
    SecureGroupSession,
};
pub use session::{
    MessageHeader, MessageType, PeerKeys, PrekeyMessage, RatchetMessage, ReceiverKeys,
    RegularMessage, SecureSession, SessionRole,
};
