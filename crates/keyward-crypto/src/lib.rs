//! Keyward Cryptographic Primitives
//!
//! Cryptographic building blocks for Keyward sessions. Functions are pure and
//! deterministic: callers provide random bytes (key seeds, nonce suffixes) so
//! protocol code stays testable with a seeded environment.
//!
//! # Key Lifecycle
//!
//! A pairwise session starts from a prekey agreement between the sender's
//! identity and ephemeral keys and the receiver's identity, long-term and
//! (optional) one-time keys. The agreed secret seeds a root chain; every
//! change of ratchet key feeds a fresh Diffie-Hellman output into the root
//! chain, which yields a new symmetric chain for that direction.
//!
//! ```text
//! Identity + Ephemeral ──┐
//!                        ▼
//! Long-term + One-time → Agreement (HKDF) → Root Key
//!                                              │
//!                    Ratchet DH ──────────────►│ HKDF
//!                                              ▼
//!                                         Chain Key
//!                                              │ HMAC
//!                                              ▼
//!                                         Message Keys → AEAD
//! ```
//!
//! Group sessions skip the agreement: each epoch carries a random secret and
//! every participant's chain is derived from it with HKDF.
//!
//! # Security
//!
//! Forward Secrecy:
//! - Chain keys are overwritten and zeroized after each step
//! - Message keys are single-use and zeroized on drop
//! - A new ratchet key pair per round trip replaces the root key
//!
//! Authenticity:
//! - XChaCha20-Poly1305 binds ciphertext to caller-supplied associated data
//! - Long-term keys are signed by the Ed25519 identity key
//!
//! Key Identity:
//! - A [`KeyId`] is the first 8 bytes of SHA-512 over the raw public key, so
//!   both sides derive the same id without exchanging it

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod aead;
mod agreement;
mod chain;
mod error;
mod kdf;
mod keys;

pub use aead::{NONCE_SIZE, TAG_SIZE, open, seal};
pub use agreement::{receiver_shared_secret, sender_shared_secret};
pub use chain::{ChainKey, MAX_SKIP, MessageKey};
pub use error::CryptoError;
pub use kdf::{derive_group_sender_seed, derive_root_and_chain};
pub use keys::{
    IdentityKeyPair, KEY_ID_LEN, KEY_LEN, KeyId, KeyPair, SIGNATURE_LEN, verify_signature,
};
