//! HMAC chain stepping.
//!
//! A [`ChainKey`] yields one [`MessageKey`] per generation and replaces
//! itself with the next chain key in the same step, so a compromised chain
//! state reveals nothing about keys already handed out. Pairwise ratchets
//! keep one sending and one receiving chain; group sessions keep one chain
//! per member and epoch.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// HMAC input for the message key of the current generation
const MESSAGE_KEY_INPUT: &[u8] = &[0x01];

/// HMAC input for the following chain key
const NEXT_CHAIN_INPUT: &[u8] = &[0x02];

/// Maximum number of generations a receiver may skip in one step.
///
/// Skipped keys are not retained, so messages overtaken this way can no longer
/// be decrypted.
pub const MAX_SKIP: u32 = 1000;

/// Single-use AEAD key taken from a chain.
#[derive(Clone)]
pub struct MessageKey {
    bytes: [u8; 32],
    generation: u32,
}

impl MessageKey {
    /// Raw key for XChaCha20-Poly1305.
    pub fn key(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Generation the key belongs to; travels in message headers.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Symmetric chain position.
///
/// Persisted inside session state. Decryption steps a clone and keeps it
/// only once the message has authenticated.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChainKey {
    key: [u8; 32],
    generation: u32,
}

impl ChainKey {
    /// Chain whose generation-0 key is `seed`.
    pub fn new(seed: &[u8; 32]) -> Self {
        Self { key: *seed, generation: 0 }
    }

    /// Next generation to be handed out.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Take the message key for the current generation.
    pub fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        let generation = self.generation;
        let next_generation = generation
            .checked_add(1)
            .ok_or(CryptoError::GenerationOverflow { current: generation })?;

        let bytes = self.mac(MESSAGE_KEY_INPUT);
        let mut next = self.mac(NEXT_CHAIN_INPUT);
        self.key.copy_from_slice(&next);
        next.zeroize();
        self.generation = next_generation;

        Ok(MessageKey { bytes, generation })
    }

    /// Take the message key for `target`, dropping every key before it.
    ///
    /// Range errors leave the chain untouched.
    ///
    /// # Errors
    ///
    /// - `MessageTooOld` if `target` was already handed out
    /// - `TooManySkipped` if `target` is more than [`MAX_SKIP`] ahead
    pub fn advance_to(&mut self, target: u32) -> Result<MessageKey, CryptoError> {
        let current = self.generation;
        let Some(distance) = target.checked_sub(current) else {
            return Err(CryptoError::MessageTooOld { current, requested: target });
        };
        if distance > MAX_SKIP {
            return Err(CryptoError::TooManySkipped { current, requested: target });
        }

        for _ in 0..distance {
            self.advance()?;
        }
        self.advance()
    }

    fn mac(&self, input: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            unreachable!("HMAC-SHA256 takes keys of any length");
        };
        mac.update(input);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}
