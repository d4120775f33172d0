//! Message encryption using `XChaCha20-Poly1305`
//!
//! All functions are pure. The nonce is supplied by the caller so tests can
//! run against a seeded environment.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use crate::{chain::MessageKey, error::CryptoError};

/// `XChaCha20` nonce size (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag size (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Encrypt `plaintext` under a message key, binding `associated_data`.
///
/// Returns ciphertext with the 16-byte tag appended.
///
/// # Security
///
/// A message key is used for a single message, so nonce reuse across keys is
/// harmless. The random nonce still guards against a caller reusing a key.
pub fn seal(
    message_key: &MessageKey,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Vec<u8> {
    let cipher = XChaCha20Poly1305::new(message_key.key().into());
    let payload = Payload { msg: plaintext, aad: associated_data };

    let Ok(ciphertext) = cipher.encrypt(XNonce::from_slice(nonce), payload) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    ciphertext
}

/// Decrypt and authenticate a ciphertext produced by [`seal`].
///
/// # Errors
///
/// - `DecryptionFailed` if the tag, key or associated data do not match
pub fn open(
    message_key: &MessageKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DecryptionFailed {
            reason: format!("ciphertext shorter than tag: {} bytes", ciphertext.len()),
        });
    }

    let cipher = XChaCha20Poly1305::new(message_key.key().into());
    let payload = Payload { msg: ciphertext, aad: associated_data };

    cipher.decrypt(XNonce::from_slice(nonce), payload).map_err(|_| {
        CryptoError::DecryptionFailed { reason: "authentication failed".to_string() }
    })
}
