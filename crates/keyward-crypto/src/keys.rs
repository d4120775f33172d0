//! Key pairs, key ids and identity signatures.
//!
//! Ratchet, long-term and one-time keys are X25519. Identity keys are
//! Ed25519; their X25519 form (birational map) is used only inside the
//! prekey agreement.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Length of raw public and private keys.
pub const KEY_LEN: usize = 32;

/// Length of a [`KeyId`].
pub const KEY_ID_LEN: usize = 8;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Identifier of a long-term or one-time key.
///
/// First 8 bytes of SHA-512 over the raw 32-byte public key. Local stores and
/// the remote directory compute it independently, so it never travels
/// alongside the key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId([u8; KEY_ID_LEN]);

impl KeyId {
    /// Compute the id of a raw public key.
    pub fn of(public_key: &[u8]) -> Self {
        let digest = Sha512::digest(public_key);
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&digest[..KEY_ID_LEN]);
        Self(id)
    }

    /// Wrap raw id bytes.
    pub const fn from_bytes(bytes: [u8; KEY_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse id bytes of unknown length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let id: [u8; KEY_ID_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKeyLength { expected: KEY_ID_LEN, actual: bytes.len() }
        })?;
        Ok(Self(id))
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({self})")
    }
}

/// X25519 key pair used for ratchet, long-term and one-time keys.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Build a key pair from 32 random bytes.
    ///
    /// The scalar is clamped on use, so any 32 bytes are valid.
    pub fn from_random(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a key pair from exported private key bytes.
    pub fn from_private_key(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_LEN, actual: bytes.len() })?;
        Ok(Self::from_random(raw))
    }

    /// Raw public key.
    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }

    /// Exported private key. Zeroized when dropped.
    pub fn private_key(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Id of the public half.
    pub fn key_id(&self) -> KeyId {
        KeyId::of(self.public.as_bytes())
    }

    /// X25519 with a raw remote public key.
    pub fn diffie_hellman(&self, their_public: &[u8; KEY_LEN]) -> Zeroizing<[u8; KEY_LEN]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        Zeroizing::new(shared.to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("key_id", &self.key_id()).finish_non_exhaustive()
    }
}

/// Ed25519 identity key pair.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    /// Build an identity from a 32-byte secret seed.
    pub fn from_seed(seed: [u8; KEY_LEN]) -> Self {
        Self { signing: SigningKey::from_bytes(&seed) }
    }

    /// Restore an identity from exported seed bytes.
    pub fn from_private_key(bytes: &[u8]) -> Result<Self, CryptoError> {
        let seed: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_LEN, actual: bytes.len() })?;
        Ok(Self::from_seed(seed))
    }

    /// Raw Ed25519 public key (the exported identity key).
    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.signing.verifying_key().to_bytes()
    }

    /// Exported secret seed. Zeroized when dropped.
    pub fn private_key(&self) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }

    /// X25519 form of the identity private key.
    pub(crate) fn agreement_key(&self) -> KeyPair {
        KeyPair::from_random(self.signing.to_scalar_bytes())
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair").finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature made by a raw identity public key.
pub fn verify_signature(
    identity_public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let verifying_key = verifying_key(identity_public_key)?;
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
    verifying_key.verify_strict(message, &signature).map_err(|_| CryptoError::InvalidSignature)
}

/// X25519 form of a raw Ed25519 identity public key.
pub(crate) fn identity_agreement_key(
    identity_public_key: &[u8],
) -> Result<[u8; KEY_LEN], CryptoError> {
    Ok(verifying_key(identity_public_key)?.to_montgomery().to_bytes())
}

fn verifying_key(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let raw: [u8; KEY_LEN] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength { expected: KEY_LEN, actual: bytes.len() })?;
    VerifyingKey::from_bytes(&raw)
        .map_err(|e| CryptoError::InvalidPublicKey { reason: e.to_string() })
}
