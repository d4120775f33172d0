//! Prekey agreement between a sender and an offline receiver.
//!
//! Both sides compute the same secret from four Diffie-Hellman outputs:
//!
//! ```text
//! DH1 = DH(IK_sender,  LTK_receiver)
//! DH2 = DH(EK_sender,  IK_receiver)
//! DH3 = DH(EK_sender,  LTK_receiver)
//! DH4 = DH(EK_sender,  OTK_receiver)   only when a one-time key was used
//! SK  = HKDF(0xFF * 32 || DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! Without DH4 the session is "weak": it loses the replay protection a
//! single-use key gives the first message.

use zeroize::Zeroizing;

use crate::{
    error::CryptoError,
    kdf::derive_agreement_secret,
    keys::{IdentityKeyPair, KEY_LEN, KeyPair, identity_agreement_key},
};

/// Leading padding that separates the agreement input from raw DH outputs.
const PADDING: [u8; KEY_LEN] = [0xFF; KEY_LEN];

/// Sender side of the agreement.
pub fn sender_shared_secret(
    identity: &IdentityKeyPair,
    ephemeral: &KeyPair,
    receiver_identity_public_key: &[u8],
    receiver_long_term_public_key: &[u8; KEY_LEN],
    receiver_one_time_public_key: Option<&[u8; KEY_LEN]>,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let receiver_identity = identity_agreement_key(receiver_identity_public_key)?;

    let mut input = Zeroizing::new(Vec::with_capacity(KEY_LEN * 5));
    input.extend_from_slice(&PADDING);
    input.extend_from_slice(
        &*identity.agreement_key().diffie_hellman(receiver_long_term_public_key),
    );
    input.extend_from_slice(&*ephemeral.diffie_hellman(&receiver_identity));
    input.extend_from_slice(&*ephemeral.diffie_hellman(receiver_long_term_public_key));
    if let Some(one_time) = receiver_one_time_public_key {
        input.extend_from_slice(&*ephemeral.diffie_hellman(one_time));
    }

    Ok(derive_agreement_secret(&input))
}

/// Receiver side of the agreement.
///
/// `one_time` must be present exactly when the sender used a one-time key.
pub fn receiver_shared_secret(
    identity: &IdentityKeyPair,
    long_term: &KeyPair,
    one_time: Option<&KeyPair>,
    sender_identity_public_key: &[u8],
    sender_ephemeral_public_key: &[u8; KEY_LEN],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let sender_identity = identity_agreement_key(sender_identity_public_key)?;

    let mut input = Zeroizing::new(Vec::with_capacity(KEY_LEN * 5));
    input.extend_from_slice(&PADDING);
    input.extend_from_slice(&*long_term.diffie_hellman(&sender_identity));
    input.extend_from_slice(
        &*identity.agreement_key().diffie_hellman(sender_ephemeral_public_key),
    );
    input.extend_from_slice(&*long_term.diffie_hellman(sender_ephemeral_public_key));
    if let Some(one_time) = one_time {
        input.extend_from_slice(&*one_time.diffie_hellman(sender_ephemeral_public_key));
    }

    Ok(derive_agreement_secret(&input))
}
