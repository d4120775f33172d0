//! Key derivation using HKDF-SHA256

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Label for the prekey agreement
const AGREEMENT_LABEL: &[u8] = b"keywardAgreementV1";

/// Label for root chain steps
const ROOT_LABEL: &[u8] = b"keywardRootV1";

/// Label for group sender chain seeds
const GROUP_SENDER_LABEL: &[u8] = b"keywardGroupSenderV1";

/// Derive the initial root key from concatenated agreement outputs.
pub(crate) fn derive_agreement_secret(input_key_material: &[u8]) -> Zeroizing<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, input_key_material);

    let mut secret = Zeroizing::new([0u8; 32]);
    let Ok(()) = hkdf.expand(AGREEMENT_LABEL, &mut *secret) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    secret
}

/// Advance the root chain with a ratchet Diffie-Hellman output.
///
/// Returns `(next_root_key, chain_seed)`.
///
/// # Security
///
/// - The root key is the HKDF salt, so an attacker needs both the previous
///   root and the DH output to predict the next chain
/// - Deterministic: both peers reach the same root from the same DH output
pub fn derive_root_and_chain(root_key: &[u8; 32], dh_output: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key), dh_output);

    let mut okm = Zeroizing::new([0u8; 64]);
    let Ok(()) = hkdf.expand(ROOT_LABEL, &mut *okm) else {
        unreachable!("64 bytes is a valid HKDF-SHA256 output length");
    };

    let mut next_root = [0u8; 32];
    let mut chain_seed = [0u8; 32];
    next_root.copy_from_slice(&okm[..32]);
    chain_seed.copy_from_slice(&okm[32..]);
    (next_root, chain_seed)
}

/// Derive a participant's chain seed for one group epoch.
///
/// Unique per (session, epoch, participant): participants never share a
/// chain, and a new epoch re-derives every chain from the new secret.
pub fn derive_group_sender_seed(
    epoch_secret: &[u8],
    session_id: &[u8],
    epoch: u64,
    participant_id: &[u8],
) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(Some(session_id), epoch_secret);

    // label || epoch || participant_id
    let mut info = Vec::with_capacity(GROUP_SENDER_LABEL.len() + 8 + participant_id.len());
    info.extend_from_slice(GROUP_SENDER_LABEL);
    info.extend_from_slice(&epoch.to_be_bytes());
    info.extend_from_slice(participant_id);

    let mut seed = [0u8; 32];
    let Ok(()) = hkdf.expand(&info, &mut seed) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    seed
}
