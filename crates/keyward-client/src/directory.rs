//! Remote key directory contract.
//!
//! The directory stores each identity's public key bundle: the identity card
//! id, one signed long-term key, and a pool of one-time keys handed out one
//! per fetch. Clients upload replacements and ask which of their keys have
//! been consumed.

use std::sync::Arc;

use async_trait::async_trait;
use keyward_crypto::{KEY_LEN, KeyId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Public key plus the identity key's signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPublicKey {
    /// Raw X25519 public key
    pub public_key: [u8; KEY_LEN],
    /// Ed25519 signature over `public_key`
    pub signature: Vec<u8>,
}

/// Key bundle published for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBundle {
    /// Identity the bundle belongs to
    pub identity: String,
    /// Raw Ed25519 identity public key
    pub identity_public_key: Vec<u8>,
    /// Current long-term key
    pub long_term_public_key: SignedPublicKey,
    /// One one-time key, consumed by this fetch
    pub one_time_public_key: Option<[u8; KEY_LEN]>,
}

/// Keys to publish.
///
/// The directory accepts a long-term key only once a card id is known, and
/// one-time keys only once a long-term key is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyUpload {
    /// Identity card id, sent on first upload and on long-term rotation
    pub identity_card_id: Option<String>,
    /// Newly rotated long-term key
    pub long_term_public_key: Option<SignedPublicKey>,
    /// New one-time keys
    pub one_time_public_keys: Vec<[u8; KEY_LEN]>,
}

/// Subset of validated key ids the directory has already handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsedKeys {
    /// The long-term key id, if it is no longer the published one
    pub used_long_term_key_id: Option<KeyId>,
    /// One-time key ids no longer held by the directory
    pub used_one_time_key_ids: Vec<KeyId>,
}

/// Errors from a remote key directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    /// Request could not be delivered or the response was not received
    #[error("network error: {0}")]
    Network(String),

    /// Directory answered with a non-success status
    #[error("directory returned status {code}: {body}")]
    Status {
        /// HTTP status code
        code: u16,
        /// Response body, truncated
        body: String,
    },

    /// No key bundle is published for the identity
    #[error("no key set published for {identity}")]
    NotFound {
        /// Identity that was looked up
        identity: String,
    },

    /// Request or response body could not be encoded/decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl DirectoryError {
    /// Returns true if retrying the request may succeed.
    ///
    /// Network failures and server-side statuses (5xx, 408, 429) are
    /// transient. Client errors and malformed bodies are not: repeating the
    /// same request would fail the same way.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { code, .. } => *code >= 500 || *code == 408 || *code == 429,
            Self::NotFound { .. } | Self::Serialization(_) => false,
        }
    }
}

/// Client side of the remote key directory.
///
/// Calls act on behalf of the authenticated identity; how the client
/// authenticates is up to the implementation.
#[async_trait]
pub trait RemoteKeyDirectory: Send + Sync + 'static {
    /// Publish keys for the authenticated identity.
    async fn upload_keys(&self, upload: KeyUpload) -> Result<(), DirectoryError>;

    /// Report which of the given keys the directory no longer holds.
    async fn validate_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
    ) -> Result<UsedKeys, DirectoryError>;

    /// Fetch one identity's bundle, consuming one of its one-time keys.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the identity has no long-term key published
    async fn fetch_key_set(&self, identity: &str) -> Result<KeyBundle, DirectoryError>;

    /// Fetch bundles for several identities.
    ///
    /// Identities without a published bundle are left out, so callers must
    /// check the result against the request.
    async fn fetch_key_sets(&self, identities: &[String]) -> Result<Vec<KeyBundle>, DirectoryError>;

    /// Delete every key of the authenticated identity.
    async fn delete_keys(&self) -> Result<(), DirectoryError>;
}

#[async_trait]
impl<D: RemoteKeyDirectory> RemoteKeyDirectory for Arc<D> {
    async fn upload_keys(&self, upload: KeyUpload) -> Result<(), DirectoryError> {
        (**self).upload_keys(upload).await
    }

    async fn validate_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
    ) -> Result<UsedKeys, DirectoryError> {
        (**self).validate_keys(long_term_key_id, one_time_key_ids).await
    }

    async fn fetch_key_set(&self, identity: &str) -> Result<KeyBundle, DirectoryError> {
        (**self).fetch_key_set(identity).await
    }

    async fn fetch_key_sets(
        &self,
        identities: &[String],
    ) -> Result<Vec<KeyBundle>, DirectoryError> {
        (**self).fetch_key_sets(identities).await
    }

    async fn delete_keys(&self) -> Result<(), DirectoryError> {
        (**self).delete_keys().await
    }
}
