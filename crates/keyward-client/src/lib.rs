//! Keyward Client
//!
//! Chat client for one identity: publishes and rotates its prekeys on a
//! remote key directory and negotiates pairwise and group sessions.
//!
//! # Components
//!
//! - [`SecureChat`]: orchestrator built from a [`SecureChatContext`]
//! - [`KeysRotator`]: reconciles local keys with the directory
//! - [`RemoteKeyDirectory`]: directory contract, with
//!   [`InMemoryKeyDirectory`] for tests and [`Retrying`] for backoff
//! - [`UserDirectory`]: authentication and user listing for applications
//! - [`SystemEnv`]: production environment
//!
//! # HTTP (optional)
//!
//! With the `http` feature enabled, [`http::HttpKeyDirectory`] talks to the
//! directory service over HTTPS.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod chat;
mod directory;
mod error;
mod memory_directory;
mod retry;
mod rotator;
mod system_env;
mod user_directory;

#[cfg(feature = "http")]
pub mod http;

pub use chat::{
    DEFAULT_SESSION_NAME, ReceivedSession, SecureChat, SecureChatConfig, SecureChatContext,
};
pub use directory::{
    DirectoryError, KeyBundle, KeyUpload, RemoteKeyDirectory, SignedPublicKey, UsedKeys,
};
pub use error::{ErrorKind, SecureChatError};
pub use keyward_core::env::Environment;
pub use memory_directory::{InMemoryKeyDirectory, MAX_ONE_TIME_KEYS};
pub use retry::{RetryConfig, Retrying};
pub use rotator::{KeysRotator, RotationError, RotationLog, RotatorConfig};
pub use system_env::SystemEnv;
pub use user_directory::{InMemoryUserDirectory, UserDirectory, UserDirectoryError};
