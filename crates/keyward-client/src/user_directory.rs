//! Authentication and user listing.
//!
//! Applications use this to turn a chosen user id into the bearer token the
//! key directory expects and to discover who else is registered. Sessions
//! and rotation never call it.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use keyward_core::Environment;
use thiserror::Error;

/// Errors from a user directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UserDirectoryError {
    /// Token was never issued or has been revoked
    #[error("invalid token")]
    InvalidToken,

    /// User id is empty
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    /// Backend could not be reached
    #[error("network error: {0}")]
    Network(String),
}

/// External authentication and listing service.
#[async_trait]
pub trait UserDirectory: Send + Sync + 'static {
    /// Register `user_id` if needed and issue a bearer token for it.
    async fn authenticate(&self, user_id: &str) -> Result<String, UserDirectoryError>;

    /// Registered users, sorted.
    async fn list_users(&self, token: &str) -> Result<Vec<String>, UserDirectoryError>;
}

#[derive(Default)]
struct Users {
    registered: BTreeSet<String>,
    /// token -> user id
    tokens: HashMap<String, String>,
}

/// In-memory user directory for tests and demos.
///
/// Tokens are 32 random bytes, hex encoded. Clones share state.
#[derive(Clone)]
pub struct InMemoryUserDirectory<E: Environment> {
    env: E,
    users: Arc<Mutex<Users>>,
}

impl<E: Environment> InMemoryUserDirectory<E> {
    /// Empty directory drawing tokens from `env`.
    pub fn new(env: E) -> Self {
        Self { env, users: Arc::new(Mutex::new(Users::default())) }
    }

    /// User a token was issued to.
    pub fn user_for_token(&self, token: &str) -> Option<String> {
        self.lock().tokens.get(token).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Users> {
        self.users.lock().expect("Mutex poisoned")
    }
}

#[async_trait]
impl<E: Environment> UserDirectory for InMemoryUserDirectory<E> {
    async fn authenticate(&self, user_id: &str) -> Result<String, UserDirectoryError> {
        if user_id.trim().is_empty() {
            return Err(UserDirectoryError::InvalidUserId(user_id.to_string()));
        }

        let token = hex::encode(self.env.random_key());
        let mut users = self.lock();
        users.registered.insert(user_id.to_string());
        users.tokens.insert(token.clone(), user_id.to_string());
        tracing::debug!(user = user_id, "issued token");
        Ok(token)
    }

    async fn list_users(&self, token: &str) -> Result<Vec<String>, UserDirectoryError> {
        let users = self.lock();
        if !users.tokens.contains_key(token) {
            return Err(UserDirectoryError::InvalidToken);
        }
        Ok(users.registered.iter().cloned().collect())
    }
}
