//! Exponential backoff around any [`RemoteKeyDirectory`].

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use keyward_core::Environment;
use keyward_crypto::KeyId;
use serde::{Deserialize, Serialize};

use crate::directory::{DirectoryError, KeyBundle, KeyUpload, RemoteKeyDirectory, UsedKeys};

/// Backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`,
    /// capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial_delay.saturating_mul(2u32.saturating_pow(attempt)).min(self.max_delay)
    }
}

/// Directory decorator retrying transient failures.
///
/// Non-transient errors and the last transient error propagate unchanged.
/// Delays go through [`Environment::sleep`].
#[derive(Clone)]
pub struct Retrying<D, E> {
    inner: D,
    env: E,
    config: RetryConfig,
}

impl<D: RemoteKeyDirectory, E: Environment> Retrying<D, E> {
    /// Wrap `inner`.
    pub fn new(inner: D, env: E, config: RetryConfig) -> Self {
        Self { inner, env, config }
    }

    /// Wrapped directory.
    pub fn inner(&self) -> &D {
        &self.inner
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, DirectoryError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, DirectoryError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    let delay = self.config.delay(attempt);
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "directory call failed, retrying"
                    );
                    self.env.sleep(delay).await;
                    attempt += 1;
                },
                result => return result,
            }
        }
    }
}

#[async_trait]
impl<D: RemoteKeyDirectory, E: Environment> RemoteKeyDirectory for Retrying<D, E> {
    async fn upload_keys(&self, upload: KeyUpload) -> Result<(), DirectoryError> {
        self.run("upload_keys", || self.inner.upload_keys(upload.clone())).await
    }

    async fn validate_keys(
        &self,
        long_term_key_id: Option<KeyId>,
        one_time_key_ids: &[KeyId],
    ) -> Result<UsedKeys, DirectoryError> {
        if long_term_key_id.is_none() && one_time_key_ids.is_empty() {
            return Ok(UsedKeys::default());
        }
        self.run("validate_keys", || self.inner.validate_keys(long_term_key_id, one_time_key_ids))
            .await
    }

    async fn fetch_key_set(&self, identity: &str) -> Result<KeyBundle, DirectoryError> {
        self.run("fetch_key_set", || self.inner.fetch_key_set(identity)).await
    }

    async fn fetch_key_sets(
        &self,
        identities: &[String],
    ) -> Result<Vec<KeyBundle>, DirectoryError> {
        self.run("fetch_key_sets", || self.inner.fetch_key_sets(identities)).await
    }

    async fn delete_keys(&self) -> Result<(), DirectoryError> {
        self.run("delete_keys", || self.inner.delete_keys()).await
    }
}

#[cfg(test)]
mod tests {
    use keyward_core::env::SimEnv;

    use super::*;
    use crate::InMemoryKeyDirectory;

    fn retrying(directory: &InMemoryKeyDirectory) -> Retrying<InMemoryKeyDirectory, SimEnv> {
        Retrying::new(directory.clone(), SimEnv::new(0), RetryConfig::default())
    }

    #[test]
    fn delay_doubles_up_to_cap() {
        let config = RetryConfig::default();
        assert_eq!(config.delay(0), Duration::from_millis(200));
        assert_eq!(config.delay(1), Duration::from_millis(400));
        assert_eq!(config.delay(4), Duration::from_millis(3200));
        assert_eq!(config.delay(5), Duration::from_secs(5));
        assert_eq!(config.delay(40), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let directory = InMemoryKeyDirectory::new();
        directory.fail_next(3);
        assert_eq!(retrying(&directory).fetch_key_sets(&[]).await, Ok(vec![]));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let directory = InMemoryKeyDirectory::new();
        directory.fail_next(4);
        assert!(matches!(
            retrying(&directory).fetch_key_sets(&[]).await,
            Err(DirectoryError::Network(_))
        ));
        // The fifth call would have succeeded.
        assert_eq!(directory.fetch_key_sets(&[]).await, Ok(vec![]));
    }

    #[tokio::test]
    async fn does_not_retry_not_found() {
        let directory = InMemoryKeyDirectory::new();
        let result = retrying(&directory).fetch_key_set("nobody").await;
        assert_eq!(result, Err(DirectoryError::NotFound { identity: "nobody".into() }));
    }

    #[tokio::test]
    async fn empty_validation_skips_the_directory() {
        let directory = InMemoryKeyDirectory::new();
        directory.fail_next(10);
        assert_eq!(retrying(&directory).validate_keys(None, &[]).await, Ok(UsedKeys::default()));
    }
}
