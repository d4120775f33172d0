//! Production [`Environment`] backed by the OS.
//!
//! Wall-clock seconds come from `SystemTime`, sleeps from tokio and key
//! material from getrandom. Tests use `SimEnv` instead.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use keyward_core::Environment;

/// Environment for real clients.
///
/// # Panics
///
/// Panics if the OS RNG fails. Every key, nonce and group secret comes from
/// this generator, so a client without it cannot produce a single safe
/// message.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::disallowed_methods, reason = "The one place the real clock is read")]
    fn wall_clock_secs(&self) -> u64 {
        // A clock before 1970 reads as 0, which only makes keys look old.
        SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_secs())
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used, reason = "No key can be generated without the OS RNG")]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("OS random number generator failed");
    }
}
