//! Clock, sleep and entropy behind one trait.
//!
//! Key timestamps, retry backoff and every generated secret go through
//! [`Environment`], so rotation schedules and handshakes replay exactly under
//! [`SimEnv`] while real clients plug in the OS.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Source of time and randomness for sessions, rotation and directories.
///
/// Implementors must keep `wall_clock_secs` from running backwards within a
/// process, and production implementors must draw `random_bytes` from a
/// CSPRNG. None of the methods can fail; an implementor that cannot honour
/// them panics.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Seconds since the Unix epoch.
    ///
    /// Key creation and marker timestamps are persisted and compared across
    /// restarts, so they use wall-clock time.
    fn wall_clock_secs(&self) -> u64;

    /// Wait for `duration`.
    ///
    /// Only background work awaits this (delayed key replacement, retry
    /// backoff). Protocol state transitions never sleep.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// 32 random bytes, the size of every key seed and group secret.
    fn random_key(&self) -> [u8; 32] {
        let mut key = [0u8; 32];
        self.random_bytes(&mut key);
        key
    }
}

/// Replayable environment for tests.
///
/// Randomness is a SplitMix64 stream from a seed, the clock only moves on
/// [`advance`](Self::advance), and `sleep` returns at once. Clones share the
/// clock and the stream. The stream is predictable, so never hand this to a
/// real client.
#[derive(Clone, Debug)]
pub struct SimEnv {
    rng_state: Arc<AtomicU64>,
    /// Milliseconds since `DEFAULT_START_SECS`
    elapsed_ms: Arc<AtomicU64>,
}

impl SimEnv {
    /// Wall clock at creation: 2024-01-01T00:00:00Z.
    pub const DEFAULT_START_SECS: u64 = 1_704_067_200;

    /// Environment whose random stream is fixed by `seed`.
    pub fn new(seed: u64) -> Self {
        Self { rng_state: Arc::new(AtomicU64::new(seed)), elapsed_ms: Arc::new(AtomicU64::new(0)) }
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.elapsed_ms.fetch_add(millis, Ordering::SeqCst);
    }

    fn next_u64(&self) -> u64 {
        const GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

        let mut z = self.rng_state.fetch_add(GAMMA, Ordering::SeqCst).wrapping_add(GAMMA);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

impl Environment for SimEnv {
    fn wall_clock_secs(&self) -> u64 {
        Self::DEFAULT_START_SECS + self.elapsed_ms.load(Ordering::SeqCst) / 1000
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let word = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}
