//! Seeded fault injection for storage backends.
//!
//! Randomly fails operations before they reach the wrapped backend, so a
//! failed call never has a partial effect. Used to check that rotation and
//! session handling leave storage consistent when any call can fail.

#![allow(clippy::disallowed_types, reason = "Fault schedule is shared between clones")]
#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::sync::{Arc, Mutex};

use keyward_crypto::KeyId;

use crate::{
    GROUP_SESSION_ID_LEN, GroupSessionStorage, LongTermKey, LongTermKeyStorage, OneTimeKey,
    OneTimeKeyStorage, SessionStorage, StorageError, StoredGroupSession, StoredSession,
};

const DEFAULT_SEED: u64 = 0x6b65_7977_6172_6421;

/// Storage backend that fails a seeded fraction of calls.
///
/// Every call is counted and rolled before it is delegated, and a failing
/// roll returns `StorageError::Io` without touching `inner`. The schedule is
/// shared between clones, so a rotator and a session store holding clones
/// see one interleaved sequence of faults.
#[derive(Clone)]
pub struct ChaoticStorage<S> {
    inner: S,
    failure_rate: f64,
    schedule: Arc<Mutex<FaultSchedule>>,
}

/// SplitMix64 stream plus a call counter.
struct FaultSchedule {
    state: u64,
    calls: usize,
}

impl FaultSchedule {
    /// Uniform sample in [0, 1) built from the top 53 bits.
    fn roll(&mut self) -> f64 {
        self.state = self.state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^= z >> 31;
        (z >> 11) as f64 / (1u64 << 53) as f64
    }
}

impl<S> ChaoticStorage<S> {
    /// Wrap `inner` using a fixed seed.
    ///
    /// # Panics
    ///
    /// If `failure_rate` lies outside `0.0..=1.0`.
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Wrap `inner`; equal seeds give equal fault sequences.
    ///
    /// # Panics
    ///
    /// If `failure_rate` lies outside `0.0..=1.0`.
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "chaos failure rate {failure_rate} outside 0.0..=1.0"
        );

        let schedule = FaultSchedule { state: seed, calls: 0 };
        Self { inner, failure_rate, schedule: Arc::new(Mutex::new(schedule)) }
    }

    /// Wrapped backend, for inspecting state after a faulty run.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Calls made so far, failed ones included.
    pub fn operation_count(&self) -> usize {
        self.schedule.lock().expect("Mutex poisoned").calls
    }

    fn inject(&self) -> Result<(), StorageError> {
        let mut schedule = self.schedule.lock().expect("Mutex poisoned");
        schedule.calls += 1;
        if schedule.roll() < self.failure_rate {
            tracing::trace!(call = schedule.calls, "injecting storage failure");
            return Err(StorageError::Io(format!("injected fault on call {}", schedule.calls)));
        }
        Ok(())
    }
}

impl<S: LongTermKeyStorage> LongTermKeyStorage for ChaoticStorage<S> {
    fn store_long_term_key(&self, key: &LongTermKey) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.store_long_term_key(key)
    }

    fn retrieve_long_term_key(&self, key_id: &KeyId) -> Result<LongTermKey, StorageError> {
        self.inject()?;
        self.inner.retrieve_long_term_key(key_id)
    }

    fn delete_long_term_key(&self, key_id: &KeyId) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.delete_long_term_key(key_id)
    }

    fn retrieve_all_long_term_keys(&self) -> Result<Vec<LongTermKey>, StorageError> {
        self.inject()?;
        self.inner.retrieve_all_long_term_keys()
    }

    fn mark_long_term_key_outdated(&self, key_id: &KeyId, from: u64) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.mark_long_term_key_outdated(key_id, from)
    }

    fn reset_long_term_keys(&self) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.reset_long_term_keys()
    }
}

impl<S: OneTimeKeyStorage> OneTimeKeyStorage for ChaoticStorage<S> {
    fn load_one_time_keys(&self) -> Result<Vec<OneTimeKey>, StorageError> {
        self.inject()?;
        self.inner.load_one_time_keys()
    }

    fn save_one_time_keys(&self, keys: &[OneTimeKey]) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.save_one_time_keys(keys)
    }
}

impl<S: SessionStorage> SessionStorage for ChaoticStorage<S> {
    fn store_session(&self, session: &StoredSession) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.store_session(session)
    }

    fn retrieve_session(
        &self,
        participant_identity: &str,
        name: &str,
    ) -> Result<Option<StoredSession>, StorageError> {
        self.inject()?;
        self.inner.retrieve_session(participant_identity, name)
    }

    fn delete_session(&self, participant_identity: &str, name: &str) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.delete_session(participant_identity, name)
    }

    fn delete_sessions(&self, participant_identity: &str) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.delete_sessions(participant_identity)
    }

    fn reset_sessions(&self) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.reset_sessions()
    }
}

impl<S: GroupSessionStorage> GroupSessionStorage for ChaoticStorage<S> {
    fn store_group_session(&self, session: &StoredGroupSession) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.store_group_session(session)
    }

    fn retrieve_group_session(
        &self,
        session_id: &[u8; GROUP_SESSION_ID_LEN],
    ) -> Result<Option<StoredGroupSession>, StorageError> {
        self.inject()?;
        self.inner.retrieve_group_session(session_id)
    }

    fn delete_group_session(
        &self,
        session_id: &[u8; GROUP_SESSION_ID_LEN],
    ) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.delete_group_session(session_id)
    }

    fn reset_group_sessions(&self) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.reset_group_sessions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStorage;

    #[test]
    fn test_zero_rate_never_fails() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 0.0);
        for _ in 0..100 {
            storage.reset_sessions().unwrap();
        }
        assert_eq!(storage.operation_count(), 100);
    }

    #[test]
    fn test_full_rate_always_fails_without_side_effects() {
        let storage = ChaoticStorage::new(MemoryStorage::new(), 1.0);
        let result = storage.store_session(&StoredSession {
            participant_identity: "alice".to_string(),
            name: "DEFAULT".to_string(),
            state: vec![],
        });

        assert_eq!(result, Err(StorageError::Io("injected fault on call 1".to_string())));
        assert_eq!(storage.inner().session_count(), 0);
    }

    #[test]
    fn test_same_seed_same_failures() {
        let outcomes = |seed| {
            let storage = ChaoticStorage::with_seed(MemoryStorage::new(), 0.5, seed);
            (0..64).map(|_| storage.load_one_time_keys().is_err()).collect::<Vec<_>>()
        };

        assert_eq!(outcomes(7), outcomes(7));
        assert!(outcomes(7).contains(&true));
        assert!(outcomes(7).contains(&false));
    }

    #[test]
    #[should_panic(expected = "outside 0.0..=1.0")]
    fn test_rejects_rate_out_of_range() {
        let _ = ChaoticStorage::new(MemoryStorage::new(), 1.5);
    }
}
