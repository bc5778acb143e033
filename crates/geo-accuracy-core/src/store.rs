use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::{AccuracyStat, Clock, ContextKey, SystemClock};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored stat is corrupt: {0}")]
    Corrupt(String),
}

/// Persistence of accuracy stats keyed by [`ContextKey`].
///
/// `update` is the only serialized read-modify-write path; `get_or_create` and `save`
/// are single-step operations.
pub trait StatStore: Send + Sync {
    /// Look up a stat without creating it.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read.
    fn get(&self, key: &ContextKey) -> Result<Option<AccuracyStat>, StoreError>;

    /// Return the stat for `key`, persisting a zeroed record first if none exists.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backend cannot be read or written.
    fn get_or_create(&self, key: &ContextKey) -> Result<AccuracyStat, StoreError>;

    /// Upsert `stat`, refreshing `updated_at` from the store clock.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the write fails; nothing is persisted in that case.
    fn save(&self, stat: &AccuracyStat) -> Result<(), StoreError>;

    /// Run `apply` against the current stat for `key` while holding that key exclusively,
    /// then persist the stat it returns. When `apply` fails nothing is written.
    ///
    /// # Errors
    /// Returns the error from `apply`, or a converted [`StoreError`] from the backend.
    fn update<T, E, F>(&self, key: &ContextKey, apply: F) -> Result<T, E>
    where
        F: FnOnce(&AccuracyStat) -> Result<(T, AccuracyStat), E>,
        E: From<StoreError>;
}

type Slot = Arc<Mutex<Option<AccuracyStat>>>;

/// Process-local store with one lock per context key.
pub struct InMemoryStatStore {
    slots: RwLock<HashMap<ContextKey, Slot>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStatStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { slots: RwLock::new(HashMap::new()), clock }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots
            .values()
            .filter(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).is_some())
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &ContextKey) -> Slot {
        if let Some(slot) = self.slots.read().unwrap_or_else(PoisonError::into_inner).get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    /// Drop a slot that never received a stat. Callers must not hold the slot lock.
    fn discard_if_vacant(&self, key: &ContextKey, slot: &Slot) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let Some(mapped) = slots.get(key) else {
            return;
        };
        // One reference lives in the map and one in `slot`; any other is a pending writer.
        let unshared = Arc::ptr_eq(mapped, slot) && Arc::strong_count(slot) == 2;
        if unshared && slot.lock().unwrap_or_else(PoisonError::into_inner).is_none() {
            slots.remove(key);
        }
    }

    fn touched(&self, stat: &AccuracyStat) -> AccuracyStat {
        let mut stored = stat.clone();
        stored.updated_at = self.clock.now();
        stored
    }
}

impl StatStore for InMemoryStatStore {
    fn get(&self, key: &ContextKey) -> Result<Option<AccuracyStat>, StoreError> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        Ok(slots
            .get(key)
            .and_then(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone()))
    }

    fn get_or_create(&self, key: &ContextKey) -> Result<AccuracyStat, StoreError> {
        let slot = self.slot(key);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let stat = guard.get_or_insert_with(|| AccuracyStat::new(key.clone(), self.clock.now()));
        Ok(stat.clone())
    }

    fn save(&self, stat: &AccuracyStat) -> Result<(), StoreError> {
        let slot = self.slot(&stat.context);
        let stored = self.touched(stat);
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(stored);
        Ok(())
    }

    fn update<T, E, F>(&self, key: &ContextKey, apply: F) -> Result<T, E>
    where
        F: FnOnce(&AccuracyStat) -> Result<(T, AccuracyStat), E>,
        E: From<StoreError>,
    {
        let slot = self.slot(key);
        let result = {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let current =
                guard.clone().unwrap_or_else(|| AccuracyStat::new(key.clone(), self.clock.now()));

            match apply(&current) {
                Ok((output, mut next)) if next.context == *key => {
                    next.updated_at = self.clock.now();
                    *guard = Some(next);
                    Ok(output)
                }
                Ok((_, next)) => Err(StoreError::Backend(format!(
                    "update for {key} returned a stat keyed {}",
                    next.context
                ))
                .into()),
                Err(err) => Err(err),
            }
        };

        if result.is_err() {
            self.discard_if_vacant(key, &slot);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::{AccuracyController, AccuracyError, ContextType, FixedClock, Sample};

    #[derive(Debug)]
    enum TestError {
        Accuracy(AccuracyError),
        Store(StoreError),
    }

    impl From<StoreError> for TestError {
        fn from(err: StoreError) -> Self {
            Self::Store(err)
        }
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn mission_key(user: &str) -> ContextKey {
        ContextKey::new(ContextType::Mission, Some("mission-9"), Some(user))
    }

    fn evaluate_into(
        store: &InMemoryStatStore,
        key: &ContextKey,
        accuracy: f64,
    ) -> Result<bool, TestError> {
        let controller = AccuracyController::default();
        store.update(key, |current| {
            controller
                .evaluate(key, &Sample::new(accuracy, fixture_time()), 100.0, current)
                .map(|(decision, next)| (decision.accepted, next))
                .map_err(TestError::Accuracy)
        })
    }

    // Test IDs: TMEM-001
    #[test]
    fn get_or_create_is_idempotent_without_save() -> Result<(), StoreError> {
        let clock = Arc::new(FixedClock::new(fixture_time()));
        let store = InMemoryStatStore::with_clock(clock.clone());
        let key = mission_key("u-1");

        let first = store.get_or_create(&key)?;
        clock.advance(Duration::minutes(5));
        let second = store.get_or_create(&key)?;

        assert_eq!(first, second);
        assert_eq!(first.total_samples, 0);
        assert_eq!(first.baseline_accuracy, None);
        assert_eq!(store.len(), 1);
        Ok(())
    }

    // Test IDs: TMEM-002
    #[test]
    fn save_refreshes_updated_at_from_store_clock() -> Result<(), StoreError> {
        let clock = Arc::new(FixedClock::new(fixture_time()));
        let store = InMemoryStatStore::with_clock(clock.clone());
        let key = mission_key("u-2");

        let mut stat = store.get_or_create(&key)?;
        stat.success_streak = 3;
        clock.advance(Duration::seconds(42));
        store.save(&stat)?;

        let Some(loaded) = store.get(&key)? else {
            panic!("saved stat should be readable");
        };
        assert_eq!(loaded.success_streak, 3);
        assert_eq!(loaded.created_at, fixture_time());
        assert_eq!(loaded.updated_at, fixture_time() + Duration::seconds(42));
        Ok(())
    }

    // Test IDs: TMEM-003
    #[test]
    fn failed_update_leaves_no_trace() {
        let store = InMemoryStatStore::new();
        let key = mission_key("u-3");

        let result = evaluate_into(&store, &key, -1.0);
        assert!(matches!(result, Err(TestError::Accuracy(AccuracyError::InvalidSample(_)))));
        assert!(matches!(store.get(&key), Ok(None)));
        assert!(store.is_empty());
        assert_eq!(store.slots.read().unwrap_or_else(PoisonError::into_inner).len(), 0);
    }

    // Test IDs: TMEM-004
    #[test]
    fn update_rejects_stat_for_a_different_key() {
        let store = InMemoryStatStore::new();
        let key = mission_key("u-4");
        let other = mission_key("u-5");

        let result: Result<(), TestError> =
            store.update(&key, |current| {
                let mut next = current.clone();
                next.context = other.clone();
                Ok(((), next))
            });
        assert!(matches!(result, Err(TestError::Store(StoreError::Backend(_)))));
        assert!(matches!(store.get(&key), Ok(None)));
        assert_eq!(store.slots.read().unwrap_or_else(PoisonError::into_inner).len(), 0);
    }

    // Test IDs: TMEM-005
    #[test]
    fn rejected_updates_keep_existing_slots_and_do_not_grow_the_map() -> Result<(), TestError> {
        let store = InMemoryStatStore::new();
        let kept = mission_key("u-6");
        assert!(evaluate_into(&store, &kept, 20.0)?);

        for n in 0..50 {
            let key = mission_key(&format!("rejected-{n}"));
            assert!(matches!(
                evaluate_into(&store, &key, f64::NAN),
                Err(TestError::Accuracy(AccuracyError::InvalidSample(_)))
            ));
        }
        assert!(evaluate_into(&store, &kept, -3.0).is_err());

        assert_eq!(store.len(), 1);
        assert_eq!(store.slots.read().unwrap_or_else(PoisonError::into_inner).len(), 1);
        let Some(stat) = store.get(&kept)? else {
            panic!("accepted stat should survive later rejections");
        };
        assert_eq!(stat.total_samples, 1);
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_updates_on_one_key_lose_nothing() -> Result<(), TestError> {
        let store = InMemoryStatStore::new();
        let key = mission_key("shared");
        let threads = 8;
        let per_thread = 50;

        thread::scope(|scope| {
            let handles = (0..threads)
                .map(|index| {
                    let store = &store;
                    let key = &key;
                    scope.spawn(move || -> Result<(), TestError> {
                        for attempt in 0..per_thread {
                            let accuracy = if (index + attempt) % 3 == 0 { 150.0 } else { 20.0 };
                            evaluate_into(store, key, accuracy)?;
                        }
                        Ok(())
                    })
                })
                .collect::<Vec<_>>();

            for handle in handles {
                let Ok(result) = handle.join() else {
                    panic!("update thread panicked");
                };
                result?;
            }
            Ok::<(), TestError>(())
        })?;

        let Some(stat) = store.get(&key)? else {
            panic!("stat should exist after concurrent updates");
        };
        assert_eq!(stat.total_samples, threads * per_thread);
        assert!(stat.success_streak == 0 || stat.failure_streak == 0);
        Ok(())
    }

    // Test IDs: TCONC-002
    #[test]
    fn distinct_keys_are_tracked_independently() -> Result<(), TestError> {
        let store = InMemoryStatStore::new();
        let keys = (0..4).map(|index| mission_key(&format!("u-{index}"))).collect::<Vec<_>>();

        thread::scope(|scope| {
            for key in &keys {
                let store = &store;
                scope.spawn(move || {
                    for _ in 0..25 {
                        if let Err(err) = evaluate_into(store, key, 30.0) {
                            panic!("update failed: {err:?}");
                        }
                    }
                });
            }
        });

        for key in &keys {
            let Some(stat) = store.get(key)? else {
                panic!("stat for {key} should exist");
            };
            assert_eq!(stat.total_samples, 25);
            assert_eq!(stat.success_streak, 25);
        }
        Ok(())
    }
}
