use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Keyed values that expire after a caller-chosen time-to-live.
///
/// The lock is not held while a value is computed, so two callers racing on a
/// cold key may both compute; the later insert wins.
#[derive(Debug, Default)]
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str, ttl: Duration) -> Option<V> {
        let entries = self.lock();
        entries
            .get(key)
            .filter(|(stored_at, _)| stored_at.elapsed() < ttl)
            .map(|(_, value)| value.clone())
    }

    pub fn insert(&self, key: &str, value: V) {
        self.lock()
            .insert(key.to_string(), (Instant::now(), value));
    }

    /// Return the cached value for `key`, or compute, store and return a fresh one.
    /// A failed computation leaves the cache unchanged.
    pub fn get_or_try_insert_with<E, F>(&self, key: &str, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.get(key, ttl) {
            return Ok(value);
        }
        let value = compute()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic mid-insert cannot leave a half-written entry, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, (Instant, V)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn value_is_reused_within_ttl() {
        let cache = TtlCache::new();
        let calls = Cell::new(0);
        let compute = || -> Result<Vec<String>, String> {
            calls.set(calls.get() + 1);
            Ok(vec!["it".to_string()])
        };

        let ttl = Duration::from_secs(300);
        let first = cache.get_or_try_insert_with("team", ttl, compute).expect("first");
        let second = cache.get_or_try_insert_with("team", ttl, compute).expect("second");
        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn zero_ttl_always_recomputes() {
        let cache = TtlCache::new();
        let calls = Cell::new(0);
        for _ in 0..3 {
            cache
                .get_or_try_insert_with("team", Duration::ZERO, || -> Result<usize, String> {
                    calls.set(calls.get() + 1);
                    Ok(calls.get())
                })
                .expect("compute");
        }
        assert_eq!(calls.get(), 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_compute_is_not_cached() {
        let cache: TtlCache<u32> = TtlCache::new();
        let ttl = Duration::from_secs(60);
        let error = cache
            .get_or_try_insert_with("team", ttl, || Err("store offline"))
            .expect_err("must fail");
        assert_eq!(error, "store offline");
        assert!(cache.is_empty());

        let value = cache
            .get_or_try_insert_with("team", ttl, || Ok::<_, &str>(7))
            .expect("compute");
        assert_eq!(value, 7);
    }

    #[test]
    fn invalidate_and_clear_drop_entries() {
        let cache = TtlCache::new();
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.invalidate("a");
        assert_eq!(cache.get("a", Duration::from_secs(60)), None);
        assert_eq!(cache.get("b", Duration::from_secs(60)), Some(2));
        cache.clear();
        assert!(cache.is_empty());
    }
}
