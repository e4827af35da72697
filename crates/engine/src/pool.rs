//! Bounded TTL pool with eviction callbacks.
//!
//! Backs the active-assigned pool: bounded cardinality (inserting beyond
//! capacity pops the oldest entry, firing `on_pop`) and per-entry TTL
//! (`expire` removes every entry whose deadline has passed, firing
//! `on_expire`). Entries are kept in insertion order; refreshing an entry
//! moves it to the back.

use std::time::{Duration, Instant};

use indexmap::IndexMap;

pub type PoolCallback<V> = Box<dyn FnMut(&str, &V) + Send>;

struct Entry<V> {
    value: V,
    deadline: Instant,
}

pub struct TtlPool<V> {
    maxsize: usize,
    ttl: Duration,
    entries: IndexMap<String, Entry<V>>,
    on_expire: Option<PoolCallback<V>>,
    on_pop: Option<PoolCallback<V>>,
}

impl<V> TtlPool<V> {
    pub fn new(maxsize: usize, ttl: Duration) -> Self {
        Self {
            maxsize: maxsize.max(1),
            ttl,
            entries: IndexMap::new(),
            on_expire: None,
            on_pop: None,
        }
    }

    pub fn with_on_expire(mut self, callback: PoolCallback<V>) -> Self {
        self.on_expire = Some(callback);
        self
    }

    pub fn with_on_pop(mut self, callback: PoolCallback<V>) -> Self {
        self.on_pop = Some(callback);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn maxsize(&self) -> usize {
        self.maxsize
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key).map(|entry| &entry.value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Insert or refresh an entry; its deadline becomes `now + ttl`.
    pub fn insert(&mut self, key: String, value: V) {
        self.insert_at(Instant::now(), key, value)
    }

    pub fn insert_at(&mut self, now: Instant, key: String, value: V) {
        let deadline = now + self.ttl;
        self.entries.shift_remove(&key);
        self.entries.insert(key, Entry { value, deadline });
        while self.entries.len() > self.maxsize {
            if let Some((popped_key, popped)) = self.entries.shift_remove_index(0) {
                if let Some(callback) = &mut self.on_pop {
                    callback(&popped_key, &popped.value);
                }
            }
        }
    }

    /// Remove an entry without firing callbacks.
    pub fn pop(&mut self, key: &str) -> Option<V> {
        self.entries.shift_remove(key).map(|entry| entry.value)
    }

    /// Remove every entry whose deadline has passed, firing `on_expire`.
    /// Returns the number of expired entries.
    pub fn expire(&mut self) -> usize {
        self.expire_at(Instant::now())
    }

    pub fn expire_at(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = self.entries.shift_remove(key) {
                if let Some(callback) = &mut self.on_expire {
                    callback(key, &entry.value);
                }
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_callback(log: Arc<Mutex<Vec<String>>>) -> PoolCallback<u32> {
        Box::new(move |key, value| {
            log.lock().unwrap().push(format!("{key}={value}"));
        })
    }

    #[test]
    fn test_insert_and_get() {
        let mut pool = TtlPool::new(4, Duration::from_secs(60));
        pool.insert("a".into(), 1);
        assert_eq!(pool.get("a"), Some(&1));
        assert!(pool.contains("a"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_capacity_pops_oldest_with_callback() {
        let popped = Arc::new(Mutex::new(Vec::new()));
        let mut pool = TtlPool::new(2, Duration::from_secs(60))
            .with_on_pop(recording_callback(Arc::clone(&popped)));

        pool.insert("a".into(), 1);
        pool.insert("b".into(), 2);
        pool.insert("c".into(), 3);

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains("a"));
        assert_eq!(*popped.lock().unwrap(), vec!["a=1".to_string()]);
    }

    #[test]
    fn test_refresh_moves_entry_to_back() {
        let popped = Arc::new(Mutex::new(Vec::new()));
        let mut pool = TtlPool::new(2, Duration::from_secs(60))
            .with_on_pop(recording_callback(Arc::clone(&popped)));

        pool.insert("a".into(), 1);
        pool.insert("b".into(), 2);
        pool.insert("a".into(), 10); // refresh
        pool.insert("c".into(), 3); // should pop b, not a

        assert!(pool.contains("a"));
        assert!(!pool.contains("b"));
        assert_eq!(*popped.lock().unwrap(), vec!["b=2".to_string()]);
    }

    #[test]
    fn test_expire_removes_past_deadline_entries() {
        let expired = Arc::new(Mutex::new(Vec::new()));
        let ttl = Duration::from_secs(60);
        let mut pool =
            TtlPool::new(4, ttl).with_on_expire(recording_callback(Arc::clone(&expired)));

        let start = Instant::now();
        pool.insert_at(start, "a".into(), 1);
        pool.insert_at(start + Duration::from_secs(30), "b".into(), 2);

        assert_eq!(pool.expire_at(start + Duration::from_secs(61)), 1);
        assert!(!pool.contains("a"));
        assert!(pool.contains("b"));
        assert_eq!(*expired.lock().unwrap(), vec!["a=1".to_string()]);

        assert_eq!(pool.expire_at(start + Duration::from_secs(91)), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_refresh_extends_deadline() {
        let mut pool: TtlPool<u32> = TtlPool::new(4, Duration::from_secs(60));
        let start = Instant::now();
        pool.insert_at(start, "a".into(), 1);
        pool.insert_at(start + Duration::from_secs(50), "a".into(), 1);

        assert_eq!(pool.expire_at(start + Duration::from_secs(61)), 0);
        assert!(pool.contains("a"));
    }

    #[test]
    fn test_explicit_pop_fires_no_callback() {
        let popped = Arc::new(Mutex::new(Vec::new()));
        let mut pool = TtlPool::new(2, Duration::from_secs(60))
            .with_on_pop(recording_callback(Arc::clone(&popped)));
        pool.insert("a".into(), 1);
        assert_eq!(pool.pop("a"), Some(1));
        assert!(popped.lock().unwrap().is_empty());
    }
}
