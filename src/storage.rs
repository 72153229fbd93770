//! Shared in-memory key-value store backing the `kv` service.
//!
//! One [`Store`] is shared by every connection. Keys listed as immutable are
//! seeded at construction and can never be overwritten.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{info, trace};

/// Key answered with the server version.
pub const VERSION_KEY: &str = "version";

/// Value of [`VERSION_KEY`].
pub const VERSION: &str = concat!("fastsocket kv ", env!("CARGO_PKG_VERSION"));

/// Result of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    Stored,
    /// The key is immutable; the store is unchanged.
    Rejected,
}

/// Thread-safe string store.
#[derive(Debug)]
pub struct Store {
    data: RwLock<HashMap<String, String>>,
    immutable: Vec<&'static str>,
}

impl Store {
    /// Create a store with the version key preset.
    pub fn new() -> Arc<Self> {
        let mut data = HashMap::new();
        data.insert(VERSION_KEY.to_string(), VERSION.to_string());
        info!(version = VERSION, "Initializing store");
        Arc::new(Self {
            data: RwLock::new(data),
            immutable: vec![VERSION_KEY],
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(key).cloned()
    }

    /// Insert or overwrite `key`, unless it is immutable.
    pub fn insert(&self, key: &str, value: &str) -> InsertResult {
        if self.immutable.iter().any(|k| *k == key) {
            trace!(key, "Rejected write to immutable key");
            return InsertResult::Rejected;
        }
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.insert(key.to_string(), value.to_string());
        trace!(key, "Item stored");
        InsertResult::Stored
    }

    /// Number of keys, including the preset ones.
    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_version_preset() {
        let store = Store::new();
        assert_eq!(store.get(VERSION_KEY).as_deref(), Some(VERSION));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_version_is_immutable() {
        let store = Store::new();
        assert_eq!(store.insert(VERSION_KEY, "hacked"), InsertResult::Rejected);
        assert_eq!(store.get(VERSION_KEY).as_deref(), Some(VERSION));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_insert_and_overwrite() {
        let store = Store::new();
        assert_eq!(store.insert("foo", "bar"), InsertResult::Stored);
        assert_eq!(store.get("foo").as_deref(), Some("bar"));

        store.insert("foo", "");
        assert_eq!(store.get("foo").as_deref(), Some(""));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_get_missing() {
        let store = Store::new();
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_concurrent_inserts() {
        let store = Store::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..100 {
                        store.insert(&format!("key_{t}_{i}"), "v");
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 401);
        assert_eq!(store.get("key_3_99").as_deref(), Some("v"));
    }
}
