//! Best-effort key-value store for address caching and access metrics.
//!
//! Nothing stored here is authoritative: readers fall back to a live
//! computation on any failure, writers log and carry on.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("value for '{0}' is not an integer")]
    NotAnInteger(String),
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove a key, returning whether it was present.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Increment an integer counter (missing keys start at zero).
    fn incr(&self, key: &str) -> Result<i64, StoreError>;
}

/// Cache key holding a sandbox's resolved address.
pub fn address_key(id: &str) -> String {
    format!("sandbox:{}", id)
}

/// Metrics key holding the last access timestamp (RFC 3339).
pub fn last_access_key(id: &str) -> String {
    format!("agent:{}:last", id)
}

/// Metrics key holding the request counter.
pub fn request_count_key(id: &str) -> String {
    format!("agent:{}:requests", id)
}

/// Every key owned by a sandbox, in eviction order.
pub fn sandbox_keys(id: &str) -> [String; 3] {
    [address_key(id), last_access_key(id), request_count_key(id)]
}

/// In-process store. Shared between the proxy and the API in one server.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, StoreError> {
        self.entries
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.lock()?;
        let current = match entries.get(key) {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| StoreError::NotAnInteger(key.to_string()))?,
            None => 0,
        };
        let next = current + 1;
        entries.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced() {
        assert_eq!(address_key("abc"), "sandbox:abc");
        assert_eq!(last_access_key("abc"), "agent:abc:last");
        assert_eq!(request_count_key("abc"), "agent:abc:requests");
    }

    #[test]
    fn test_memory_store_incr_and_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n").unwrap(), 1);
        assert_eq!(store.incr("n").unwrap(), 2);
        assert_eq!(store.get("n").unwrap().as_deref(), Some("2"));
        assert!(store.delete("n").unwrap());
        assert!(!store.delete("n").unwrap());
    }

    #[test]
    fn test_incr_rejects_non_integer() {
        let store = MemoryStore::new();
        store.set("n", "ten").unwrap();
        assert!(matches!(store.incr("n"), Err(StoreError::NotAnInteger(_))));
    }
}
