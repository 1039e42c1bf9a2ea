//! Query result caching and fetch policies.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use crate::operation::Operation;

/// How a watched query consults the cache versus the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPolicy {
    /// Serve from cache when possible; go to the network only on a miss.
    #[default]
    CacheFirst,
    /// Serve cached data immediately when present, then always refresh
    /// from the network.
    CacheAndNetwork,
    /// Always go to the network, ignoring cached data.
    NetworkOnly,
    /// Serve only from cache; a miss is a failure.
    CacheOnly,
}

/// Fetch policies for watched queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchQueryOptions {
    /// Policy for the initial fetch.
    pub fetch_policy: FetchPolicy,
    /// Policy for refetches after the initial fetch settles.
    pub next_fetch_policy: FetchPolicy,
}

impl Default for WatchQueryOptions {
    /// Initial fetches serve cached data while refreshing from the network;
    /// later refetches prefer the cache.
    fn default() -> Self {
        Self {
            fetch_policy: FetchPolicy::CacheAndNetwork,
            next_fetch_policy: FetchPolicy::CacheFirst,
        }
    }
}

/// Client-wide defaults applied when a call site does not specify options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultOptions {
    /// Defaults for watched queries.
    pub watch_query: WatchQueryOptions,
}

/// In-memory cache of query results, keyed by operation identity
/// (document plus variables).
///
/// Stores only the data portion of successful responses. Interior mutability
/// keeps it shareable behind the client handle.
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: RwLock<HashMap<u64, Value>>,
}

impl QueryCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached data for an operation, if any.
    pub fn get(&self, operation: &Operation) -> Option<Value> {
        self.entries.read().get(&operation.cache_key()).cloned()
    }

    /// Stores the data of a successful response.
    pub fn store(&self, operation: &Operation, data: Value) {
        self.entries.write().insert(operation.cache_key(), data);
    }

    /// Drops the entry for an operation.
    pub fn remove(&self, operation: &Operation) {
        self.entries.write().remove(&operation.cache_key());
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_watch_options() {
        let options = WatchQueryOptions::default();
        assert_eq!(options.fetch_policy, FetchPolicy::CacheAndNetwork);
        assert_eq!(options.next_fetch_policy, FetchPolicy::CacheFirst);
    }

    #[test]
    fn test_store_and_get_by_identity() {
        let cache = QueryCache::new();
        let op = Operation::query("{ users }").variable("page", 1);

        assert!(cache.get(&op).is_none());
        cache.store(&op, json!({"users": [{"id": "1"}]}));

        let same_identity = Operation::query("{ users }").variable("page", 1);
        assert_eq!(
            cache.get(&same_identity).unwrap()["users"][0]["id"],
            "1"
        );

        let other_variables = Operation::query("{ users }").variable("page", 2);
        assert!(cache.get(&other_variables).is_none());
    }

    #[test]
    fn test_store_overwrites() {
        let cache = QueryCache::new();
        let op = Operation::query("{ counter }");
        cache.store(&op, json!({"counter": 1}));
        cache.store(&op, json!({"counter": 2}));
        assert_eq!(cache.get(&op).unwrap()["counter"], 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = QueryCache::new();
        let a = Operation::query("{ a }");
        let b = Operation::query("{ b }");
        cache.store(&a, json!({"a": true}));
        cache.store(&b, json!({"b": true}));
        assert_eq!(cache.len(), 2);

        cache.remove(&a);
        assert!(cache.get(&a).is_none());
        assert!(cache.get(&b).is_some());

        cache.clear();
        assert!(cache.is_empty());
    }
}
